//! Run the engine against an in-memory backend.
//!
//! Connects, goes offline, sends a few messages, restores connectivity,
//! and prints what ended up locally and remotely. The local store is
//! in-memory so the configured database is never touched.

use anyhow::{bail, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use sync_client::{Config, MockBackend, SyncEngine};
use sync_core::ConnectionStatus;
use sync_store::SqliteStore;
use sync_types::{GroupId, OutgoingMessage, RowState, SendOutcome, UserId};

const STEP_LIMIT: Duration = Duration::from_secs(15);

/// Run the demo command.
pub async fn run(config: Config, group: &str, user: &str, messages: u32) -> Result<()> {
    let group = GroupId::new(group);
    let user = UserId::new(user);
    let backend = Arc::new(MockBackend::new());
    backend.insert_remote(&group, "bob", "Welcome aboard!");

    let store = SqliteStore::in_memory().await?;
    let engine = SyncEngine::with_store(config, backend.clone(), store);
    engine.start(vec![group.clone()]).await?;
    wait_for("connection", || async {
        engine.status() == ConnectionStatus::Connected
    })
    .await?;
    println!("Connected");

    let snapshot = engine.open_group(&group, &user).await?;
    println!(
        "Opened {} with {} message(s), {} unread",
        group,
        snapshot.messages.len(),
        snapshot.unread.count
    );

    println!();
    println!("Going offline");
    backend.set_online(false);
    engine.on_network_change(false);

    for i in 1..=messages {
        let message = OutgoingMessage::new(group.clone(), user.clone(), format!("Message {i}"));
        let outcome = engine.send(message).await?;
        println!("  send #{}: {}", i, describe(&outcome));
    }
    println!("Pending in outbox: {}", engine.pending_sends().await?);

    println!();
    println!("Back online");
    backend.set_online(true);
    engine.on_network_change(true);
    wait_for("outbox drain", || async {
        matches!(engine.pending_sends().await, Ok(0))
    })
    .await?;
    println!("Pending in outbox: 0");

    println!();
    println!("Timeline of {}:", group);
    let snapshot = engine.snapshot(&group, &user).await?;
    for row in &snapshot.messages {
        let marker = match row.state {
            RowState::Confirmed => ' ',
            RowState::Optimistic => '~',
            RowState::Tombstoned => 'x',
        };
        println!("  {} {:<8} {}", marker, row.author_id.as_str(), row.content);
    }
    println!("Remote rows: {}", backend.remote_count());

    engine.shutdown().await;
    Ok(())
}

fn describe(outcome: &SendOutcome) -> String {
    match outcome {
        SendOutcome::Sent(row) => format!("sent as {}", row.id),
        SendOutcome::Queued => "queued".to_string(),
        SendOutcome::PermanentlyFailed(reason) => format!("failed: {reason}"),
    }
}

async fn wait_for<F, Fut>(what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(STEP_LIMIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if waited.is_err() {
        bail!("Timed out waiting for {}", what);
    }
    Ok(())
}

//! Checkpoint the write-ahead log.

use anyhow::{Context, Result};
use sync_client::Config;
use sync_store::{CheckpointOutcome, Checkpointer, SqliteStore};

use super::status::format_bytes;

/// Run the checkpoint command.
pub async fn run(config: &Config, force: bool) -> Result<()> {
    let store = SqliteStore::open(&config.store)
        .await
        .with_context(|| format!("Failed to open {}", config.store.database.display()))?;
    let before = store.wal_size_bytes().await.unwrap_or(0);
    let checkpointer = Checkpointer::new(store.clone(), config.store.checkpoint.clone());

    let outcome = if force {
        checkpointer.force().await
    } else {
        checkpointer.run().await
    }
    .context("Checkpoint failed")?;

    match outcome {
        CheckpointOutcome::Completed { attempts, stats } => println!(
            "Checkpoint complete after {} attempt(s): {} of {} frames",
            attempts, stats.checkpointed_frames, stats.log_frames
        ),
        CheckpointOutcome::Forced { wal_bytes, stats } => println!(
            "Forced checkpoint of {} WAL: {} frames",
            format_bytes(wal_bytes),
            stats.checkpointed_frames
        ),
        CheckpointOutcome::Incomplete { attempts, .. } => println!(
            "Checkpoint incomplete after {} attempt(s); the store is busy, try again later",
            attempts
        ),
    }

    let after = store.wal_size_bytes().await.unwrap_or(0);
    println!("WAL: {} -> {}", format_bytes(before), format_bytes(after));
    store.close().await;
    Ok(())
}

//! List queued sends.

use anyhow::{Context, Result};
use sync_client::Config;
use sync_store::{OutboxStore, SqliteStore};
use sync_types::Timestamp;

/// Run the outbox command.
pub async fn run(config: &Config) -> Result<()> {
    let store = SqliteStore::open(&config.store)
        .await
        .with_context(|| format!("Failed to open {}", config.store.database.display()))?;
    let entries = store
        .all_entries()
        .await
        .context("Failed to read the outbox")?;

    if entries.is_empty() {
        println!("Outbox is empty");
        store.close().await;
        return Ok(());
    }

    let now = Timestamp::now();
    println!("{} queued send(s):", entries.len());
    for entry in &entries {
        println!(
            "  #{:<4} group {:<16} message {}  retries {}  next {}",
            entry.id,
            entry.group_id.as_str(),
            entry.payload.id,
            entry.retry_count,
            format_due(entry.next_retry_at, now)
        );
    }

    store.close().await;
    Ok(())
}

/// Describe when an entry is next due relative to `now`.
fn format_due(at: Timestamp, now: Timestamp) -> String {
    let diff = at.as_millis() - now.as_millis();
    if diff <= 0 {
        "due now".to_string()
    } else if diff < 60_000 {
        format!("in {}s", diff / 1000)
    } else {
        format!("in {} minutes", diff / 60_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_due_works() {
        let now = Timestamp::from_millis(1_000_000);
        assert_eq!(format_due(Timestamp::from_millis(999_000), now), "due now");
        assert_eq!(format_due(now.plus_millis(5_000), now), "in 5s");
        assert_eq!(format_due(now.plus_millis(180_000), now), "in 3 minutes");
    }
}

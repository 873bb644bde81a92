//! Show store statistics.

use anyhow::{Context, Result};
use sync_client::Config;
use sync_store::SqliteStore;

/// Run the status command.
pub async fn run(config: &Config) -> Result<()> {
    let store = SqliteStore::open(&config.store)
        .await
        .with_context(|| format!("Failed to open {}", config.store.database.display()))?;
    let stats = store.stats().await.context("Failed to read store statistics")?;

    println!("=== chatsync status ===");
    println!();
    println!("Store: {}", config.store.database.display());
    if stats.degraded {
        println!("  Mode: READ-ONLY (integrity check failed)");
    } else {
        println!("  Mode: read-write");
    }
    println!("  WAL:  {}", format_bytes(stats.wal_bytes));
    println!();
    println!("Messages:      {}", stats.messages);
    println!("  Optimistic:  {}", stats.optimistic);
    println!("  Tombstones:  {}", stats.tombstones);
    println!("Outbox:        {}", stats.outbox);
    println!("Read pointers: {}", stats.read_pointers);

    store.close().await;
    Ok(())
}

/// Human-readable byte count.
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_store::StoreConfig;
    use tempfile::tempdir;

    #[tokio::test]
    async fn status_on_fresh_store() {
        let dir = tempdir().unwrap();
        let config = Config {
            store: StoreConfig::at(dir.path().join("chat.db")),
            ..Config::default()
        };
        assert!(run(&config).await.is_ok());
    }

    #[test]
    fn format_bytes_works() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(16 * 1024 * 1024), "16.0 MiB");
    }
}

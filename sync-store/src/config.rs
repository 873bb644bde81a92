//! Configuration for sync-store.
//!
//! Loaded as the `[store]` section of the engine's TOML configuration.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use sync_core::Backoff;

/// Local database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
    /// Pool size (default: 4). Readers run concurrently with one writer.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// SQLite busy timeout in milliseconds (default: 5000).
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Retries of a contended write transaction (default: 5).
    #[serde(default = "default_contention_retries")]
    pub contention_retries: u32,
    /// First backoff step between contended retries in milliseconds (default: 25).
    #[serde(default = "default_contention_backoff_ms")]
    pub contention_backoff_ms: u64,
    /// WAL checkpointing.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

/// WAL checkpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointConfig {
    /// Passive checkpoint attempts per run (default: 5).
    #[serde(default = "default_checkpoint_retries")]
    pub max_retries: u32,
    /// First backoff step between attempts in milliseconds (default: 100).
    #[serde(default = "default_checkpoint_backoff_ms")]
    pub base_backoff_ms: u64,
    /// Backoff cap in milliseconds (default: 2000).
    #[serde(default = "default_checkpoint_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// WAL size that forces a blocking checkpoint (default: 16 MiB).
    #[serde(default = "default_wal_ceiling_bytes")]
    pub wal_ceiling_bytes: u64,
}

// Default value functions
fn default_database_path() -> PathBuf {
    PathBuf::from("chatsync.db")
}

fn default_max_connections() -> u32 {
    4
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_contention_retries() -> u32 {
    5
}

fn default_contention_backoff_ms() -> u64 {
    25
}

fn default_checkpoint_retries() -> u32 {
    5
}

fn default_checkpoint_backoff_ms() -> u64 {
    100
}

fn default_checkpoint_max_backoff_ms() -> u64 {
    2_000
}

fn default_wal_ceiling_bytes() -> u64 {
    16 * 1024 * 1024 // 16 MiB
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
            contention_retries: default_contention_retries(),
            contention_backoff_ms: default_contention_backoff_ms(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_retries: default_checkpoint_retries(),
            base_backoff_ms: default_checkpoint_backoff_ms(),
            max_backoff_ms: default_checkpoint_max_backoff_ms(),
            wal_ceiling_bytes: default_wal_ceiling_bytes(),
        }
    }
}

impl StoreConfig {
    /// Configuration for a database at `path`, defaults elsewhere.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            database: path.into(),
            ..Self::default()
        }
    }

    /// Busy timeout as a [`Duration`].
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Backoff between contended write retries.
    pub fn contention_backoff(&self) -> Backoff {
        let base = Duration::from_millis(self.contention_backoff_ms);
        Backoff::new(base, Duration::from_secs(1)).with_jitter(base)
    }
}

impl CheckpointConfig {
    /// Backoff between passive checkpoint attempts.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.base_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = StoreConfig::default();
        assert_eq!(config.database, PathBuf::from("chatsync.db"));
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.checkpoint.wal_ceiling_bytes, 16 * 1024 * 1024);
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
            database = "/tmp/chat.db"
            busy_timeout_ms = 250

            [checkpoint]
            max_retries = 9
        "#;

        let config: StoreConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.database, PathBuf::from("/tmp/chat.db"));
        assert_eq!(config.busy_timeout(), Duration::from_millis(250));
        assert_eq!(config.checkpoint.max_retries, 9);
        // Unset fields fall back to defaults
        assert_eq!(config.contention_retries, 5);
        assert_eq!(config.checkpoint.base_backoff_ms, 100);
    }

    #[test]
    fn checkpoint_backoff_is_capped() {
        let backoff = CheckpointConfig::default().backoff();
        assert_eq!(backoff.base_delay(1), Duration::from_millis(100));
        assert_eq!(backoff.base_delay(10), Duration::from_millis(2_000));
    }
}

//! Configuration loading for the sync engine.
//!
//! Configuration is loaded from a TOML file (default: `chatsync.toml`).
//! Every field has a default, so an empty file is a valid configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sync_core::{Backoff, FirstViewBaseline, HeartbeatConfig, ReconnectPolicy, RetryPolicy};
use sync_store::StoreConfig;

/// Root configuration for the sync engine.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Local database.
    #[serde(default)]
    pub store: StoreConfig,
    /// Send pipeline.
    #[serde(default)]
    pub outbox: OutboxConfig,
    /// Realtime connection lifecycle.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Read tracking.
    #[serde(default)]
    pub read: ReadConfig,
}

/// Send pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OutboxConfig {
    /// Retries before a queued send is dropped (default: 8).
    #[serde(default = "default_outbox_max_retries")]
    pub max_retries: u32,
    /// First retry delay in milliseconds (default: 1000).
    #[serde(default = "default_outbox_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Retry delay cap in milliseconds (default: 300000 = 5 minutes).
    #[serde(default = "default_outbox_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Timeout of one upsert attempt in milliseconds (default: 10000).
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Timeout of the pre-flight health check in milliseconds (default: 3000).
    #[serde(default = "default_preflight_timeout_ms")]
    pub preflight_timeout_ms: u64,
    /// Periodic drain interval in seconds (default: 30).
    #[serde(default = "default_drain_interval_secs")]
    pub drain_interval_secs: u64,
}

/// Connection lifecycle configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Heartbeat interval in seconds (default: 30).
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Watchdog check interval in seconds (default: 10).
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
    /// Silence after which the channel is dead, in seconds (default: 70).
    #[serde(default = "default_dead_after_secs")]
    pub dead_after_secs: u64,
    /// Window that coalesces reconnect triggers, in milliseconds (default: 1500).
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Pause before a reconnect sequence starts, in milliseconds (default: 250).
    #[serde(default = "default_stabilize_ms")]
    pub stabilize_ms: u64,
    /// Timeout of each reconnect step, in milliseconds (default: 5000).
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    /// Wait for the subscribe acknowledgement, in milliseconds (default: 10000).
    #[serde(default = "default_subscribe_ack_timeout_ms")]
    pub subscribe_ack_timeout_ms: u64,
    /// Token refresh attempts per reconnect (default: 3).
    #[serde(default = "default_token_refresh_retries")]
    pub token_refresh_retries: u32,
    /// First backoff step between token refresh attempts, in milliseconds (default: 500).
    #[serde(default = "default_token_refresh_backoff_ms")]
    pub token_refresh_backoff_ms: u64,
    /// First reconnect delay in milliseconds (default: 1000).
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    /// Reconnect delay cap in milliseconds (default: 30000).
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Random jitter added to reconnect delays, in milliseconds (default: 2000).
    #[serde(default = "default_reconnect_jitter_ms")]
    pub reconnect_jitter_ms: u64,
    /// Failed attempts before giving up until the next trigger (default: 10).
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Poll interval of the polling feed adapter, in seconds (default: 15).
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Rows per background fetch (default: 50).
    #[serde(default = "default_fetch_page_size")]
    pub fetch_page_size: u32,
}

/// Read tracking configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadConfig {
    /// Time a conversation must stay open before it counts as read, in
    /// milliseconds (default: 1500).
    #[serde(default = "default_dwell_ms")]
    pub dwell_ms: u64,
    /// Baseline placed on the first view of a group (default: "last_message").
    #[serde(default)]
    pub first_view_baseline: FirstViewBaseline,
    /// Rows loaded from the local store per group (default: 500).
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,
}

// Default value functions
fn default_outbox_max_retries() -> u32 {
    8
}

fn default_outbox_backoff_base_ms() -> u64 {
    1_000
}

fn default_outbox_backoff_max_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_send_timeout_ms() -> u64 {
    10_000
}

fn default_preflight_timeout_ms() -> u64 {
    3_000
}

fn default_drain_interval_secs() -> u64 {
    30
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_watchdog_interval_secs() -> u64 {
    10
}

fn default_dead_after_secs() -> u64 {
    70
}

fn default_debounce_ms() -> u64 {
    1_500
}

fn default_stabilize_ms() -> u64 {
    250
}

fn default_step_timeout_ms() -> u64 {
    5_000
}

fn default_subscribe_ack_timeout_ms() -> u64 {
    10_000
}

fn default_token_refresh_retries() -> u32 {
    3
}

fn default_token_refresh_backoff_ms() -> u64 {
    500
}

fn default_reconnect_base_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_reconnect_jitter_ms() -> u64 {
    2_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_poll_interval_secs() -> u64 {
    15
}

fn default_fetch_page_size() -> u32 {
    50
}

fn default_dwell_ms() -> u64 {
    1_500
}

fn default_history_limit() -> u32 {
    500
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_retries: default_outbox_max_retries(),
            backoff_base_ms: default_outbox_backoff_base_ms(),
            backoff_max_ms: default_outbox_backoff_max_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            preflight_timeout_ms: default_preflight_timeout_ms(),
            drain_interval_secs: default_drain_interval_secs(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            watchdog_interval_secs: default_watchdog_interval_secs(),
            dead_after_secs: default_dead_after_secs(),
            debounce_ms: default_debounce_ms(),
            stabilize_ms: default_stabilize_ms(),
            step_timeout_ms: default_step_timeout_ms(),
            subscribe_ack_timeout_ms: default_subscribe_ack_timeout_ms(),
            token_refresh_retries: default_token_refresh_retries(),
            token_refresh_backoff_ms: default_token_refresh_backoff_ms(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            reconnect_jitter_ms: default_reconnect_jitter_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            poll_interval_secs: default_poll_interval_secs(),
            fetch_page_size: default_fetch_page_size(),
        }
    }
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            dwell_ms: default_dwell_ms(),
            first_view_baseline: FirstViewBaseline::default(),
            history_limit: default_history_limit(),
        }
    }
}

impl OutboxConfig {
    /// Retry schedule for queued sends.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: Backoff::new(
                Duration::from_millis(self.backoff_base_ms),
                Duration::from_millis(self.backoff_max_ms),
            ),
        }
    }

    /// Timeout of one upsert attempt.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Timeout of the pre-flight health check.
    pub fn preflight_timeout(&self) -> Duration {
        Duration::from_millis(self.preflight_timeout_ms)
    }

    /// Periodic drain interval.
    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }
}

impl ConnectionConfig {
    /// Heartbeat and watchdog timing.
    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(self.heartbeat_interval_secs),
            watchdog_interval: Duration::from_secs(self.watchdog_interval_secs),
            dead_after: Duration::from_secs(self.dead_after_secs),
        }
    }

    /// Reconnect schedule.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            backoff: Backoff::new(
                Duration::from_millis(self.reconnect_base_ms),
                Duration::from_millis(self.reconnect_max_ms),
            )
            .with_jitter(Duration::from_millis(self.reconnect_jitter_ms)),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    /// Backoff between token refresh attempts.
    pub fn token_backoff(&self) -> Backoff {
        let base = Duration::from_millis(self.token_refresh_backoff_ms);
        Backoff::new(base, base.saturating_mul(8))
    }

    /// Reconnect trigger coalescing window.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Pause before a reconnect sequence.
    pub fn stabilize(&self) -> Duration {
        Duration::from_millis(self.stabilize_ms)
    }

    /// Timeout of each reconnect step.
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    /// Wait for the subscribe acknowledgement.
    pub fn subscribe_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_ack_timeout_ms)
    }

    /// Poll interval of the polling adapter.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl ReadConfig {
    /// Dwell before an open conversation counts as read.
    pub fn dwell(&self) -> Duration {
        Duration::from_millis(self.dwell_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection
            .heartbeat()
            .validate()
            .map_err(ConfigError::Invalid)?;

        if self.outbox.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "outbox.max_retries must be at least 1".into(),
            ));
        }
        if self.connection.token_refresh_retries == 0 {
            return Err(ConfigError::Invalid(
                "connection.token_refresh_retries must be at least 1".into(),
            ));
        }
        if self.connection.max_reconnect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "connection.max_reconnect_attempts must be at least 1".into(),
            ));
        }
        if self.store.checkpoint.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "store.checkpoint.max_retries must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying parse error.
        source: toml::de::Error,
    },
    /// Values parse but contradict each other.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

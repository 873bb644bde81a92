//! WAL checkpointing.
//!
//! Automatic checkpoints are off, so the log grows until a checkpoint runs
//! here. A passive checkpoint never blocks readers or writers; it is retried
//! with backoff until it copies the whole log. Past the size ceiling the
//! checkpointer stops being polite and truncates.

use crate::config::CheckpointConfig;
use crate::error::StorageError;
use crate::storage::{CheckpointMode, CheckpointStats, SqliteStore};

/// How a checkpoint run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// A passive checkpoint copied the whole log.
    Completed {
        /// Passive attempts used.
        attempts: u32,
        /// Final pragma result.
        stats: CheckpointStats,
    },
    /// The log was over the ceiling; a blocking truncate ran.
    Forced {
        /// WAL size before the checkpoint.
        wal_bytes: u64,
        /// Pragma result.
        stats: CheckpointStats,
    },
    /// Every passive attempt was cut short by concurrent activity.
    Incomplete {
        /// Passive attempts used.
        attempts: u32,
        /// Result of the last attempt that ran, if any.
        last: Option<CheckpointStats>,
    },
}

/// Runs checkpoints against a [`SqliteStore`].
#[derive(Clone)]
pub struct Checkpointer {
    store: SqliteStore,
    config: CheckpointConfig,
}

impl Checkpointer {
    /// Create a checkpointer.
    pub fn new(store: SqliteStore, config: CheckpointConfig) -> Self {
        Self { store, config }
    }

    /// Run one checkpoint pass.
    pub async fn run(&self) -> Result<CheckpointOutcome, StorageError> {
        let wal_bytes = self.store.wal_size_bytes().await?;
        if wal_bytes >= self.config.wal_ceiling_bytes {
            return self.force_with_size(wal_bytes).await;
        }

        let backoff = self.config.backoff();
        let attempts = self.config.max_retries.max(1);
        let mut last = None;

        for attempt in 1..=attempts {
            match self.store.checkpoint(CheckpointMode::Passive).await {
                Ok(stats) if stats.is_complete() => {
                    tracing::debug!(
                        "Checkpoint complete after {} attempt(s) ({} frames)",
                        attempt,
                        stats.checkpointed_frames
                    );
                    return Ok(CheckpointOutcome::Completed { attempts: attempt, stats });
                }
                Ok(stats) => {
                    tracing::debug!(
                        "Checkpoint attempt {} partial: {}/{} frames",
                        attempt,
                        stats.checkpointed_frames,
                        stats.log_frames
                    );
                    last = Some(stats);
                }
                Err(e) if e.is_contention() => {
                    tracing::debug!("Checkpoint attempt {} contended: {}", attempt, e);
                }
                Err(e) => return Err(e),
            }

            if attempt < attempts {
                tokio::time::sleep(backoff.delay(attempt)).await;
            }
        }

        tracing::warn!("Checkpoint incomplete after {} attempts", attempts);
        Ok(CheckpointOutcome::Incomplete { attempts, last })
    }

    /// Truncate the log now, waiting on other connections as needed.
    pub async fn force(&self) -> Result<CheckpointOutcome, StorageError> {
        let wal_bytes = self.store.wal_size_bytes().await?;
        self.force_with_size(wal_bytes).await
    }

    async fn force_with_size(&self, wal_bytes: u64) -> Result<CheckpointOutcome, StorageError> {
        tracing::info!(
            "Forcing blocking checkpoint (WAL {} bytes, ceiling {})",
            wal_bytes,
            self.config.wal_ceiling_bytes
        );
        let stats = self.store.checkpoint(CheckpointMode::Truncate).await?;
        if !stats.is_complete() {
            tracing::warn!(
                "Forced checkpoint left {} of {} frames",
                stats.log_frames - stats.checkpointed_frames,
                stats.log_frames
            );
        }
        Ok(CheckpointOutcome::Forced { wal_bytes, stats })
    }

    /// Run one pass in the background, e.g. when the host goes inactive.
    pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            match this.run().await {
                Ok(outcome) => tracing::debug!("Background checkpoint: {:?}", outcome),
                Err(e) => tracing::warn!("Background checkpoint failed: {}", e),
            }
        })
    }
}

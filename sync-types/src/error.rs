//! Error taxonomy for chatsync.
//!
//! Background sync and reconnection never surface these to the UI; they
//! drive retry and backoff decisions instead. The only caller-visible
//! failure on the send path is a failure to persist to the outbox.

use thiserror::Error;

/// Errors that can occur in chatsync operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Network failure; retried with backoff.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Access token expired; refreshed then retried a bounded number of times.
    #[error("auth token expired")]
    AuthExpired,

    /// The backend rejected the request; dropped and never retried.
    #[error("validation rejected: {0}")]
    PermanentValidation(String),

    /// The local store was busy; the transaction is retried with backoff.
    #[error("storage contention: {0}")]
    StorageContention(String),

    /// The local store is damaged; it falls back to read-only mode.
    #[error("storage corruption: {0}")]
    StorageCorruption(String),

    /// The local store is in degraded read-only mode.
    #[error("storage is read-only")]
    ReadOnly,

    /// Any other local storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// A bounded operation ran out of time.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Data failed to decode.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl SyncError {
    /// Whether the failed operation may succeed if repeated later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork(_)
                | Self::AuthExpired
                | Self::StorageContention(_)
                | Self::Timeout(_)
        )
    }

    /// Whether the failure means the operation must be dropped for good.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::PermanentValidation(_) | Self::InvalidData(_))
    }
}

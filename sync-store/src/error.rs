//! Error types for sync-store.

use std::path::PathBuf;
use sync_types::SyncError;

// Primary SQLite result codes; extended codes carry these in the low byte.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_CORRUPT: i32 = 11;
const SQLITE_NOTADB: i32 = 26;

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error that is neither contention nor corruption.
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    /// The database was busy or locked.
    #[error("database busy: {0}")]
    Contention(String),

    /// The database file is damaged.
    #[error("database corrupt: {0}")]
    Corruption(String),

    /// The store is in degraded read-only mode.
    #[error("store is in degraded read-only mode")]
    ReadOnly,

    /// An outbox payload failed to encode or decode.
    #[error("payload encoding error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database path error.
    #[error("invalid database path: {path}")]
    InvalidPath {
        /// The invalid path.
        path: PathBuf,
    },

    /// I/O error outside SQLite (WAL size probing).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Classify a raw sqlx error into contention, corruption, or other.
    pub fn classify(err: sqlx::Error) -> Self {
        let code = match &err {
            sqlx::Error::Database(db) => db
                .code()
                .and_then(|c| c.parse::<i32>().ok())
                .map(|c| c & 0xff),
            sqlx::Error::PoolTimedOut => {
                return Self::Contention("connection pool timed out".to_string())
            }
            _ => None,
        };
        match code {
            Some(SQLITE_BUSY | SQLITE_LOCKED) => Self::Contention(err.to_string()),
            Some(SQLITE_CORRUPT | SQLITE_NOTADB) => Self::Corruption(err.to_string()),
            _ => Self::Database(err),
        }
    }

    /// Whether retrying after a pause may succeed.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Contention(_))
    }

    /// Whether the database file is damaged.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption(_))
    }
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Contention(reason) => SyncError::StorageContention(reason),
            StorageError::Corruption(reason) => SyncError::StorageCorruption(reason),
            StorageError::ReadOnly => SyncError::ReadOnly,
            StorageError::Serialization(e) => SyncError::InvalidData(e.to_string()),
            other => SyncError::Storage(other.to_string()),
        }
    }
}

//! # sync-store
//!
//! Durable local store for chatsync.
//!
//! A single SQLite database in WAL mode holds:
//! - Message rows, including tombstones that keep deletions from coming back
//! - The outbox of sends the backend has not confirmed
//! - Per-user read pointers
//!
//! Writes run inside explicit transactions and are retried with backoff
//! when the database is contended. Corruption switches the store into a
//! read-only mode instead of failing reads.
//!
//! ## Usage
//!
//! ```no_run
//! use chatsync_store::{MessageStore, SqliteStore, StoreConfig};
//! use sync_types::GroupId;
//!
//! # async fn example() -> Result<(), chatsync_store::StorageError> {
//! let store = SqliteStore::open(&StoreConfig::at("chat.db")).await?;
//! let rows = store.visible_messages(&GroupId::new("family"), 50).await?;
//! # let _ = rows;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod storage;

pub use checkpoint::{CheckpointOutcome, Checkpointer};
pub use config::{CheckpointConfig, StoreConfig};
pub use error::StorageError;
pub use storage::{
    CheckpointMode, CheckpointStats, MessageStore, OutboxStore, ReadPointerStore, SqliteStore,
    StoreStats, UpsertOutcome,
};

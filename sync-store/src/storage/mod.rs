//! Storage layer for the sync engine.
//!
//! Three stores share one SQLite database: messages (with tombstones),
//! the outbox of unconfirmed sends, and per-user read pointers. Every
//! write runs inside an explicit transaction.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::StorageError;
use async_trait::async_trait;
use std::collections::HashSet;
use sync_types::{
    DedupeKey, GroupId, MessageId, MessageRow, OutboxEntry, OutgoingMessage, ReadPointer,
    Timestamp, UserId,
};

/// What an upsert did to the stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new row was written.
    Inserted,
    /// An existing row (same id or same dedupe key) was replaced.
    Updated,
    /// Nothing changed; the stored copy already supersedes the input.
    Unchanged,
    /// The row was recorded as deleted.
    Tombstoned,
    /// The id or dedupe key is tombstoned; the input was ignored.
    SkippedTombstoned,
}

/// WAL checkpoint flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    /// Copy what can be copied without waiting on readers or writers.
    Passive,
    /// Block until the whole log is copied, then truncate it.
    Truncate,
}

/// Result row of `PRAGMA wal_checkpoint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    /// The checkpoint could not finish because of a concurrent connection.
    pub busy: bool,
    /// Frames in the log, or -1 when the database is not in WAL mode.
    pub log_frames: i64,
    /// Frames copied back into the database.
    pub checkpointed_frames: i64,
}

impl CheckpointStats {
    /// Whether every logged frame made it into the database file.
    pub fn is_complete(&self) -> bool {
        !self.busy && (self.log_frames < 0 || self.checkpointed_frames >= self.log_frames)
    }
}

/// Row counts and WAL size, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Visible message rows.
    pub messages: u64,
    /// Rows still awaiting confirmation.
    pub optimistic: u64,
    /// Tombstone markers.
    pub tombstones: u64,
    /// Outbox entries.
    pub outbox: u64,
    /// Stored read pointers.
    pub read_pointers: u64,
    /// Current WAL file size in bytes.
    pub wal_bytes: u64,
    /// Whether the store fell back to read-only mode.
    pub degraded: bool,
}

/// Message rows and tombstones.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert or replace a row, keyed by id and by dedupe key.
    ///
    /// Idempotent. A tombstoned id or dedupe key is never resurrected and
    /// an optimistic row never overwrites a confirmed one.
    async fn upsert_message(&self, row: &MessageRow) -> Result<UpsertOutcome, StorageError>;

    /// Upsert a batch in a single transaction.
    async fn upsert_messages(
        &self,
        rows: &[MessageRow],
    ) -> Result<Vec<UpsertOutcome>, StorageError>;

    /// Record a deletion. Creates a marker if the row was never seen.
    async fn tombstone_message(
        &self,
        group_id: &GroupId,
        id: &MessageId,
    ) -> Result<(), StorageError>;

    /// Remove the unconfirmed row carrying `key`.
    ///
    /// Returns `true` if a row was removed.
    async fn delete_optimistic(&self, key: &DedupeKey) -> Result<bool, StorageError>;

    /// Get a row by id, tombstones included.
    async fn message(&self, id: &MessageId) -> Result<Option<MessageRow>, StorageError>;

    /// The newest `limit` visible rows of a group, oldest first.
    async fn visible_messages(
        &self,
        group_id: &GroupId,
        limit: u32,
    ) -> Result<Vec<MessageRow>, StorageError>;

    /// Ids of every tombstoned row in a group.
    async fn tombstoned_ids(&self, group_id: &GroupId)
        -> Result<HashSet<MessageId>, StorageError>;
}

/// Durable queue of unconfirmed sends.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Persist a send, due immediately.
    ///
    /// Enqueuing the same dedupe key twice returns the existing entry.
    async fn enqueue(
        &self,
        message: &OutgoingMessage,
        now: Timestamp,
    ) -> Result<OutboxEntry, StorageError>;

    /// Entries with `next_retry_at <= now`, oldest schedule first.
    async fn due_entries(&self, now: Timestamp) -> Result<Vec<OutboxEntry>, StorageError>;

    /// Every entry in insertion order.
    async fn all_entries(&self) -> Result<Vec<OutboxEntry>, StorageError>;

    /// Record a failed attempt and the next schedule.
    async fn reschedule(
        &self,
        id: i64,
        retry_count: u32,
        next_retry_at: Timestamp,
    ) -> Result<(), StorageError>;

    /// Drop an entry. Returns `true` if it existed.
    async fn remove_entry(&self, id: i64) -> Result<bool, StorageError>;

    /// Delete an entry and upsert its authoritative row atomically.
    async fn complete_entry(
        &self,
        id: i64,
        confirmed: &MessageRow,
    ) -> Result<UpsertOutcome, StorageError>;

    /// Make every entry due at `now`. Returns the number rescheduled.
    async fn reset_schedule(&self, now: Timestamp) -> Result<u64, StorageError>;

    /// Number of entries.
    async fn outbox_len(&self) -> Result<u64, StorageError>;
}

/// Per-user read positions.
#[async_trait]
pub trait ReadPointerStore: Send + Sync {
    /// Get the stored pointer, if any.
    async fn read_pointer(
        &self,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> Result<Option<ReadPointer>, StorageError>;

    /// Store `pointer` if it is strictly newer than the stored one.
    ///
    /// Returns `true` if the pointer moved.
    async fn advance_read_pointer(&self, pointer: &ReadPointer) -> Result<bool, StorageError>;
}

//! SQLite storage backend.

use super::{
    CheckpointMode, CheckpointStats, MessageStore, OutboxStore, ReadPointerStore, StoreStats,
    UpsertOutcome,
};
use crate::config::StoreConfig;
use crate::error::StorageError;
use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use sync_core::Backoff;
use sync_types::{
    DedupeKey, GroupId, MessageId, MessageRow, OutboxEntry, OutgoingMessage, ReadPointer,
    RowState, Timestamp, UserId,
};

/// SQLite-based local store.
///
/// Runs in WAL mode with `synchronous = FULL`, so a committed transaction
/// survives process death. Automatic checkpoints are disabled; the
/// [`Checkpointer`](crate::Checkpointer) runs them at quiet moments.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    wal_path: Option<PathBuf>,
    degraded: Arc<AtomicBool>,
    contention: Backoff,
    contention_retries: u32,
}

impl SqliteStore {
    /// Open (or create) the database described by `config`.
    pub async fn open(config: &StoreConfig) -> Result<Self, StorageError> {
        let path = config.database.as_path();
        if path.as_os_str().is_empty() || path.is_dir() {
            return Err(StorageError::InvalidPath {
                path: path.to_path_buf(),
            });
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(config.busy_timeout())
            .pragma("wal_autocheckpoint", "0");

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(StorageError::classify)?;

        let store = Self {
            pool,
            wal_path: Some(wal_path_for(path)),
            degraded: Arc::new(AtomicBool::new(false)),
            contention: config.contention_backoff(),
            contention_retries: config.contention_retries,
        };
        store.prepare().await?;
        tracing::info!("Store opened at {}", path.display());
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(":memory:").map_err(StorageError::Database)?;

        // A single connection that is never recycled: the database lives
        // exactly as long as it does.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(StorageError::classify)?;

        let config = StoreConfig::default();
        let store = Self {
            pool,
            wal_path: None,
            degraded: Arc::new(AtomicBool::new(false)),
            contention: config.contention_backoff(),
            contention_retries: config.contention_retries,
        };
        store.prepare().await?;
        Ok(store)
    }

    async fn prepare(&self) -> Result<(), StorageError> {
        if let Err(e) = self.run_migrations().await {
            if self.is_degraded() {
                tracing::warn!("Skipping integrity check on degraded store: {}", e);
                return Ok(());
            }
            return Err(e);
        }

        let verdict: String = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.fail(e))?;
        if verdict != "ok" {
            self.mark_degraded(&verdict);
        }
        Ok(())
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                group_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                content TEXT NOT NULL,
                attachment TEXT,
                created_at INTEGER NOT NULL,
                dedupe_key TEXT,
                confirmed INTEGER NOT NULL DEFAULT 0,
                tombstoned INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| self.fail(e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                dedupe_key TEXT NOT NULL UNIQUE,
                payload TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                next_retry_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| self.fail(e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS read_pointers (
                group_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                last_read_at INTEGER NOT NULL,
                last_read_message_id TEXT,
                PRIMARY KEY (group_id, user_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| self.fail(e))?;

        // Create indexes
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_dedupe ON messages(dedupe_key)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| self.fail(e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_group_created ON messages(group_id, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| self.fail(e))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_outbox_next_retry ON outbox(next_retry_at)")
            .execute(&self.pool)
            .await
            .map_err(|e| self.fail(e))?;

        Ok(())
    }

    /// Whether the store has fallen back to read-only mode.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Switch to read-only mode. Reads keep working; writes fail with
    /// [`StorageError::ReadOnly`].
    ///
    /// Called automatically when corruption is detected.
    pub fn mark_degraded(&self, reason: &str) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            tracing::error!("Store degraded to read-only mode: {}", reason);
        }
    }

    /// Cheap liveness probe: runs `SELECT 1`.
    pub async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| self.fail(e))?;
        Ok(())
    }

    /// Run a WAL checkpoint.
    pub async fn checkpoint(&self, mode: CheckpointMode) -> Result<CheckpointStats, StorageError> {
        self.guard_write()?;
        let sql = match mode {
            CheckpointMode::Passive => "PRAGMA wal_checkpoint(PASSIVE)",
            CheckpointMode::Truncate => "PRAGMA wal_checkpoint(TRUNCATE)",
        };
        let (busy, log_frames, checkpointed_frames): (i64, i64, i64) = sqlx::query_as(sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.fail(e))?;

        Ok(CheckpointStats {
            busy: busy != 0,
            log_frames,
            checkpointed_frames,
        })
    }

    /// Current size of the WAL file. Zero for in-memory stores or when
    /// the log has been truncated away.
    pub async fn wal_size_bytes(&self) -> Result<u64, StorageError> {
        let Some(path) = &self.wal_path else {
            return Ok(0);
        };
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Row counts and WAL size.
    pub async fn stats(&self) -> Result<StoreStats, StorageError> {
        let (messages, optimistic, tombstones): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(tombstoned = 0), 0),
                COALESCE(SUM(tombstoned = 0 AND confirmed = 0), 0),
                COALESCE(SUM(tombstoned), 0)
            FROM messages
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| self.fail(e))?;

        let outbox: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.fail(e))?;

        let read_pointers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM read_pointers")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.fail(e))?;

        Ok(StoreStats {
            messages: messages as u64,
            optimistic: optimistic as u64,
            tombstones: tombstones as u64,
            outbox: outbox as u64,
            read_pointers: read_pointers as u64,
            wal_bytes: self.wal_size_bytes().await?,
            degraded: self.is_degraded(),
        })
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Classify a database error, degrading on corruption.
    fn fail(&self, err: sqlx::Error) -> StorageError {
        let err = StorageError::classify(err);
        if err.is_corruption() {
            self.mark_degraded(&err.to_string());
        }
        err
    }

    fn guard_write(&self) -> Result<(), StorageError> {
        if self.is_degraded() {
            return Err(StorageError::ReadOnly);
        }
        Ok(())
    }

    /// Run a write transaction, retrying with backoff while the database
    /// reports contention.
    async fn retry_contended<T, F, Fut>(&self, op: &str, mut attempt: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        self.guard_write()?;
        let mut retries = 0u32;
        loop {
            match attempt().await {
                Err(StorageError::Contention(reason)) if retries < self.contention_retries => {
                    retries += 1;
                    let delay = self.contention.delay(retries);
                    tracing::debug!(
                        "{}: database busy ({}), retry {} in {:?}",
                        op,
                        reason,
                        retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    // ===========================================
    // Single-attempt write transactions
    // ===========================================

    async fn upsert_once(&self, rows: &[MessageRow]) -> Result<Vec<UpsertOutcome>, StorageError> {
        let mut tx = self.pool.begin().await.map_err(|e| self.fail(e))?;
        let mut outcomes = Vec::with_capacity(rows.len());
        for row in rows {
            outcomes.push(upsert_in_tx(&mut *tx, row).await.map_err(|e| self.fail(e))?);
        }
        tx.commit().await.map_err(|e| self.fail(e))?;
        Ok(outcomes)
    }

    async fn tombstone_once(&self, group_id: &GroupId, id: &MessageId) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(|e| self.fail(e))?;
        tombstone_in_tx(&mut *tx, group_id, id)
            .await
            .map_err(|e| self.fail(e))?;
        tx.commit().await.map_err(|e| self.fail(e))?;
        Ok(())
    }

    async fn delete_optimistic_once(&self, key: &DedupeKey) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await.map_err(|e| self.fail(e))?;
        let result = sqlx::query(
            "DELETE FROM messages WHERE dedupe_key = ?1 AND confirmed = 0 AND tombstoned = 0",
        )
        .bind(key.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| self.fail(e))?;
        tx.commit().await.map_err(|e| self.fail(e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn enqueue_once(
        &self,
        message: &OutgoingMessage,
        now: Timestamp,
    ) -> Result<OutboxEntry, StorageError> {
        let payload = serde_json::to_string(message)?;

        let mut tx = self.pool.begin().await.map_err(|e| self.fail(e))?;
        sqlx::query(
            r#"
            INSERT INTO outbox (group_id, user_id, dedupe_key, payload, retry_count, next_retry_at, created_at)
            VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)
            ON CONFLICT(dedupe_key) DO NOTHING
            "#,
        )
        .bind(message.group_id.as_str())
        .bind(message.author_id.as_str())
        .bind(message.dedupe_key.as_str())
        .bind(&payload)
        .bind(now.as_millis())
        .execute(&mut *tx)
        .await
        .map_err(|e| self.fail(e))?;

        let record = sqlx::query_as::<_, OutboxRecord>(
            r#"
            SELECT id, group_id, user_id, payload, retry_count, next_retry_at
            FROM outbox
            WHERE dedupe_key = ?1
            "#,
        )
        .bind(message.dedupe_key.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| self.fail(e))?;
        tx.commit().await.map_err(|e| self.fail(e))?;

        record.try_into()
    }

    async fn reschedule_once(
        &self,
        id: i64,
        retry_count: u32,
        next_retry_at: Timestamp,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(|e| self.fail(e))?;
        sqlx::query("UPDATE outbox SET retry_count = ?2, next_retry_at = ?3 WHERE id = ?1")
            .bind(id)
            .bind(i64::from(retry_count))
            .bind(next_retry_at.as_millis())
            .execute(&mut *tx)
            .await
            .map_err(|e| self.fail(e))?;
        tx.commit().await.map_err(|e| self.fail(e))?;
        Ok(())
    }

    async fn remove_once(&self, id: i64) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await.map_err(|e| self.fail(e))?;
        let result = sqlx::query("DELETE FROM outbox WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| self.fail(e))?;
        tx.commit().await.map_err(|e| self.fail(e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete_once(
        &self,
        id: i64,
        confirmed: &MessageRow,
    ) -> Result<UpsertOutcome, StorageError> {
        let mut tx = self.pool.begin().await.map_err(|e| self.fail(e))?;
        sqlx::query("DELETE FROM outbox WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| self.fail(e))?;
        let outcome = upsert_in_tx(&mut *tx, confirmed)
            .await
            .map_err(|e| self.fail(e))?;
        tx.commit().await.map_err(|e| self.fail(e))?;
        Ok(outcome)
    }

    async fn reset_schedule_once(&self, now: Timestamp) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await.map_err(|e| self.fail(e))?;
        let result = sqlx::query("UPDATE outbox SET next_retry_at = ?1 WHERE next_retry_at > ?1")
            .bind(now.as_millis())
            .execute(&mut *tx)
            .await
            .map_err(|e| self.fail(e))?;
        tx.commit().await.map_err(|e| self.fail(e))?;
        Ok(result.rows_affected())
    }

    async fn advance_once(&self, pointer: &ReadPointer) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await.map_err(|e| self.fail(e))?;
        let result = sqlx::query(
            r#"
            INSERT INTO read_pointers (group_id, user_id, last_read_at, last_read_message_id)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(group_id, user_id) DO UPDATE SET
                last_read_at = excluded.last_read_at,
                last_read_message_id = excluded.last_read_message_id
            WHERE excluded.last_read_at > read_pointers.last_read_at
            "#,
        )
        .bind(pointer.group_id.as_str())
        .bind(pointer.user_id.as_str())
        .bind(pointer.last_read_at.as_millis())
        .bind(pointer.last_read_message_id.as_ref().map(|id| id.as_str()))
        .execute(&mut *tx)
        .await
        .map_err(|e| self.fail(e))?;
        tx.commit().await.map_err(|e| self.fail(e))?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn upsert_message(&self, row: &MessageRow) -> Result<UpsertOutcome, StorageError> {
        let rows = std::slice::from_ref(row);
        let outcomes = self
            .retry_contended("upsert_message", move || self.upsert_once(rows))
            .await?;
        Ok(outcomes
            .into_iter()
            .next()
            .unwrap_or(UpsertOutcome::Unchanged))
    }

    async fn upsert_messages(
        &self,
        rows: &[MessageRow],
    ) -> Result<Vec<UpsertOutcome>, StorageError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        self.retry_contended("upsert_messages", move || self.upsert_once(rows))
            .await
    }

    async fn tombstone_message(
        &self,
        group_id: &GroupId,
        id: &MessageId,
    ) -> Result<(), StorageError> {
        self.retry_contended("tombstone_message", move || {
            self.tombstone_once(group_id, id)
        })
        .await
    }

    async fn delete_optimistic(&self, key: &DedupeKey) -> Result<bool, StorageError> {
        self.retry_contended("delete_optimistic", move || {
            self.delete_optimistic_once(key)
        })
        .await
    }

    async fn message(&self, id: &MessageId) -> Result<Option<MessageRow>, StorageError> {
        let record = sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT id, group_id, user_id, content, attachment, created_at, dedupe_key, confirmed, tombstoned
            FROM messages
            WHERE id = ?1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| self.fail(e))?;

        Ok(record.map(MessageRow::from))
    }

    async fn visible_messages(
        &self,
        group_id: &GroupId,
        limit: u32,
    ) -> Result<Vec<MessageRow>, StorageError> {
        let records = sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT * FROM (
                SELECT id, group_id, user_id, content, attachment, created_at, dedupe_key, confirmed, tombstoned
                FROM messages
                WHERE group_id = ?1 AND tombstoned = 0
                ORDER BY created_at DESC, id DESC
                LIMIT ?2
            )
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(group_id.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.fail(e))?;

        Ok(records.into_iter().map(MessageRow::from).collect())
    }

    async fn tombstoned_ids(
        &self,
        group_id: &GroupId,
    ) -> Result<HashSet<MessageId>, StorageError> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM messages WHERE group_id = ?1 AND tombstoned = 1")
                .bind(group_id.as_str())
                .fetch_all(&self.pool)
                .await
                .map_err(|e| self.fail(e))?;

        Ok(ids.into_iter().map(MessageId::new).collect())
    }
}

#[async_trait]
impl OutboxStore for SqliteStore {
    async fn enqueue(
        &self,
        message: &OutgoingMessage,
        now: Timestamp,
    ) -> Result<OutboxEntry, StorageError> {
        self.retry_contended("enqueue", move || self.enqueue_once(message, now))
            .await
    }

    async fn due_entries(&self, now: Timestamp) -> Result<Vec<OutboxEntry>, StorageError> {
        let records = sqlx::query_as::<_, OutboxRecord>(
            r#"
            SELECT id, group_id, user_id, payload, retry_count, next_retry_at
            FROM outbox
            WHERE next_retry_at <= ?1
            ORDER BY next_retry_at ASC, id ASC
            "#,
        )
        .bind(now.as_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.fail(e))?;

        records.into_iter().map(|r| r.try_into()).collect()
    }

    async fn all_entries(&self) -> Result<Vec<OutboxEntry>, StorageError> {
        let records = sqlx::query_as::<_, OutboxRecord>(
            r#"
            SELECT id, group_id, user_id, payload, retry_count, next_retry_at
            FROM outbox
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.fail(e))?;

        records.into_iter().map(|r| r.try_into()).collect()
    }

    async fn reschedule(
        &self,
        id: i64,
        retry_count: u32,
        next_retry_at: Timestamp,
    ) -> Result<(), StorageError> {
        self.retry_contended("reschedule", move || {
            self.reschedule_once(id, retry_count, next_retry_at)
        })
        .await
    }

    async fn remove_entry(&self, id: i64) -> Result<bool, StorageError> {
        self.retry_contended("remove_entry", move || self.remove_once(id))
            .await
    }

    async fn complete_entry(
        &self,
        id: i64,
        confirmed: &MessageRow,
    ) -> Result<UpsertOutcome, StorageError> {
        self.retry_contended("complete_entry", move || {
            self.complete_once(id, confirmed)
        })
        .await
    }

    async fn reset_schedule(&self, now: Timestamp) -> Result<u64, StorageError> {
        self.retry_contended("reset_schedule", move || self.reset_schedule_once(now))
            .await
    }

    async fn outbox_len(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.fail(e))?;
        Ok(count as u64)
    }
}

#[async_trait]
impl ReadPointerStore for SqliteStore {
    async fn read_pointer(
        &self,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> Result<Option<ReadPointer>, StorageError> {
        let record = sqlx::query_as::<_, ReadPointerRecord>(
            r#"
            SELECT group_id, user_id, last_read_at, last_read_message_id
            FROM read_pointers
            WHERE group_id = ?1 AND user_id = ?2
            "#,
        )
        .bind(group_id.as_str())
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| self.fail(e))?;

        Ok(record.map(ReadPointer::from))
    }

    async fn advance_read_pointer(&self, pointer: &ReadPointer) -> Result<bool, StorageError> {
        self.retry_contended("advance_read_pointer", move || self.advance_once(pointer))
            .await
    }
}

// ===========================================
// Transaction bodies
// ===========================================

/// Upsert one row inside an open transaction.
///
/// Resolution order: tombstoned id, then a twin row sharing the dedupe
/// key, then the id itself. The twin is re-keyed to the incoming id so
/// an optimistic row is replaced in place rather than duplicated.
async fn upsert_in_tx(
    conn: &mut SqliteConnection,
    row: &MessageRow,
) -> Result<UpsertOutcome, sqlx::Error> {
    if row.is_tombstoned() {
        tombstone_in_tx(conn, &row.group_id, &row.id).await?;
        return Ok(UpsertOutcome::Tombstoned);
    }

    let existing: Option<bool> = sqlx::query_scalar("SELECT tombstoned FROM messages WHERE id = ?1")
        .bind(row.id.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    if existing == Some(true) {
        return Ok(UpsertOutcome::SkippedTombstoned);
    }
    let mut existed = existing.is_some();

    if let Some(key) = &row.dedupe_key {
        let twin: Option<(String, bool)> = sqlx::query_as(
            "SELECT id, tombstoned FROM messages WHERE dedupe_key = ?1 AND id != ?2",
        )
        .bind(key.as_str())
        .bind(row.id.as_str())
        .fetch_optional(&mut *conn)
        .await?;

        if let Some((twin_id, twin_tombstoned)) = twin {
            if twin_tombstoned {
                return Ok(UpsertOutcome::SkippedTombstoned);
            }
            if row.is_optimistic() {
                // The same send is already stored under another id
                return Ok(UpsertOutcome::Unchanged);
            }
            if existed {
                sqlx::query("DELETE FROM messages WHERE id = ?1")
                    .bind(&twin_id)
                    .execute(&mut *conn)
                    .await?;
            } else {
                sqlx::query("UPDATE messages SET id = ?1 WHERE id = ?2")
                    .bind(row.id.as_str())
                    .bind(&twin_id)
                    .execute(&mut *conn)
                    .await?;
                existed = true;
            }
        }
    }

    let result = sqlx::query(
        r#"
        INSERT INTO messages (id, group_id, user_id, content, attachment, created_at, dedupe_key, confirmed, tombstoned)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)
        ON CONFLICT(id) DO UPDATE SET
            group_id = excluded.group_id,
            user_id = excluded.user_id,
            content = excluded.content,
            attachment = excluded.attachment,
            created_at = excluded.created_at,
            dedupe_key = COALESCE(excluded.dedupe_key, messages.dedupe_key),
            confirmed = MAX(messages.confirmed, excluded.confirmed)
        WHERE messages.tombstoned = 0
          AND (excluded.confirmed = 1 OR messages.confirmed = 0)
        "#,
    )
    .bind(row.id.as_str())
    .bind(row.group_id.as_str())
    .bind(row.author_id.as_str())
    .bind(&row.content)
    .bind(row.attachment.as_deref())
    .bind(row.created_at.as_millis())
    .bind(row.dedupe_key.as_ref().map(|k| k.as_str()))
    .bind(row.state == RowState::Confirmed)
    .execute(&mut *conn)
    .await?;

    Ok(match (result.rows_affected(), existed) {
        (0, _) => UpsertOutcome::Unchanged,
        (_, true) => UpsertOutcome::Updated,
        (_, false) => UpsertOutcome::Inserted,
    })
}

/// Mark `id` deleted, inserting an empty marker if it was never stored.
async fn tombstone_in_tx(
    conn: &mut SqliteConnection,
    group_id: &GroupId,
    id: &MessageId,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO messages (id, group_id, user_id, content, created_at, confirmed, tombstoned)
        VALUES (?1, ?2, '', '', 0, 1, 1)
        ON CONFLICT(id) DO UPDATE SET tombstoned = 1
        "#,
    )
    .bind(id.as_str())
    .bind(group_id.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn wal_path_for(db: &Path) -> PathBuf {
    let mut name = db.as_os_str().to_owned();
    name.push("-wal");
    PathBuf::from(name)
}

// ===========================================
// Row types
// ===========================================

#[derive(sqlx::FromRow)]
struct MessageRecord {
    id: String,
    group_id: String,
    user_id: String,
    content: String,
    attachment: Option<String>,
    created_at: i64,
    dedupe_key: Option<String>,
    confirmed: bool,
    tombstoned: bool,
}

impl From<MessageRecord> for MessageRow {
    fn from(record: MessageRecord) -> Self {
        let state = if record.tombstoned {
            RowState::Tombstoned
        } else if record.confirmed {
            RowState::Confirmed
        } else {
            RowState::Optimistic
        };
        MessageRow {
            id: MessageId::new(record.id),
            group_id: GroupId::new(record.group_id),
            author_id: UserId::new(record.user_id),
            content: record.content,
            attachment: record.attachment,
            created_at: Timestamp::from_millis(record.created_at),
            dedupe_key: record.dedupe_key.map(DedupeKey::new),
            state,
        }
    }
}

#[derive(sqlx::FromRow)]
struct OutboxRecord {
    id: i64,
    group_id: String,
    user_id: String,
    payload: String,
    retry_count: i64,
    next_retry_at: i64,
}

impl TryFrom<OutboxRecord> for OutboxEntry {
    type Error = StorageError;

    fn try_from(record: OutboxRecord) -> Result<Self, Self::Error> {
        Ok(OutboxEntry {
            id: record.id,
            group_id: GroupId::new(record.group_id),
            author_id: UserId::new(record.user_id),
            payload: serde_json::from_str(&record.payload)?,
            retry_count: u32::try_from(record.retry_count).unwrap_or(u32::MAX),
            next_retry_at: Timestamp::from_millis(record.next_retry_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct ReadPointerRecord {
    group_id: String,
    user_id: String,
    last_read_at: i64,
    last_read_message_id: Option<String>,
}

impl From<ReadPointerRecord> for ReadPointer {
    fn from(record: ReadPointerRecord) -> Self {
        ReadPointer {
            group_id: GroupId::new(record.group_id),
            user_id: UserId::new(record.user_id),
            last_read_at: Timestamp::from_millis(record.last_read_at),
            last_read_message_id: record.last_read_message_id.map(MessageId::new),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn group() -> GroupId {
        GroupId::new("g1")
    }

    fn confirmed(id: &str, at: i64, key: Option<&str>) -> MessageRow {
        MessageRow {
            id: MessageId::new(id),
            group_id: group(),
            author_id: UserId::new("bob"),
            content: format!("body of {id}"),
            attachment: None,
            created_at: Timestamp::from_millis(at),
            dedupe_key: key.map(DedupeKey::new),
            state: RowState::Confirmed,
        }
    }

    fn optimistic(id: &str, at: i64, key: &str) -> MessageRow {
        MessageRow {
            state: RowState::Optimistic,
            author_id: UserId::new("alice"),
            ..confirmed(id, at, Some(key))
        }
    }

    fn outgoing(content: &str) -> OutgoingMessage {
        OutgoingMessage::new(group(), UserId::new("alice"), content)
    }

    fn ids(rows: &[MessageRow]) -> Vec<&str> {
        rows.iter().map(|r| r.id.as_str()).collect()
    }

    // ===========================================
    // Messages
    // ===========================================

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = SqliteStore::in_memory().await.unwrap();
        let row = confirmed("s1", 100, None);

        assert_eq!(
            store.upsert_message(&row).await.unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store.upsert_message(&row).await.unwrap(),
            UpsertOutcome::Updated
        );

        let visible = store.visible_messages(&group(), 50).await.unwrap();
        assert_eq!(visible, vec![row]);
    }

    #[tokio::test]
    async fn authoritative_row_replaces_optimistic_by_dedupe_key() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .upsert_message(&optimistic("c1", 100, "k1"))
            .await
            .unwrap();

        let server = confirmed("s1", 105, Some("k1"));
        assert_eq!(
            store.upsert_message(&server).await.unwrap(),
            UpsertOutcome::Updated
        );

        let visible = store.visible_messages(&group(), 50).await.unwrap();
        assert_eq!(ids(&visible), vec!["s1"]);
        assert_eq!(visible[0].state, RowState::Confirmed);
        assert!(store
            .message(&MessageId::new("c1"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn twin_is_dropped_when_both_ids_exist() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .upsert_message(&optimistic("c1", 100, "k1"))
            .await
            .unwrap();
        // The realtime echo arrived without its dedupe key
        store
            .upsert_message(&confirmed("s1", 105, None))
            .await
            .unwrap();

        store
            .upsert_message(&confirmed("s1", 105, Some("k1")))
            .await
            .unwrap();

        let visible = store.visible_messages(&group(), 50).await.unwrap();
        assert_eq!(ids(&visible), vec!["s1"]);
        assert_eq!(visible[0].dedupe_key, Some(DedupeKey::new("k1")));
    }

    #[tokio::test]
    async fn optimistic_never_overwrites_confirmed() {
        let store = SqliteStore::in_memory().await.unwrap();
        let server = confirmed("s1", 105, Some("k1"));
        store.upsert_message(&server).await.unwrap();

        // Same dedupe key under the client id
        assert_eq!(
            store
                .upsert_message(&optimistic("c1", 100, "k1"))
                .await
                .unwrap(),
            UpsertOutcome::Unchanged
        );
        // Same id
        let mut stale = optimistic("s1", 100, "k1");
        stale.content = "stale".into();
        assert_eq!(
            store.upsert_message(&stale).await.unwrap(),
            UpsertOutcome::Unchanged
        );

        let stored = store.message(&server.id).await.unwrap().unwrap();
        assert_eq!(stored, server);
    }

    #[tokio::test]
    async fn tombstone_is_never_resurrected() {
        let store = SqliteStore::in_memory().await.unwrap();
        let row = confirmed("s1", 100, Some("k1"));
        store.upsert_message(&row).await.unwrap();

        store.tombstone_message(&group(), &row.id).await.unwrap();
        assert!(store.visible_messages(&group(), 50).await.unwrap().is_empty());

        // Late duplicate by id
        assert_eq!(
            store.upsert_message(&row).await.unwrap(),
            UpsertOutcome::SkippedTombstoned
        );
        // Late duplicate by dedupe key under another id
        assert_eq!(
            store
                .upsert_message(&confirmed("s9", 100, Some("k1")))
                .await
                .unwrap(),
            UpsertOutcome::SkippedTombstoned
        );

        assert!(store.visible_messages(&group(), 50).await.unwrap().is_empty());
        let tombstones = store.tombstoned_ids(&group()).await.unwrap();
        assert!(tombstones.contains(&row.id));
    }

    #[tokio::test]
    async fn tombstone_before_insert_suppresses_row() {
        let store = SqliteStore::in_memory().await.unwrap();
        let id = MessageId::new("s1");
        store.tombstone_message(&group(), &id).await.unwrap();

        assert_eq!(
            store
                .upsert_message(&confirmed("s1", 100, None))
                .await
                .unwrap(),
            UpsertOutcome::SkippedTombstoned
        );
        let stored = store.message(&id).await.unwrap().unwrap();
        assert!(stored.is_tombstoned());
    }

    #[tokio::test]
    async fn tombstone_row_through_upsert() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .upsert_message(&confirmed("s1", 100, None))
            .await
            .unwrap();

        let marker = MessageRow::tombstone(group(), MessageId::new("s1"));
        assert_eq!(
            store.upsert_message(&marker).await.unwrap(),
            UpsertOutcome::Tombstoned
        );
        assert!(store.visible_messages(&group(), 50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn visible_window_is_newest_rows_in_order() {
        let store = SqliteStore::in_memory().await.unwrap();
        let rows: Vec<_> = (1..=5)
            .map(|i| confirmed(&format!("s{i}"), i * 10, None))
            .collect();
        let outcomes = store.upsert_messages(&rows).await.unwrap();
        assert!(outcomes.iter().all(|o| *o == UpsertOutcome::Inserted));

        let visible = store.visible_messages(&group(), 3).await.unwrap();
        assert_eq!(ids(&visible), vec!["s3", "s4", "s5"]);
    }

    #[tokio::test]
    async fn delete_optimistic_spares_confirmed_rows() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .upsert_message(&optimistic("c1", 100, "k1"))
            .await
            .unwrap();
        store
            .upsert_message(&confirmed("s2", 110, Some("k2")))
            .await
            .unwrap();

        assert!(store.delete_optimistic(&DedupeKey::new("k1")).await.unwrap());
        assert!(!store.delete_optimistic(&DedupeKey::new("k2")).await.unwrap());
        assert_eq!(
            ids(&store.visible_messages(&group(), 50).await.unwrap()),
            vec!["s2"]
        );
    }

    // ===========================================
    // Outbox
    // ===========================================

    #[tokio::test]
    async fn enqueue_is_idempotent_per_dedupe_key() {
        let store = SqliteStore::in_memory().await.unwrap();
        let message = outgoing("hi");
        let now = Timestamp::from_millis(1_000);

        let first = store.enqueue(&message, now).await.unwrap();
        let second = store
            .enqueue(&message, Timestamp::from_millis(9_000))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first.payload, message);
        assert_eq!(first.retry_count, 0);
        assert_eq!(first.next_retry_at, now);
        assert_eq!(store.outbox_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn due_entries_respect_schedule() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = Timestamp::from_millis(1_000);
        let a = store.enqueue(&outgoing("a"), now).await.unwrap();
        let b = store.enqueue(&outgoing("b"), now).await.unwrap();

        store
            .reschedule(a.id, 1, Timestamp::from_millis(5_000))
            .await
            .unwrap();

        let due = store.due_entries(now).await.unwrap();
        assert_eq!(due.iter().map(|e| e.id).collect::<Vec<_>>(), vec![b.id]);

        let later = store
            .due_entries(Timestamp::from_millis(5_000))
            .await
            .unwrap();
        assert_eq!(later.len(), 2);
        let rescheduled = later.iter().find(|e| e.id == a.id).unwrap();
        assert_eq!(rescheduled.retry_count, 1);
    }

    #[tokio::test]
    async fn reset_schedule_makes_everything_due() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = Timestamp::from_millis(1_000);
        let entry = store.enqueue(&outgoing("a"), now).await.unwrap();
        store
            .reschedule(entry.id, 3, Timestamp::from_millis(60_000))
            .await
            .unwrap();

        assert_eq!(store.reset_schedule(now).await.unwrap(), 1);
        let due = store.due_entries(now).await.unwrap();
        assert_eq!(due.len(), 1);
        // Retry count survives the reset
        assert_eq!(due[0].retry_count, 3);
    }

    #[tokio::test]
    async fn complete_entry_is_atomic() {
        let store = SqliteStore::in_memory().await.unwrap();
        let message = outgoing("hello");
        let now = Timestamp::from_millis(1_000);
        store
            .upsert_message(&MessageRow::optimistic(&message, now))
            .await
            .unwrap();
        let entry = store.enqueue(&message, now).await.unwrap();

        let mut server = MessageRow::optimistic(&message, Timestamp::from_millis(1_050));
        server.id = MessageId::new("srv-1");
        server.state = RowState::Confirmed;

        assert_eq!(
            store.complete_entry(entry.id, &server).await.unwrap(),
            UpsertOutcome::Updated
        );
        assert_eq!(store.outbox_len().await.unwrap(), 0);
        assert_eq!(
            store.visible_messages(&group(), 50).await.unwrap(),
            vec![server]
        );
    }

    #[tokio::test]
    async fn remove_entry_reports_existence() {
        let store = SqliteStore::in_memory().await.unwrap();
        let entry = store
            .enqueue(&outgoing("a"), Timestamp::from_millis(1))
            .await
            .unwrap();

        assert!(store.remove_entry(entry.id).await.unwrap());
        assert!(!store.remove_entry(entry.id).await.unwrap());
        assert!(store.all_entries().await.unwrap().is_empty());
    }

    // ===========================================
    // Read pointers
    // ===========================================

    #[tokio::test]
    async fn read_pointer_is_monotonic() {
        let store = SqliteStore::in_memory().await.unwrap();
        let pointer = |at: i64, id: &str| ReadPointer {
            group_id: group(),
            user_id: UserId::new("alice"),
            last_read_at: Timestamp::from_millis(at),
            last_read_message_id: Some(MessageId::new(id)),
        };

        assert!(store.advance_read_pointer(&pointer(100, "m1")).await.unwrap());
        assert!(!store.advance_read_pointer(&pointer(50, "m0")).await.unwrap());
        assert!(!store.advance_read_pointer(&pointer(100, "m1b")).await.unwrap());

        let stored = store
            .read_pointer(&group(), &UserId::new("alice"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, pointer(100, "m1"));

        assert!(store.advance_read_pointer(&pointer(200, "m2")).await.unwrap());
        assert!(store
            .read_pointer(&group(), &UserId::new("bob"))
            .await
            .unwrap()
            .is_none());
    }

    // ===========================================
    // Durability and degraded mode
    // ===========================================

    #[tokio::test]
    async fn degraded_store_rejects_writes_but_serves_reads() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .upsert_message(&confirmed("s1", 100, None))
            .await
            .unwrap();

        store.mark_degraded("test");
        assert!(store.is_degraded());

        let err = store
            .enqueue(&outgoing("x"), Timestamp::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ReadOnly));
        assert!(matches!(
            store.upsert_message(&confirmed("s2", 110, None)).await,
            Err(StorageError::ReadOnly)
        ));

        assert_eq!(store.visible_messages(&group(), 50).await.unwrap().len(), 1);
        assert!(store.stats().await.unwrap().degraded);
    }

    #[tokio::test]
    async fn committed_outbox_entry_survives_crash() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chat.db");
        let store = SqliteStore::open(&StoreConfig::at(&path)).await.unwrap();

        let message = outgoing("must not be lost");
        let entry = store
            .enqueue(&message, Timestamp::from_millis(1_000))
            .await
            .unwrap();

        // Snapshot the files as a killed process leaves them: the commit
        // sits in the WAL and has not been checkpointed.
        let wal = wal_path_for(&path);
        assert!(std::fs::metadata(&wal).unwrap().len() > 0);
        let crash = tempdir().unwrap();
        let crashed_db = crash.path().join("chat.db");
        std::fs::copy(&path, &crashed_db).unwrap();
        std::fs::copy(&wal, wal_path_for(&crashed_db)).unwrap();

        let recovered = SqliteStore::open(&StoreConfig::at(&crashed_db))
            .await
            .unwrap();
        assert_eq!(recovered.all_entries().await.unwrap(), vec![entry]);
    }

    #[tokio::test]
    async fn truncate_checkpoint_empties_wal() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(&StoreConfig::at(dir.path().join("chat.db")))
            .await
            .unwrap();

        for i in 0..20 {
            store
                .upsert_message(&confirmed(&format!("s{i}"), i, None))
                .await
                .unwrap();
        }
        assert!(store.wal_size_bytes().await.unwrap() > 0);

        let stats = store.checkpoint(CheckpointMode::Truncate).await.unwrap();
        assert!(stats.is_complete());
        assert_eq!(store.wal_size_bytes().await.unwrap(), 0);
        assert_eq!(store.stats().await.unwrap().messages, 20);
    }

    #[tokio::test]
    async fn open_rejects_directory_path() {
        let dir = tempdir().unwrap();
        let result = SqliteStore::open(&StoreConfig::at(dir.path())).await;
        assert!(matches!(result, Err(StorageError::InvalidPath { .. })));
    }
}

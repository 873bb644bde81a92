//! Send pipeline and durable outbox.
//!
//! A send shows an optimistic row immediately, then tries the backend
//! directly. Anything short of a definitive answer lands in the outbox,
//! which is drained by a single worker on enqueue, on reconnect, on
//! foreground, and on a timer. Each entry is retried with capped
//! exponential backoff until it is delivered or exhausts its retries.
//!
//! Draining is held while the link is down. Passes that would only find
//! the backend unreachable do not run, so an outage of any length costs a
//! queued send none of its retries.

use crate::auth::TokenManager;
use crate::backend::{Backend, BackendError};
use crate::config::OutboxConfig;
use crate::read_tracker::ReadTracker;
use crate::reconcile::Reconciler;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use sync_core::{DrainGate, RetryDecision, RetryPolicy};
use sync_store::{OutboxStore, SqliteStore};
use sync_types::{
    MessageRow, OutboxEntry, OutgoingMessage, SendOutcome, SyncError, Timestamp,
};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};

/// Result of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries confirmed by the backend.
    pub delivered: usize,
    /// Entries that failed and were scheduled again.
    pub rescheduled: usize,
    /// Entries dropped as permanently failed.
    pub dropped: usize,
    /// Due entries left untouched because the backend was unreachable.
    pub deferred: usize,
}

/// Delivers sends and drains the outbox.
pub struct OutboxProcessor<B> {
    backend: Arc<B>,
    store: SqliteStore,
    reconciler: Arc<Reconciler>,
    reads: Arc<ReadTracker>,
    tokens: Arc<TokenManager<B>>,
    config: OutboxConfig,
    policy: RetryPolicy,
    drain_lock: tokio::sync::Mutex<()>,
    gate: Mutex<DrainGate>,
    link_up: AtomicBool,
}

impl<B: Backend> OutboxProcessor<B> {
    /// Create a processor.
    pub fn new(
        backend: Arc<B>,
        store: SqliteStore,
        reconciler: Arc<Reconciler>,
        reads: Arc<ReadTracker>,
        tokens: Arc<TokenManager<B>>,
        config: OutboxConfig,
    ) -> Self {
        let policy = config.retry_policy();
        Self {
            backend,
            store,
            reconciler,
            reads,
            tokens,
            config,
            policy,
            drain_lock: tokio::sync::Mutex::new(()),
            gate: Mutex::new(DrainGate::new()),
            link_up: AtomicBool::new(true),
        }
    }

    /// Send a message.
    ///
    /// Returns `Err` only if the send could neither be delivered nor
    /// persisted to the outbox.
    pub async fn send(self: &Arc<Self>, message: OutgoingMessage) -> Result<SendOutcome, SyncError> {
        let now = Timestamp::now();
        self.reconciler
            .insert_optimistic(MessageRow::optimistic(&message, now))
            .await;

        match self.deliver(&message).await {
            Ok(row) => {
                self.confirmed(row.clone()).await;
                tracing::debug!("Sent {} as {}", message.id, row.id);
                Ok(SendOutcome::Sent(row))
            }
            Err(e) if e.is_permanent() => {
                tracing::warn!("Send {} rejected: {}", message.id, e);
                self.reconciler
                    .discard_optimistic(&message.group_id, &message.dedupe_key)
                    .await;
                Ok(SendOutcome::PermanentlyFailed(e.to_string()))
            }
            Err(e) => {
                let entry = match self.store.enqueue(&message, now).await {
                    Ok(entry) => entry,
                    Err(err) => {
                        tracing::error!("Failed to queue send {}: {}", message.id, err);
                        self.reconciler
                            .discard_optimistic(&message.group_id, &message.dedupe_key)
                            .await;
                        return Err(err.into());
                    }
                };
                tracing::warn!("Send {} failed ({}), queued as entry {}", message.id, e, entry.id);
                self.request_drain();
                Ok(SendOutcome::Queued)
            }
        }
    }

    /// Open or close the drain gate. Closed, [`drain`](Self::drain)
    /// defers every due entry without attempting or rescheduling it.
    pub fn set_link_up(&self, up: bool) {
        if self.link_up.swap(up, Ordering::SeqCst) != up {
            tracing::debug!("Outbox draining {}", if up { "resumed" } else { "held" });
        }
    }

    /// Whether draining is allowed.
    pub fn is_link_up(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
    }

    /// Drain due entries once. Concurrent calls wait their turn.
    pub async fn drain(&self) -> Result<DrainReport, SyncError> {
        let _guard = self.drain_lock.lock().await;
        let due = self.store.due_entries(Timestamp::now()).await?;
        let mut report = DrainReport::default();
        if due.is_empty() {
            return Ok(report);
        }
        if !self.is_link_up() {
            tracing::trace!("Link down, {} due entries held", due.len());
            report.deferred = due.len();
            return Ok(report);
        }
        tracing::debug!("Draining {} outbox entries", due.len());

        let mut entries = due.into_iter();
        for entry in entries.by_ref() {
            match self.deliver(&entry.payload).await {
                Ok(row) => {
                    self.store.complete_entry(entry.id, &row).await?;
                    self.reconciler.apply_in_memory(row.clone());
                    self.reads.on_own_message_confirmed(&row).await;
                    report.delivered += 1;
                }
                Err(e) if e.is_permanent() => {
                    self.drop_entry(&entry, &e.to_string()).await?;
                    report.dropped += 1;
                }
                Err(e) => {
                    let unreachable = matches!(e, BackendError::Transient(_) | BackendError::Timeout);
                    match self.policy.on_failure(&entry, Timestamp::now()) {
                        RetryDecision::Retry {
                            retry_count,
                            next_retry_at,
                        } => {
                            tracing::debug!(
                                "Entry {} failed ({}), retry {} at {}",
                                entry.id,
                                e,
                                retry_count,
                                next_retry_at
                            );
                            self.store
                                .reschedule(entry.id, retry_count, next_retry_at)
                                .await?;
                            report.rescheduled += 1;
                        }
                        RetryDecision::GiveUp { attempts } => {
                            let reason = format!("gave up after {attempts} attempts: {e}");
                            self.drop_entry(&entry, &reason).await?;
                            report.dropped += 1;
                        }
                    }
                    if unreachable {
                        break;
                    }
                }
            }
        }
        report.deferred = entries.count();

        if report.delivered > 0 || report.dropped > 0 {
            tracing::info!(
                "Outbox drained: {} delivered, {} dropped, {} pending",
                report.delivered,
                report.dropped,
                report.rescheduled + report.deferred
            );
        }
        Ok(report)
    }

    /// Start a background drain, or flag a rerun if one is in progress.
    pub fn request_drain(self: &Arc<Self>) {
        if !self.gate().request() {
            tracing::trace!("Drain in progress, request coalesced");
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(e) = this.drain().await {
                    tracing::warn!("Outbox drain failed: {}", e);
                }
                if !this.gate().finish() {
                    break;
                }
            }
        });
    }

    /// Connectivity came back: everything is due now.
    pub async fn on_connectivity_restored(self: &Arc<Self>) {
        match self.store.reset_schedule(Timestamp::now()).await {
            Ok(0) => {}
            Ok(n) => tracing::debug!("Rescheduled {} outbox entries for immediate drain", n),
            Err(e) => tracing::warn!("Failed to reset outbox schedule: {}", e),
        }
        self.request_drain();
    }

    /// Drain on a fixed period. The first tick fires immediately, so
    /// entries left by a previous run go out at startup.
    pub fn spawn_drain_task(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let period = self.config.drain_interval();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                this.request_drain();
            }
        })
    }

    /// Number of queued sends.
    pub async fn pending(&self) -> Result<u64, SyncError> {
        Ok(self.store.outbox_len().await?)
    }

    /// Preflight, then upsert. An expired token is refreshed once.
    async fn deliver(&self, message: &OutgoingMessage) -> Result<MessageRow, BackendError> {
        match self.attempt(message).await {
            Err(BackendError::AuthExpired) => {
                tracing::debug!("Token expired during send, refreshing");
                match self.tokens.refresh_and_apply().await {
                    Ok(true) => self.attempt(message).await,
                    Ok(false) => Err(BackendError::AuthExpired),
                    Err(e) => Err(e),
                }
            }
            other => other,
        }
    }

    async fn attempt(&self, message: &OutgoingMessage) -> Result<MessageRow, BackendError> {
        timeout(self.config.preflight_timeout(), self.backend.health_check())
            .await
            .map_err(|_| BackendError::Timeout)??;
        timeout(self.config.send_timeout(), self.backend.upsert_message(message))
            .await
            .map_err(|_| BackendError::Timeout)?
    }

    async fn confirmed(&self, row: MessageRow) {
        self.reconciler.apply_authoritative(row.clone()).await;
        self.reads.on_own_message_confirmed(&row).await;
    }

    async fn drop_entry(&self, entry: &OutboxEntry, reason: &str) -> Result<(), SyncError> {
        tracing::error!(
            "Send {} to {} permanently failed: {}",
            entry.payload.id,
            entry.group_id,
            reason
        );
        self.store.remove_entry(entry.id).await?;
        self.reconciler
            .discard_optimistic(&entry.group_id, &entry.payload.dedupe_key)
            .await;
        Ok(())
    }

    fn gate(&self) -> MutexGuard<'_, DrainGate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//! The sync engine facade.
//!
//! [`SyncEngine`] wires the store, reconciler, outbox, read tracker, and
//! connection manager together and is the only type a UI needs. Rendering
//! state is pulled with [`SyncEngine::snapshot`]; change notifications are
//! pushed through [`SyncEngine::subscribe`].

use crate::auth::TokenManager;
use crate::backend::Backend;
use crate::config::Config;
use crate::connection::{ConnectionManager, FeedHandler};
use crate::events::{update_channel, Snapshot, SyncUpdate, UpdateSender, WakeDisposition};
use crate::host::{HostLifecycle, HostState, NetworkMonitor};
use crate::outbox::{DrainReport, OutboxProcessor};
use crate::read_tracker::ReadTracker;
use crate::reconcile::Reconciler;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use sync_core::{ConnectionStatus, FetchMerge};
use sync_store::{Checkpointer, SqliteStore};
use sync_types::{
    ChangeEvent, GroupId, MessageId, OutgoingMessage, PushHint, SendOutcome, SyncError,
    Timestamp, UserId,
};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Routes channel traffic into the engine's services.
struct EngineFeed<B> {
    reconciler: Arc<Reconciler>,
    outbox: Arc<OutboxProcessor<B>>,
    updates: UpdateSender,
}

#[async_trait]
impl<B: Backend> FeedHandler for EngineFeed<B> {
    async fn on_change(&self, event: ChangeEvent) {
        self.reconciler.handle_change(event).await;
    }

    async fn on_connected(&self) {
        self.outbox.on_connectivity_restored().await;
    }

    fn on_status(&self, status: ConnectionStatus) {
        // Connected is emitted before the resume, so the drain it triggers
        // finds the gate open.
        self.outbox.set_link_up(status == ConnectionStatus::Connected);
        let _ = self.updates.send(SyncUpdate::Connection(status));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveView {
    group: GroupId,
    user: UserId,
}

/// Offline-first group chat sync engine.
pub struct SyncEngine<B> {
    config: Config,
    backend: Arc<B>,
    store: SqliteStore,
    reconciler: Arc<Reconciler>,
    reads: Arc<ReadTracker>,
    outbox: Arc<OutboxProcessor<B>>,
    connection: Arc<ConnectionManager<B>>,
    host: HostLifecycle,
    checkpointer: Checkpointer,
    updates: UpdateSender,
    active: Mutex<Option<ActiveView>>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
}

impl<B: Backend> SyncEngine<B> {
    /// Open the local store described by `config` and build an engine.
    pub async fn open(config: Config, backend: Arc<B>) -> Result<Self, SyncError> {
        let store = SqliteStore::open(&config.store).await?;
        Ok(Self::with_store(config, backend, store))
    }

    /// Build an engine over an already opened store.
    pub fn with_store(config: Config, backend: Arc<B>, store: SqliteStore) -> Self {
        let updates = update_channel();
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            updates.clone(),
            config.read.history_limit,
        ));
        let reads = Arc::new(ReadTracker::new(
            store.clone(),
            reconciler.clone(),
            config.read.clone(),
            updates.clone(),
        ));
        let tokens = Arc::new(TokenManager::new(
            backend.clone(),
            config.connection.token_refresh_retries,
            config.connection.token_backoff(),
        ));
        let outbox = Arc::new(OutboxProcessor::new(
            backend.clone(),
            store.clone(),
            reconciler.clone(),
            reads.clone(),
            tokens.clone(),
            config.outbox.clone(),
        ));
        outbox.set_link_up(false);
        let feed = Arc::new(EngineFeed {
            reconciler: reconciler.clone(),
            outbox: outbox.clone(),
            updates: updates.clone(),
        });
        let connection = ConnectionManager::new(
            backend.clone(),
            Arc::new(store.clone()),
            feed,
            tokens,
            Arc::new(NetworkMonitor::new(true)),
            config.connection.clone(),
        );
        let checkpointer = Checkpointer::new(store.clone(), config.store.checkpoint.clone());

        Self {
            config,
            backend,
            store,
            reconciler,
            reads,
            outbox,
            connection,
            host: HostLifecycle::new(HostState::Foreground),
            checkpointer,
            updates,
            active: Mutex::new(None),
            drain_task: Mutex::new(None),
        }
    }

    /// Load `groups`, start the periodic drain, and connect.
    pub async fn start(&self, groups: Vec<GroupId>) -> Result<(), SyncError> {
        for group in &groups {
            self.reconciler.load_group(group).await?;
        }
        tracing::info!("Starting sync engine for {} group(s)", groups.len());
        self.connection.set_groups(groups);

        let task = self.outbox.spawn_drain_task();
        if let Some(previous) = lock(&self.drain_task).replace(task) {
            previous.abort();
        }
        self.connection.start();
        Ok(())
    }

    /// Disconnect and stop background work.
    pub async fn shutdown(&self) {
        if let Some(task) = lock(&self.drain_task).take() {
            task.abort();
        }
        self.connection.shutdown().await;
        tracing::info!("Sync engine stopped");
    }

    // ===========================================
    // Sending and reading
    // ===========================================

    /// Send a message. See [`OutboxProcessor::send`].
    pub async fn send(&self, message: OutgoingMessage) -> Result<SendOutcome, SyncError> {
        self.outbox.send(message).await
    }

    /// Drain the outbox now and wait for the result.
    pub async fn drain_outbox(&self) -> Result<DrainReport, SyncError> {
        self.outbox.drain().await
    }

    /// Number of sends waiting in the outbox.
    pub async fn pending_sends(&self) -> Result<u64, SyncError> {
        self.outbox.pending().await
    }

    /// Move a user's read pointer forward.
    pub async fn mark_read(
        &self,
        group_id: &GroupId,
        user_id: &UserId,
        message_id: Option<MessageId>,
        at: Timestamp,
    ) -> Result<bool, SyncError> {
        self.reads.mark_read(group_id, user_id, message_id, at).await
    }

    // ===========================================
    // Views
    // ===========================================

    /// The user opened a conversation.
    ///
    /// Starts a background fetch of the newest page and the read dwell
    /// timer, and returns what can be shown right away. A user's first view
    /// of a group waits for the fetch instead, so the read baseline lands
    /// on real history. A group outside the subscription is added to it,
    /// resubscribing if connected.
    pub async fn open_group(
        &self,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> Result<Snapshot, SyncError> {
        self.close_group().await?;
        self.reconciler.load_group(group_id).await?;
        if self.connection.add_group(group_id.clone())
            && self.connection.status() == ConnectionStatus::Connected
        {
            // Any attempt already underway reads the new set when it opens.
            tracing::info!("Resubscribing to include group {}", group_id);
            self.connection.force_reconnect();
        }
        let generation = self.reconciler.begin_fetch();
        *lock(&self.active) = Some(ActiveView {
            group: group_id.clone(),
            user: user_id.clone(),
        });

        if self.reads.pointer(group_id, user_id).await?.is_none() {
            if let Err(e) = self.fetch_latest(group_id).await {
                tracing::debug!("History fetch for first view of {} failed: {}", group_id, e);
            }
        } else {
            self.spawn_fetch(group_id.clone(), generation);
        }
        self.reads.open_conversation(group_id, user_id);
        self.snapshot(group_id, user_id).await
    }

    /// The user left the open conversation. Returns `true` if it was
    /// marked read.
    pub async fn close_group(&self) -> Result<bool, SyncError> {
        let Some(view) = lock(&self.active).take() else {
            return Ok(false);
        };
        self.reconciler.begin_fetch();
        self.reads.close_conversation(&view.group, &view.user).await
    }

    /// Group of the open conversation.
    pub fn active_group(&self) -> Option<GroupId> {
        lock(&self.active).as_ref().map(|v| v.group.clone())
    }

    /// Everything needed to render a conversation.
    pub async fn snapshot(
        &self,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> Result<Snapshot, SyncError> {
        self.reconciler.load_group(group_id).await?;
        let unread = self.reads.unread(group_id, user_id).await?;
        Ok(Snapshot {
            messages: self.reconciler.visible(group_id),
            status: self.connection.status(),
            unread,
        })
    }

    /// Receive change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncUpdate> {
        self.updates.subscribe()
    }

    /// Fetch the newest page of a group and merge it under the current
    /// fetch generation.
    pub async fn fetch_latest(&self, group_id: &GroupId) -> Result<Option<FetchMerge>, SyncError> {
        let generation = self.reconciler.generation();
        let rows = timeout(
            self.config.connection.step_timeout(),
            self.backend
                .fetch_messages(group_id, self.config.connection.fetch_page_size),
        )
        .await
        .map_err(|_| SyncError::Timeout("fetch timed out".into()))??;
        self.reconciler
            .complete_fetch(group_id, generation, rows)
            .await
    }

    fn spawn_fetch(&self, group_id: GroupId, generation: u64) {
        let backend = Arc::clone(&self.backend);
        let reconciler = Arc::clone(&self.reconciler);
        let limit = self.config.connection.fetch_page_size;
        let step = self.config.connection.step_timeout();
        tokio::spawn(async move {
            match timeout(step, backend.fetch_messages(&group_id, limit)).await {
                Ok(Ok(rows)) => {
                    if let Err(e) = reconciler.complete_fetch(&group_id, generation, rows).await {
                        tracing::warn!("Failed to merge fetch for {}: {}", group_id, e);
                    }
                }
                Ok(Err(e)) => tracing::debug!("Background fetch for {} failed: {}", group_id, e),
                Err(_) => tracing::debug!("Background fetch for {} timed out", group_id),
            }
        });
    }

    // ===========================================
    // Push hints
    // ===========================================

    /// Handle a push wake carrying a message id.
    ///
    /// The message is fetched and merged by id; a failed fetch is left to
    /// the change feed. The returned disposition tells the notification
    /// layer what to show.
    pub async fn handle_push_hint(&self, hint: &PushHint) -> WakeDisposition {
        if !hint.is_valid() {
            tracing::warn!("Ignoring push hint without message or group id");
            return WakeDisposition::Ignored;
        }

        match timeout(
            self.config.connection.step_timeout(),
            self.backend.fetch_message(&hint.message_id),
        )
        .await
        {
            Ok(Ok(Some(row))) => {
                if row.group_id != hint.group_id {
                    tracing::warn!(
                        "Push hint for {} names group {}, message is in {}",
                        hint.message_id,
                        hint.group_id,
                        row.group_id
                    );
                }
                self.reconciler.apply_authoritative(row).await;
            }
            Ok(Ok(None)) => tracing::debug!("Pushed message {} no longer exists", hint.message_id),
            Ok(Err(e)) => tracing::warn!("Failed to fetch pushed message {}: {}", hint.message_id, e),
            Err(_) => tracing::warn!("Timed out fetching pushed message {}", hint.message_id),
        }

        if !self.host.is_foreground() {
            WakeDisposition::Notify
        } else if self.active_group().as_ref() == Some(&hint.group_id) {
            WakeDisposition::RefreshActiveView
        } else {
            WakeDisposition::NotifyAndCountUnread
        }
    }

    // ===========================================
    // Host and connection signals
    // ===========================================

    /// Host came to the foreground.
    pub fn on_foreground(&self) {
        if self.host.set(HostState::Foreground) {
            tracing::debug!("Host foregrounded");
        }
        self.connection.on_foreground();
        self.outbox.request_drain();
    }

    /// Host went to the background. Checkpoints the store opportunistically.
    pub fn on_background(&self) {
        if self.host.set(HostState::Background) {
            tracing::debug!("Host backgrounded");
        }
        self.connection.on_background();
        self.checkpointer.spawn();
    }

    /// Network reachability report.
    pub fn on_network_change(&self, reachable: bool) {
        self.connection.on_network_change(reachable);
    }

    /// Tear down and reconnect now.
    pub fn force_reconnect(&self) {
        self.connection.force_reconnect();
    }

    /// Connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// Watch connection status.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.watch_status()
    }

    /// Local store.
    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// Backend.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

//! Connection lifecycle manager.
//!
//! Drives [`ConnectionState`] from host, network, and channel signals and
//! executes the [`Action`]s it returns. Reconnection is single-flight: a
//! trigger that arrives while a sequence is running is dropped, and
//! attempts started within the debounce window of the previous one wait
//! out the remainder.
//!
//! A reconnect sequence runs these steps, each under a timeout:
//!
//! 1. Let the host settle for a short stabilization delay
//! 2. Check the runtime is still scheduling tasks
//! 3. Ping the local store
//! 4. Read the cached network state
//! 5. Tear down any previous subscription
//! 6. Refresh the access token, falling back to the cached one
//! 7. Hand the token to the backend
//! 8. Open the subscription through the feed adapter
//! 9. Wait for the subscribe acknowledgement
//!
//! Store and runtime checks only log: a sluggish disk should not keep
//! realtime offline.

use crate::adapter::FeedAdapter;
use crate::auth::TokenManager;
use crate::backend::{Backend, Subscription};
use crate::config::ConnectionConfig;
use crate::host::{runtime_responsive, NetworkMonitor};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use sync_core::{
    Action, ConnectionState, ConnectionStatus, Event, HeartbeatConfig, Liveness, LivenessTracker,
    ReconnectPolicy,
};
use sync_store::SqliteStore;
use sync_types::{ChangeEvent, ChannelId, GroupId, SyncError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};

/// Local store liveness, checked during reconnect.
#[async_trait]
pub trait StoreProbe: Send + Sync + 'static {
    /// Return `Ok` if the store answers a trivial query.
    async fn ping(&self) -> Result<(), SyncError>;
}

#[async_trait]
impl StoreProbe for SqliteStore {
    async fn ping(&self) -> Result<(), SyncError> {
        Ok(SqliteStore::ping(self).await?)
    }
}

/// Receives what the channel delivers.
#[async_trait]
pub trait FeedHandler: Send + Sync + 'static {
    /// A data event from the change feed.
    async fn on_change(&self, event: ChangeEvent);

    /// The channel is live (again). Queued sends may go out.
    async fn on_connected(&self);

    /// The coarse status changed.
    fn on_status(&self, status: ConnectionStatus);
}

#[derive(Default)]
struct Tasks {
    channel: Option<ChannelId>,
    pump: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
}

/// Owns the realtime subscription and keeps it alive.
pub struct ConnectionManager<B> {
    backend: Arc<B>,
    store: Arc<dyn StoreProbe>,
    handler: Arc<dyn FeedHandler>,
    tokens: Arc<TokenManager<B>>,
    network: Arc<NetworkMonitor>,
    adapter: FeedAdapter,
    config: ConnectionConfig,
    policy: ReconnectPolicy,
    heartbeat: HeartbeatConfig,
    groups: Mutex<Vec<GroupId>>,
    state: Mutex<ConnectionState>,
    status: watch::Sender<ConnectionStatus>,
    reconnect_lock: tokio::sync::Mutex<()>,
    last_attempt: Mutex<Option<Instant>>,
    liveness: Mutex<Option<LivenessTracker>>,
    tasks: Mutex<Tasks>,
    shut_down: AtomicBool,
}

impl<B: Backend> ConnectionManager<B> {
    /// Create a manager. The feed adapter is chosen here, once.
    pub fn new(
        backend: Arc<B>,
        store: Arc<dyn StoreProbe>,
        handler: Arc<dyn FeedHandler>,
        tokens: Arc<TokenManager<B>>,
        network: Arc<NetworkMonitor>,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        let adapter = FeedAdapter::probe(
            backend.capabilities(),
            config.poll_interval(),
            config.fetch_page_size,
        );
        tracing::debug!("Using {:?} feed adapter", adapter);
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);

        Arc::new(Self {
            backend,
            store,
            handler,
            tokens,
            network,
            adapter,
            policy: config.reconnect_policy(),
            heartbeat: config.heartbeat(),
            config,
            groups: Mutex::new(Vec::new()),
            state: Mutex::new(ConnectionState::new()),
            status,
            reconnect_lock: tokio::sync::Mutex::new(()),
            last_attempt: Mutex::new(None),
            liveness: Mutex::new(None),
            tasks: Mutex::new(Tasks::default()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Groups the next subscription covers.
    pub fn set_groups(&self, groups: Vec<GroupId>) {
        *lock(&self.groups) = groups;
    }

    /// Add a group to the subscription set. Returns `false` if it was
    /// already covered. The live channel is not touched.
    pub fn add_group(&self, group: GroupId) -> bool {
        let mut groups = lock(&self.groups);
        if groups.contains(&group) {
            return false;
        }
        groups.push(group);
        true
    }

    /// Adapter in use.
    pub fn adapter(&self) -> FeedAdapter {
        self.adapter
    }

    /// Begin connecting.
    pub fn start(self: &Arc<Self>) {
        self.shut_down.store(false, Ordering::SeqCst);
        self.dispatch(Event::ConnectRequested);
    }

    /// Disconnect and stop all timers. Waits for the unsubscribe.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.dispatch(Event::DisconnectRequested);
        if let Some(timer) = lock(&self.tasks).reconnect_timer.take() {
            timer.abort();
        }
        if let Some(channel) = self.detach() {
            self.close_channel(&channel).await;
        }
        tracing::info!("Connection manager stopped");
    }

    /// Tear down and reconnect now.
    pub fn force_reconnect(self: &Arc<Self>) {
        self.dispatch(Event::ForceReconnect);
    }

    /// Host came to the foreground.
    pub fn on_foreground(self: &Arc<Self>) {
        self.dispatch(Event::Foregrounded);
    }

    /// Host went to the background.
    pub fn on_background(self: &Arc<Self>) {
        self.dispatch(Event::Backgrounded);
    }

    /// Network reachability report. Only changes are acted upon.
    pub fn on_network_change(self: &Arc<Self>, reachable: bool) {
        if !self.network.set_reachable(reachable) {
            return;
        }
        self.dispatch(if reachable {
            Event::NetworkRestored
        } else {
            Event::NetworkLost
        });
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Watch status changes.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        lock(&self.state).clone()
    }

    /// Channel of the live subscription, if any.
    pub fn channel(&self) -> Option<ChannelId> {
        lock(&self.tasks).channel.clone()
    }

    // ===========================================
    // State machine
    // ===========================================

    fn dispatch(self: &Arc<Self>, event: Event) {
        let actions = {
            let mut state = lock(&self.state);
            let current = std::mem::take(&mut *state);
            let before = current.status();
            let label = format!("{event:?}");
            let (next, actions) = current.on_event(event, &self.policy);
            if next.status() != before {
                tracing::debug!("Connection {:?} -> {:?} on {}", before, next.status(), label);
            }
            *state = next;
            actions
        };
        for action in actions {
            self.perform(action);
        }
    }

    fn perform(self: &Arc<Self>, action: Action) {
        match action {
            Action::RunReconnect => self.schedule_reconnect(),
            Action::Teardown => {
                if let Some(channel) = self.detach() {
                    let this = Arc::clone(self);
                    tokio::spawn(async move { this.close_channel(&channel).await });
                }
            }
            Action::StartHeartbeat => self.start_liveness(),
            Action::RefreshToken => {
                let tokens = Arc::clone(&self.tokens);
                tokio::spawn(async move {
                    if let Err(e) = tokens.refresh_and_apply().await {
                        tracing::debug!("Background token refresh failed: {}", e);
                    }
                });
            }
            Action::StartReconnectTimer { delay } => self.start_reconnect_timer(delay),
            Action::CancelReconnectTimer => {
                if let Some(timer) = lock(&self.tasks).reconnect_timer.take() {
                    timer.abort();
                }
            }
            Action::ResumeOutbox => {
                let handler = Arc::clone(&self.handler);
                tokio::spawn(async move { handler.on_connected().await });
            }
            Action::EmitStatus(status) => {
                tracing::info!("Connection status: {:?}", status);
                self.status.send_replace(status);
                self.handler.on_status(status);
            }
        }
    }

    fn start_reconnect_timer(self: &Arc<Self>, delay: Duration) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        tracing::debug!("Next reconnect attempt in {:?}", delay);
        let this = Arc::clone(self);
        let timer = tokio::spawn(async move {
            sleep(delay).await;
            this.dispatch(Event::ReconnectTimer);
        });
        if let Some(previous) = lock(&self.tasks).reconnect_timer.replace(timer) {
            previous.abort();
        }
    }

    // ===========================================
    // Reconnect sequence
    // ===========================================

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_reconnect().await });
    }

    async fn run_reconnect(self: Arc<Self>) {
        let Ok(_guard) = self.reconnect_lock.try_lock() else {
            tracing::debug!("Reconnect already in flight, trigger dropped");
            return;
        };

        let last = *lock(&self.last_attempt);
        let wait = last
            .map(|at| (at + self.config.debounce()).saturating_duration_since(Instant::now()))
            .unwrap_or_default();
        if !wait.is_zero() {
            tracing::trace!("Debouncing reconnect for {:?}", wait);
            sleep(wait).await;
        }
        *lock(&self.last_attempt) = Some(Instant::now());

        match self.reconnect_sequence().await {
            Ok(channel) => {
                tracing::info!("Subscribed on channel {}", channel);
                self.dispatch(Event::Subscribed { channel });
            }
            Err(error) => {
                tracing::warn!("Reconnect failed: {}", error);
                self.dispatch(Event::ConnectFailed { error });
            }
        }
    }

    async fn reconnect_sequence(self: &Arc<Self>) -> Result<ChannelId, String> {
        let step = self.config.step_timeout();
        sleep(self.config.stabilize()).await;

        if !runtime_responsive(step).await {
            tracing::warn!("Runtime slow to schedule, continuing reconnect");
        }

        match timeout(step, self.store.ping()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Local store unhealthy ({}), continuing reconnect", e),
            Err(_) => tracing::warn!("Local store ping timed out, continuing reconnect"),
        }

        if !self.network.is_reachable() {
            return Err("network unreachable".into());
        }

        if let Some(previous) = self.detach() {
            self.close_channel(&previous).await;
        }

        match timeout(step, self.tokens.refresh_and_apply()).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => tracing::warn!("No access token available, subscribing without one"),
            Ok(Err(e)) => tracing::warn!("Failed to apply access token: {}", e),
            Err(_) => {
                tracing::warn!("Token refresh timed out, applying cached token");
                if let Ok(Err(e)) = timeout(step, self.tokens.apply_cached()).await {
                    tracing::warn!("Failed to apply cached token: {}", e);
                }
            }
        }

        let groups = lock(&self.groups).clone();
        let Subscription {
            channel,
            mut events,
        } = match timeout(step, self.adapter.open(&self.backend, &groups)).await {
            Ok(Ok(subscription)) => subscription,
            Ok(Err(e)) => return Err(format!("subscribe failed: {e}")),
            Err(_) => return Err("subscribe timed out".into()),
        };

        let mut early = Vec::new();
        let acked = timeout(self.config.subscribe_ack_timeout(), async {
            while let Some(event) = events.recv().await {
                match event {
                    ChangeEvent::Subscribed { channel: ref acked } if *acked == channel => {
                        return Ok(());
                    }
                    event if event.is_terminal() => return Err(format!("{event:?}")),
                    ChangeEvent::Subscribed { .. } | ChangeEvent::HeartbeatAck => {}
                    event => early.push(event),
                }
            }
            Err("channel closed".to_string())
        })
        .await;

        let failure = match acked {
            Ok(Ok(())) => None,
            Ok(Err(reason)) => Some(format!("channel failed before acknowledgement: {reason}")),
            Err(_) => Some(format!(
                "no subscribe acknowledgement within {:?}",
                self.config.subscribe_ack_timeout()
            )),
        };
        if let Some(reason) = failure {
            self.close_channel(&channel).await;
            return Err(reason);
        }

        self.attach(channel.clone(), events, early);
        Ok(channel)
    }

    // ===========================================
    // Channel ownership
    // ===========================================

    fn attach(
        self: &Arc<Self>,
        channel: ChannelId,
        events: mpsc::Receiver<ChangeEvent>,
        early: Vec<ChangeEvent>,
    ) {
        let this = Arc::clone(self);
        let pumped = channel.clone();
        let pump = tokio::spawn(async move { this.pump(pumped, events, early).await });
        let mut tasks = lock(&self.tasks);
        tasks.channel = Some(channel);
        if let Some(previous) = tasks.pump.replace(pump) {
            previous.abort();
        }
    }

    /// Stop the pump and liveness tasks and forget the channel.
    fn detach(&self) -> Option<ChannelId> {
        let (channel, handles) = {
            let mut tasks = lock(&self.tasks);
            (
                tasks.channel.take(),
                [tasks.pump.take(), tasks.heartbeat.take(), tasks.watchdog.take()],
            )
        };
        for handle in handles.into_iter().flatten() {
            handle.abort();
        }
        *lock(&self.liveness) = None;
        channel
    }

    async fn close_channel(&self, channel: &ChannelId) {
        match timeout(
            self.config.step_timeout(),
            self.adapter.close(&self.backend, channel),
        )
        .await
        {
            Ok(Ok(())) => tracing::debug!("Closed channel {}", channel),
            Ok(Err(e)) => tracing::debug!("Failed to close channel {}: {}", channel, e),
            Err(_) => tracing::debug!("Timed out closing channel {}", channel),
        }
    }

    fn is_current(&self, channel: &ChannelId) -> bool {
        lock(&self.tasks).channel.as_ref() == Some(channel)
    }

    async fn pump(
        self: Arc<Self>,
        channel: ChannelId,
        mut events: mpsc::Receiver<ChangeEvent>,
        early: Vec<ChangeEvent>,
    ) {
        for event in early {
            self.handler.on_change(event).await;
        }
        while let Some(event) = events.recv().await {
            if !self.is_current(&channel) {
                tracing::debug!("Dropping event from stale channel {}", channel);
                return;
            }
            self.record_inbound();
            match event {
                ChangeEvent::HeartbeatAck | ChangeEvent::Subscribed { .. } => {}
                event if event.is_terminal() => {
                    tracing::warn!("Channel {} failed: {:?}", channel, event);
                    self.dispatch(Event::ChannelFailed {
                        reason: format!("{event:?}"),
                    });
                    return;
                }
                event => self.handler.on_change(event).await,
            }
        }
        if self.is_current(&channel) {
            tracing::warn!("Channel {} closed by backend", channel);
            self.dispatch(Event::ChannelFailed {
                reason: "channel closed".into(),
            });
        }
    }

    // ===========================================
    // Heartbeat and watchdog
    // ===========================================

    fn record_inbound(&self) {
        if let Some(tracker) = lock(&self.liveness).as_mut() {
            tracker.record_event(Instant::now().into_std());
        }
    }

    fn start_liveness(self: &Arc<Self>) {
        if !self.adapter.uses_heartbeat() {
            return;
        }
        let Some(channel) = self.channel() else {
            return;
        };
        *lock(&self.liveness) = Some(LivenessTracker::new(
            self.heartbeat.dead_after,
            Instant::now().into_std(),
        ));

        let this = Arc::clone(self);
        let heartbeat = tokio::spawn(async move { this.heartbeat_loop(channel).await });
        let this = Arc::clone(self);
        let watchdog = tokio::spawn(async move { this.watchdog_loop().await });

        let mut tasks = lock(&self.tasks);
        for previous in [
            tasks.heartbeat.replace(heartbeat),
            tasks.watchdog.replace(watchdog),
        ]
        .into_iter()
        .flatten()
        {
            previous.abort();
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, channel: ChannelId) {
        let period = self.heartbeat.interval;
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            timer.tick().await;
            if !self.is_current(&channel) {
                return;
            }
            if let Some(tracker) = lock(&self.liveness).as_mut() {
                tracker.record_heartbeat_sent();
            }
            match timeout(self.config.step_timeout(), self.backend.send_heartbeat(&channel)).await {
                Ok(Ok(())) => tracing::trace!("Heartbeat sent on {}", channel),
                Ok(Err(e)) => tracing::debug!("Heartbeat on {} failed: {}", channel, e),
                Err(_) => tracing::debug!("Heartbeat on {} timed out", channel),
            }
        }
    }

    async fn watchdog_loop(self: Arc<Self>) {
        let period = self.heartbeat.watchdog_interval;
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            timer.tick().await;
            let verdict = match lock(&self.liveness).as_ref() {
                Some(tracker) => tracker.check(Instant::now().into_std()),
                None => return,
            };
            if let Liveness::Dead { silent_for } = verdict {
                tracing::warn!("No inbound event for {:?}, channel presumed dead", silent_for);
                self.dispatch(Event::HeartbeatTimeout { silent_for });
                return;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        changes: Mutex<Vec<ChangeEvent>>,
        connected: AtomicUsize,
        statuses: Mutex<Vec<ConnectionStatus>>,
    }

    #[async_trait]
    impl FeedHandler for Recorder {
        async fn on_change(&self, event: ChangeEvent) {
            lock(&self.changes).push(event);
        }

        async fn on_connected(&self) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }

        fn on_status(&self, status: ConnectionStatus) {
            lock(&self.statuses).push(status);
        }
    }

    struct Healthy;

    #[async_trait]
    impl StoreProbe for Healthy {
        async fn ping(&self) -> Result<(), SyncError> {
            Ok(())
        }
    }

    fn manager(
        backend: &Arc<MockBackend>,
        recorder: &Arc<Recorder>,
    ) -> Arc<ConnectionManager<MockBackend>> {
        let config = ConnectionConfig::default();
        let tokens = Arc::new(TokenManager::new(
            backend.clone(),
            config.token_refresh_retries,
            config.token_backoff(),
        ));
        let manager = ConnectionManager::new(
            backend.clone(),
            Arc::new(Healthy),
            recorder.clone(),
            tokens,
            Arc::new(NetworkMonitor::new(true)),
            config,
        );
        manager.set_groups(vec![GroupId::new("g1")]);
        manager
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[tokio::test(start_paused = true)]
    async fn connects_and_delivers_changes() {
        let backend = Arc::new(MockBackend::new());
        let recorder = Arc::new(Recorder::default());
        let manager = manager(&backend, &recorder);

        manager.start();
        sleep(secs(1)).await;
        assert_eq!(manager.status(), ConnectionStatus::Connected);
        assert_eq!(recorder.connected.load(Ordering::SeqCst), 1);

        let row = backend.insert_remote(&GroupId::new("g1"), "bob", "hello");
        sleep(Duration::from_millis(10)).await;
        assert_eq!(*lock(&recorder.changes), vec![ChangeEvent::Insert(row)]);
        assert_eq!(
            *lock(&recorder.statuses),
            vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_channel_with_acks_stays_connected() {
        let backend = Arc::new(MockBackend::new());
        let recorder = Arc::new(Recorder::default());
        let manager = manager(&backend, &recorder);

        manager.start();
        sleep(secs(150)).await;

        assert_eq!(manager.status(), ConnectionStatus::Connected);
        assert_eq!(backend.subscribe_calls(), 1);
        assert!(backend.heartbeats() >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_channel_is_replaced() {
        let backend = Arc::new(MockBackend::new());
        let recorder = Arc::new(Recorder::default());
        let manager = manager(&backend, &recorder);

        manager.start();
        sleep(secs(1)).await;
        let first = manager.channel().unwrap();
        backend.withhold_heartbeat_ack(true);

        sleep(secs(90)).await;
        assert_eq!(backend.subscribe_calls(), 2);
        assert_eq!(manager.status(), ConnectionStatus::Connected);
        assert_ne!(manager.channel().unwrap(), first);
        assert_eq!(backend.open_channels(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_force_reconnects_run_once() {
        let backend = Arc::new(MockBackend::new());
        let recorder = Arc::new(Recorder::default());
        let manager = manager(&backend, &recorder);

        manager.start();
        sleep(secs(5)).await;
        assert_eq!(backend.subscribe_calls(), 1);

        for _ in 0..5 {
            manager.force_reconnect();
        }
        sleep(secs(5)).await;

        assert_eq!(backend.subscribe_calls(), 2);
        assert_eq!(manager.status(), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ack_is_a_failed_attempt() {
        let backend = Arc::new(MockBackend::new());
        backend.withhold_subscribe_ack(true);
        let recorder = Arc::new(Recorder::default());
        let manager = manager(&backend, &recorder);

        manager.start();
        sleep(secs(11)).await;
        assert_eq!(manager.status(), ConnectionStatus::Reconnecting);
        assert_eq!(backend.open_channels(), 0);

        backend.withhold_subscribe_ack(false);
        sleep(secs(60)).await;
        assert_eq!(manager.status(), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn channel_error_triggers_recovery() {
        let backend = Arc::new(MockBackend::new());
        let recorder = Arc::new(Recorder::default());
        let manager = manager(&backend, &recorder);

        manager.start();
        sleep(secs(1)).await;
        backend.close_channels(ChangeEvent::ChannelError("boom".into()));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.status(), ConnectionStatus::Reconnecting);

        sleep(secs(10)).await;
        assert_eq!(manager.status(), ConnectionStatus::Connected);
        assert_eq!(backend.subscribe_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn network_loss_disconnects_and_restore_reconnects() {
        let backend = Arc::new(MockBackend::new());
        let recorder = Arc::new(Recorder::default());
        let manager = manager(&backend, &recorder);

        manager.start();
        sleep(secs(1)).await;
        manager.on_network_change(false);
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        sleep(secs(1)).await;
        assert_eq!(backend.open_channels(), 0);

        manager.on_network_change(true);
        sleep(secs(3)).await;
        assert_eq!(manager.status(), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_channel() {
        let backend = Arc::new(MockBackend::new());
        let recorder = Arc::new(Recorder::default());
        let manager = manager(&backend, &recorder);

        manager.start();
        sleep(secs(1)).await;
        manager.shutdown().await;

        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(backend.open_channels(), 0);
        sleep(secs(120)).await;
        assert_eq!(backend.subscribe_calls(), 1);
    }
}

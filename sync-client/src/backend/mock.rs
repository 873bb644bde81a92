//! Mock backend for testing.
//!
//! Keeps a remote message table in memory, echoes inserts onto open
//! channels, and lets tests inject outages and failures.

use super::{Backend, BackendError, Capabilities, Subscription};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use sync_types::{
    AuthToken, ChangeEvent, ChannelId, GroupId, MessageId, MessageRow, OutgoingMessage, RowState,
    Timestamp, UserId,
};
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 256;

/// Mock backend for testing.
///
/// Clones share state, so a test can keep a handle while the engine owns
/// another.
#[derive(Debug, Default)]
pub struct MockBackend {
    inner: Arc<Mutex<MockBackendInner>>,
}

#[derive(Debug)]
struct MockChannel {
    groups: Vec<GroupId>,
    tx: mpsc::Sender<ChangeEvent>,
}

#[derive(Debug, Default)]
struct MockBackendInner {
    offline: bool,
    polling_only: bool,
    withhold_subscribe_ack: bool,
    withhold_heartbeat_ack: bool,
    token_expired: bool,
    rows: Vec<MessageRow>,
    last_created_at: i64,
    next_row: u64,
    channels: HashMap<ChannelId, MockChannel>,
    next_channel: u64,
    token: Option<AuthToken>,
    next_token: u64,
    fail_next_upsert: Option<BackendError>,
    failing_refreshes: u32,
    upsert_delay: Option<Duration>,
    upsert_calls: u32,
    subscribe_calls: u32,
    unsubscribe_calls: u32,
    heartbeats: u32,
    refresh_calls: u32,
}

fn lock(inner: &Mutex<MockBackendInner>) -> MutexGuard<'_, MockBackendInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockBackendInner {
    fn check_online(&self) -> Result<(), BackendError> {
        if self.offline {
            Err(BackendError::Transient("network unreachable".into()))
        } else {
            Ok(())
        }
    }

    fn next_created_at(&mut self) -> Timestamp {
        let now = Timestamp::now().as_millis();
        self.last_created_at = now.max(self.last_created_at + 1);
        Timestamp::from_millis(self.last_created_at)
    }

    fn broadcast(&mut self, group_id: &GroupId, event: ChangeEvent) {
        for channel in self.channels.values() {
            if channel.groups.contains(group_id) {
                let _ = channel.tx.try_send(event.clone());
            }
        }
    }
}

impl MockBackend {
    /// Create an online mock with a realtime feed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock without a change feed, forcing the polling adapter.
    pub fn polling() -> Self {
        let backend = Self::default();
        lock(&backend.inner).polling_only = true;
        backend
    }

    // ===========================================
    // Failure injection
    // ===========================================

    /// Take the network up or down. While down every call fails with
    /// [`BackendError::Transient`] and heartbeats go unanswered.
    pub fn set_online(&self, online: bool) {
        lock(&self.inner).offline = !online;
    }

    /// Whether the mock is reachable.
    pub fn is_online(&self) -> bool {
        !lock(&self.inner).offline
    }

    /// Stop (or resume) acknowledging new subscriptions.
    pub fn withhold_subscribe_ack(&self, withhold: bool) {
        lock(&self.inner).withhold_subscribe_ack = withhold;
    }

    /// Stop (or resume) answering heartbeats.
    pub fn withhold_heartbeat_ack(&self, withhold: bool) {
        lock(&self.inner).withhold_heartbeat_ack = withhold;
    }

    /// Reject requests with [`BackendError::AuthExpired`] until a fresh
    /// token is applied.
    pub fn expire_token(&self) {
        lock(&self.inner).token_expired = true;
    }

    /// Cause the next upsert to fail with `error`.
    pub fn fail_next_upsert(&self, error: BackendError) {
        lock(&self.inner).fail_next_upsert = Some(error);
    }

    /// Cause the next `count` token refreshes to fail.
    pub fn fail_refreshes(&self, count: u32) {
        lock(&self.inner).failing_refreshes = count;
    }

    /// Delay every upsert by `delay`.
    pub fn set_upsert_delay(&self, delay: Option<Duration>) {
        lock(&self.inner).upsert_delay = delay;
    }

    /// Push `event` to every open channel and drop them all.
    pub fn close_channels(&self, event: ChangeEvent) {
        let mut inner = lock(&self.inner);
        for (_, channel) in inner.channels.drain() {
            let _ = channel.tx.try_send(event.clone());
        }
    }

    // ===========================================
    // Remote table
    // ===========================================

    /// Store a message from another participant and echo it to channels.
    pub fn insert_remote(&self, group_id: &GroupId, author: &str, content: &str) -> MessageRow {
        let mut inner = lock(&self.inner);
        inner.next_row += 1;
        let row = MessageRow {
            id: MessageId::new(format!("srv-{}", inner.next_row)),
            group_id: group_id.clone(),
            author_id: UserId::new(author),
            content: content.to_string(),
            attachment: None,
            created_at: inner.next_created_at(),
            dedupe_key: None,
            state: RowState::Confirmed,
        };
        inner.rows.push(row.clone());
        inner.broadcast(group_id, ChangeEvent::Insert(row.clone()));
        row
    }

    /// Delete a message and announce the deletion.
    pub fn delete_remote(&self, id: &MessageId) -> bool {
        let mut inner = lock(&self.inner);
        let Some(index) = inner.rows.iter().position(|r| &r.id == id) else {
            return false;
        };
        let row = inner.rows.remove(index);
        inner.broadcast(
            &row.group_id,
            ChangeEvent::Delete {
                group_id: row.group_id.clone(),
                id: row.id.clone(),
            },
        );
        true
    }

    /// Rows stored for a group, oldest first.
    pub fn remote_rows(&self, group_id: &GroupId) -> Vec<MessageRow> {
        lock(&self.inner)
            .rows
            .iter()
            .filter(|r| &r.group_id == group_id)
            .cloned()
            .collect()
    }

    /// Rows stored across all groups.
    pub fn remote_count(&self) -> usize {
        lock(&self.inner).rows.len()
    }

    // ===========================================
    // Call counters
    // ===========================================

    /// Upsert calls received, failed ones included.
    pub fn upsert_calls(&self) -> u32 {
        lock(&self.inner).upsert_calls
    }

    /// Subscribe calls received.
    pub fn subscribe_calls(&self) -> u32 {
        lock(&self.inner).subscribe_calls
    }

    /// Unsubscribe calls received.
    pub fn unsubscribe_calls(&self) -> u32 {
        lock(&self.inner).unsubscribe_calls
    }

    /// Heartbeats received.
    pub fn heartbeats(&self) -> u32 {
        lock(&self.inner).heartbeats
    }

    /// Token refreshes requested.
    pub fn refresh_calls(&self) -> u32 {
        lock(&self.inner).refresh_calls
    }

    /// Channels currently open.
    pub fn open_channels(&self) -> usize {
        lock(&self.inner).channels.len()
    }

    /// Token most recently applied through `set_token`.
    pub fn current_token(&self) -> Option<AuthToken> {
        lock(&self.inner).token.clone()
    }
}

impl Clone for MockBackend {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn capabilities(&self) -> Capabilities {
        if lock(&self.inner).polling_only {
            Capabilities {
                realtime: false,
                heartbeat: false,
            }
        } else {
            Capabilities::default()
        }
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        lock(&self.inner).check_online()
    }

    async fn upsert_message(&self, message: &OutgoingMessage) -> Result<MessageRow, BackendError> {
        let delay = {
            let mut inner = lock(&self.inner);
            inner.upsert_calls += 1;
            inner.upsert_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = lock(&self.inner);
        inner.check_online()?;
        if inner.token_expired {
            return Err(BackendError::AuthExpired);
        }
        if let Some(error) = inner.fail_next_upsert.take() {
            return Err(error);
        }
        if message.content.trim().is_empty() && message.attachment.is_none() {
            return Err(BackendError::Validation("empty message".into()));
        }

        // Idempotent by dedupe key
        if let Some(existing) = inner
            .rows
            .iter()
            .find(|r| r.dedupe_key.as_ref() == Some(&message.dedupe_key))
        {
            return Ok(existing.clone());
        }

        inner.next_row += 1;
        let row = MessageRow {
            id: MessageId::new(format!("srv-{}", inner.next_row)),
            group_id: message.group_id.clone(),
            author_id: message.author_id.clone(),
            content: message.content.clone(),
            attachment: message.attachment.clone(),
            created_at: inner.next_created_at(),
            dedupe_key: Some(message.dedupe_key.clone()),
            state: RowState::Confirmed,
        };
        inner.rows.push(row.clone());
        inner.broadcast(&message.group_id, ChangeEvent::Insert(row.clone()));
        Ok(row)
    }

    async fn fetch_messages(
        &self,
        group_id: &GroupId,
        limit: u32,
    ) -> Result<Vec<MessageRow>, BackendError> {
        let inner = lock(&self.inner);
        inner.check_online()?;
        let rows: Vec<_> = inner
            .rows
            .iter()
            .filter(|r| &r.group_id == group_id)
            .cloned()
            .collect();
        let skip = rows.len().saturating_sub(limit as usize);
        Ok(rows.into_iter().skip(skip).collect())
    }

    async fn fetch_message(&self, id: &MessageId) -> Result<Option<MessageRow>, BackendError> {
        let inner = lock(&self.inner);
        inner.check_online()?;
        Ok(inner.rows.iter().find(|r| &r.id == id).cloned())
    }

    async fn refresh_token(&self) -> Result<AuthToken, BackendError> {
        let mut inner = lock(&self.inner);
        inner.refresh_calls += 1;
        inner.check_online()?;
        if inner.failing_refreshes > 0 {
            inner.failing_refreshes -= 1;
            return Err(BackendError::Transient("token endpoint unavailable".into()));
        }
        inner.next_token += 1;
        let n = inner.next_token;
        Ok(AuthToken {
            id: format!("tok-{n}"),
            secret: format!("secret-{n}"),
            expires_at: Timestamp::now().plus_millis(3_600_000),
        })
    }

    async fn set_token(&self, token: &AuthToken) -> Result<(), BackendError> {
        let mut inner = lock(&self.inner);
        if !token.is_expired(Timestamp::now()) {
            inner.token_expired = false;
        }
        inner.token = Some(token.clone());
        Ok(())
    }

    async fn subscribe(&self, groups: &[GroupId]) -> Result<Subscription, BackendError> {
        let mut inner = lock(&self.inner);
        inner.subscribe_calls += 1;
        inner.check_online()?;
        if inner.token_expired {
            return Err(BackendError::AuthExpired);
        }

        inner.next_channel += 1;
        let channel = ChannelId::new(format!("ch-{}", inner.next_channel));
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        if !inner.withhold_subscribe_ack {
            let _ = tx.try_send(ChangeEvent::Subscribed {
                channel: channel.clone(),
            });
        }
        inner.channels.insert(
            channel.clone(),
            MockChannel {
                groups: groups.to_vec(),
                tx,
            },
        );
        Ok(Subscription {
            channel,
            events: rx,
        })
    }

    async fn unsubscribe(&self, channel: &ChannelId) -> Result<(), BackendError> {
        let mut inner = lock(&self.inner);
        inner.unsubscribe_calls += 1;
        inner.channels.remove(channel);
        Ok(())
    }

    async fn send_heartbeat(&self, channel: &ChannelId) -> Result<(), BackendError> {
        let mut inner = lock(&self.inner);
        inner.heartbeats += 1;
        inner.check_online()?;
        let ack = !inner.withhold_heartbeat_ack;
        let Some(open) = inner.channels.get(channel) else {
            return Err(BackendError::NotSubscribed(channel.clone()));
        };
        if ack {
            let _ = open.tx.try_send(ChangeEvent::HeartbeatAck);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> GroupId {
        GroupId::new("g1")
    }

    fn outgoing(content: &str) -> OutgoingMessage {
        OutgoingMessage::new(group(), UserId::new("alice"), content)
    }

    // ===========================================
    // Upsert
    // ===========================================

    #[tokio::test]
    async fn upsert_is_idempotent_by_dedupe_key() {
        let backend = MockBackend::new();
        let message = outgoing("hello");

        let first = backend.upsert_message(&message).await.unwrap();
        let second = backend.upsert_message(&message).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.dedupe_key, Some(message.dedupe_key.clone()));
        assert_eq!(backend.remote_count(), 1);
        assert_eq!(backend.upsert_calls(), 2);
    }

    #[tokio::test]
    async fn offline_upsert_fails_transiently() {
        let backend = MockBackend::new();
        backend.set_online(false);

        let result = backend.upsert_message(&outgoing("hi")).await;
        assert!(matches!(result, Err(BackendError::Transient(_))));
        assert_eq!(backend.remote_count(), 0);
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let backend = MockBackend::new();
        let result = backend.upsert_message(&outgoing("   ")).await;
        assert!(matches!(result, Err(BackendError::Validation(_))));
    }

    #[tokio::test]
    async fn expired_token_blocks_until_refreshed() {
        let backend = MockBackend::new();
        backend.expire_token();
        assert_eq!(
            backend.upsert_message(&outgoing("hi")).await,
            Err(BackendError::AuthExpired)
        );

        let token = backend.refresh_token().await.unwrap();
        backend.set_token(&token).await.unwrap();
        backend.upsert_message(&outgoing("hi")).await.unwrap();
        assert_eq!(backend.current_token(), Some(token));
    }

    #[tokio::test]
    async fn remote_timestamps_are_strictly_increasing() {
        let backend = MockBackend::new();
        let a = backend.insert_remote(&group(), "bob", "one");
        let b = backend.insert_remote(&group(), "bob", "two");
        assert!(b.created_at > a.created_at);
    }

    // ===========================================
    // Change feed
    // ===========================================

    #[tokio::test]
    async fn subscribe_acknowledges_then_echoes_inserts() {
        let backend = MockBackend::new();
        let mut sub = backend.subscribe(&[group()]).await.unwrap();

        assert_eq!(
            sub.events.recv().await,
            Some(ChangeEvent::Subscribed {
                channel: sub.channel.clone()
            })
        );

        let row = backend.insert_remote(&group(), "bob", "hey");
        assert_eq!(sub.events.recv().await, Some(ChangeEvent::Insert(row)));

        // Other groups are filtered out
        backend.insert_remote(&GroupId::new("other"), "bob", "elsewhere");
        assert!(sub.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn heartbeat_is_acknowledged_on_channel() {
        let backend = MockBackend::new();
        let mut sub = backend.subscribe(&[group()]).await.unwrap();
        sub.events.recv().await.unwrap();

        backend.send_heartbeat(&sub.channel).await.unwrap();
        assert_eq!(sub.events.recv().await, Some(ChangeEvent::HeartbeatAck));

        backend.withhold_heartbeat_ack(true);
        backend.send_heartbeat(&sub.channel).await.unwrap();
        assert!(sub.events.try_recv().is_err());
        assert_eq!(backend.heartbeats(), 2);
    }

    #[tokio::test]
    async fn unsubscribe_closes_channel() {
        let backend = MockBackend::new();
        let mut sub = backend.subscribe(&[group()]).await.unwrap();
        sub.events.recv().await.unwrap();

        backend.unsubscribe(&sub.channel).await.unwrap();
        assert_eq!(sub.events.recv().await, None);
        assert_eq!(backend.open_channels(), 0);
        assert!(matches!(
            backend.send_heartbeat(&sub.channel).await,
            Err(BackendError::NotSubscribed(_))
        ));
    }

    #[tokio::test]
    async fn delete_is_announced() {
        let backend = MockBackend::new();
        let row = backend.insert_remote(&group(), "bob", "oops");
        let mut sub = backend.subscribe(&[group()]).await.unwrap();
        sub.events.recv().await.unwrap();

        assert!(backend.delete_remote(&row.id));
        assert_eq!(
            sub.events.recv().await,
            Some(ChangeEvent::Delete {
                group_id: group(),
                id: row.id.clone()
            })
        );
        assert!(backend.fetch_message(&row.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fetch_returns_newest_page_in_order() {
        let backend = MockBackend::new();
        for i in 0..5 {
            backend.insert_remote(&group(), "bob", &format!("m{i}"));
        }
        let page = backend.fetch_messages(&group(), 2).await.unwrap();
        let contents: Vec<_> = page.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let backend = MockBackend::new();
        let handle = backend.clone();
        backend.insert_remote(&group(), "bob", "shared");
        assert_eq!(handle.remote_count(), 1);
    }
}

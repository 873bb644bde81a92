//! Remote backend abstraction.
//!
//! The backend owns the authoritative message table, an idempotent
//! upsert keyed by dedupe key, short-lived access tokens, and a filtered
//! change feed. Everything the engine needs from it goes through the
//! [`Backend`] trait so tests can swap in [`MockBackend`].
//!
//! # Design
//!
//! - `upsert_message()` is idempotent per dedupe key; retries never duplicate
//! - `subscribe()` returns a channel of [`ChangeEvent`]s; the subscription is
//!   live only after a `Subscribed` event arrives on it
//! - `send_heartbeat()` is answered by a `HeartbeatAck` on the same channel

mod mock;

pub use mock::MockBackend;

use async_trait::async_trait;
use sync_types::{
    AuthToken, ChangeEvent, ChannelId, GroupId, MessageId, MessageRow, OutgoingMessage, SyncError,
};
use thiserror::Error;
use tokio::sync::mpsc;

/// Backend errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The request did not reach the backend or got no answer.
    #[error("transient network error: {0}")]
    Transient(String),

    /// The access token is no longer accepted.
    #[error("access token expired")]
    AuthExpired,

    /// The backend rejected the request; retrying cannot help.
    #[error("rejected by backend: {0}")]
    Validation(String),

    /// The request exceeded its deadline.
    #[error("request timed out")]
    Timeout,

    /// The channel is unknown to the backend.
    #[error("channel not subscribed: {0}")]
    NotSubscribed(ChannelId),
}

impl BackendError {
    /// Whether retrying the same request is pointless.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

impl From<BackendError> for SyncError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Transient(reason) => SyncError::TransientNetwork(reason),
            BackendError::AuthExpired => SyncError::AuthExpired,
            BackendError::Validation(reason) => SyncError::PermanentValidation(reason),
            BackendError::Timeout => SyncError::Timeout("backend request".into()),
            BackendError::NotSubscribed(channel) => {
                SyncError::TransientNetwork(format!("channel {channel} not subscribed"))
            }
        }
    }
}

/// What the backend supports, probed once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// A push change feed is available.
    pub realtime: bool,
    /// The feed answers heartbeats.
    pub heartbeat: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            realtime: true,
            heartbeat: true,
        }
    }
}

/// An open change-feed subscription.
#[derive(Debug)]
pub struct Subscription {
    /// Channel identifier, used for heartbeats and teardown.
    pub channel: ChannelId,
    /// Inbound events. Closed when the backend drops the channel.
    pub events: mpsc::Receiver<ChangeEvent>,
}

/// Remote backend used by the sync engine.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Advertised capabilities.
    fn capabilities(&self) -> Capabilities;

    /// Cheap reachability probe.
    async fn health_check(&self) -> Result<(), BackendError>;

    /// Insert `message` or return the row already stored under its
    /// dedupe key.
    async fn upsert_message(&self, message: &OutgoingMessage) -> Result<MessageRow, BackendError>;

    /// The newest `limit` rows of a group, oldest first.
    async fn fetch_messages(
        &self,
        group_id: &GroupId,
        limit: u32,
    ) -> Result<Vec<MessageRow>, BackendError>;

    /// A single row by id.
    async fn fetch_message(&self, id: &MessageId) -> Result<Option<MessageRow>, BackendError>;

    /// Obtain a fresh access token.
    async fn refresh_token(&self) -> Result<AuthToken, BackendError>;

    /// Use `token` for subsequent requests and subscriptions.
    async fn set_token(&self, token: &AuthToken) -> Result<(), BackendError>;

    /// Open a change feed filtered to `groups`.
    async fn subscribe(&self, groups: &[GroupId]) -> Result<Subscription, BackendError>;

    /// Close a change feed.
    async fn unsubscribe(&self, channel: &ChannelId) -> Result<(), BackendError>;

    /// Send a heartbeat on `channel`.
    async fn send_heartbeat(&self, channel: &ChannelId) -> Result<(), BackendError>;
}

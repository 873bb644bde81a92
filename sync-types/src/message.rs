//! Message data model: outgoing sends, local rows, and outbox entries.
//!
//! A [`MessageRow`] carries an explicit [`RowState`]. State only moves
//! through [`RowState::apply`], so a tombstoned row can never become
//! visible again.

use crate::ids::{DedupeKey, GroupId, MessageId, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A message the local user has submitted for sending.
///
/// Lives in memory until it is reconciled with its authoritative row or
/// permanently fails. While it waits in the outbox it is persisted as the
/// payload of an [`OutboxEntry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    /// Client-generated id, used for the optimistic row.
    pub id: MessageId,
    /// Destination group.
    pub group_id: GroupId,
    /// Sending user.
    pub author_id: UserId,
    /// Message text.
    pub content: String,
    /// Optional attachment reference (an opaque storage key or URL).
    pub attachment: Option<String>,
    /// Idempotency key shared by every attempt of this send.
    pub dedupe_key: DedupeKey,
}

impl OutgoingMessage {
    /// Create a new outgoing message with a fresh id and dedupe key.
    pub fn new(group_id: GroupId, author_id: UserId, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::generate(),
            group_id,
            author_id,
            content: content.into(),
            attachment: None,
            dedupe_key: DedupeKey::generate(),
        }
    }

    /// Attach a reference to uploaded media.
    pub fn with_attachment(mut self, attachment: impl Into<String>) -> Self {
        self.attachment = Some(attachment.into());
        self
    }
}

/// Lifecycle of a locally held message row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowState {
    /// Inserted locally on submit; the backend has not confirmed it yet.
    Optimistic,
    /// The backend has acknowledged this row.
    Confirmed,
    /// Deleted. Never shown again and never resurrected by later data.
    Tombstoned,
}

/// Inputs that move a [`RowState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowTransition {
    /// An authoritative copy of the row arrived.
    Confirm,
    /// The row was deleted.
    Tombstone,
}

/// Rejected row state transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// A tombstoned row was asked to become visible again.
    #[error("row is tombstoned, {0:?} rejected")]
    Tombstoned(RowTransition),
}

impl RowState {
    /// Apply a transition.
    ///
    /// `Tombstoned` is absorbing: tombstoning it again is a no-op and any
    /// other transition is an error.
    pub fn apply(self, transition: RowTransition) -> Result<RowState, TransitionError> {
        match (self, transition) {
            (Self::Tombstoned, RowTransition::Tombstone) => Ok(Self::Tombstoned),
            (Self::Tombstoned, other) => Err(TransitionError::Tombstoned(other)),
            (_, RowTransition::Tombstone) => Ok(Self::Tombstoned),
            (Self::Optimistic | Self::Confirmed, RowTransition::Confirm) => Ok(Self::Confirmed),
        }
    }

    /// Whether rows in this state appear in visible projections.
    pub fn is_visible(self) -> bool {
        !matches!(self, Self::Tombstoned)
    }
}

/// A message row as held in the local store and the visible timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    /// Server id once known, otherwise the client-generated id.
    pub id: MessageId,
    /// Owning group.
    pub group_id: GroupId,
    /// Author of the message.
    pub author_id: UserId,
    /// Message text.
    pub content: String,
    /// Optional attachment reference.
    pub attachment: Option<String>,
    /// Creation time; defines visible order within a group.
    pub created_at: Timestamp,
    /// Dedupe key, present for rows that originated from a local send.
    pub dedupe_key: Option<DedupeKey>,
    /// Lifecycle state.
    pub state: RowState,
}

impl MessageRow {
    /// Build the optimistic row shown immediately after submit.
    pub fn optimistic(message: &OutgoingMessage, created_at: Timestamp) -> Self {
        Self {
            id: message.id.clone(),
            group_id: message.group_id.clone(),
            author_id: message.author_id.clone(),
            content: message.content.clone(),
            attachment: message.attachment.clone(),
            created_at,
            dedupe_key: Some(message.dedupe_key.clone()),
            state: RowState::Optimistic,
        }
    }

    /// Build a tombstone marker for a deleted row.
    pub fn tombstone(group_id: GroupId, id: MessageId) -> Self {
        Self {
            id,
            group_id,
            author_id: UserId::new(""),
            content: String::new(),
            attachment: None,
            created_at: Timestamp::zero(),
            dedupe_key: None,
            state: RowState::Tombstoned,
        }
    }

    /// Whether the row is still awaiting confirmation.
    pub fn is_optimistic(&self) -> bool {
        self.state == RowState::Optimistic
    }

    /// Whether the row is a tombstone.
    pub fn is_tombstoned(&self) -> bool {
        self.state == RowState::Tombstoned
    }
}

/// A persisted, not-yet-confirmed send.
///
/// An entry exists iff its message has not been confirmed by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    /// Local auto-increment id.
    pub id: i64,
    /// Destination group.
    pub group_id: GroupId,
    /// Sending user.
    pub author_id: UserId,
    /// The message being delivered.
    pub payload: OutgoingMessage,
    /// Failed delivery attempts so far.
    pub retry_count: u32,
    /// Earliest time the next attempt may run.
    pub next_retry_at: Timestamp,
}

/// Result of a send as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Delivered directly; carries the authoritative row.
    Sent(MessageRow),
    /// Persisted to the outbox; delivery will be retried.
    Queued,
    /// Rejected by the backend and dropped.
    PermanentlyFailed(String),
}

//! Types exchanged with the remote backend's realtime feed and auth service.

use crate::ids::{ChannelId, GroupId, MessageId, Timestamp, UserId};
use crate::message::MessageRow;
use serde::{Deserialize, Serialize};

/// An event delivered on a realtime subscription.
///
/// Every variant counts as proof of life for the channel, including
/// [`ChangeEvent::HeartbeatAck`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// The backend confirmed the subscription is live.
    Subscribed {
        /// Channel the acknowledgement belongs to.
        channel: ChannelId,
    },
    /// A row was inserted.
    Insert(MessageRow),
    /// A row was updated.
    Update(MessageRow),
    /// A row was deleted.
    Delete {
        /// Group the row belonged to.
        group_id: GroupId,
        /// Deleted row id.
        id: MessageId,
    },
    /// Reply to a heartbeat.
    HeartbeatAck,
    /// The channel reported an error.
    ChannelError(String),
    /// The channel was closed by the backend.
    Closed,
    /// The channel timed out on the backend side.
    TimedOut,
}

impl ChangeEvent {
    /// Whether this event ends the subscription.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ChannelError(_) | Self::Closed | Self::TimedOut)
    }
}

/// Out-of-band hint delivered by the push-wake collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushHint {
    /// Message that triggered the push.
    pub message_id: MessageId,
    /// Group the message belongs to.
    pub group_id: GroupId,
}

impl PushHint {
    /// Create a new hint.
    pub fn new(message_id: MessageId, group_id: GroupId) -> Self {
        Self {
            message_id,
            group_id,
        }
    }

    /// A hint is usable only when both ids are present.
    pub fn is_valid(&self) -> bool {
        !self.message_id.is_empty() && !self.group_id.is_empty()
    }
}

/// Short-lived access token issued by the backend.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    /// Opaque identifier for logging; never the secret itself.
    pub id: String,
    /// Bearer secret.
    pub secret: String,
    /// Expiry time.
    pub expires_at: Timestamp,
}

impl AuthToken {
    /// Whether the token has expired at `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthToken")
            .field("id", &self.id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Persisted last-read marker for one (group, user) pair.
///
/// `last_read_at` never decreases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadPointer {
    /// Group the pointer belongs to.
    pub group_id: GroupId,
    /// Reader.
    pub user_id: UserId,
    /// Timestamp of the last message considered read.
    pub last_read_at: Timestamp,
    /// Id of the last message considered read, if any.
    pub last_read_message_id: Option<MessageId>,
}

impl ReadPointer {
    /// Advance the pointer. Returns `false` and leaves the pointer unchanged
    /// unless `at` is strictly greater than the stored timestamp.
    pub fn advance(&mut self, message_id: Option<MessageId>, at: Timestamp) -> bool {
        if at <= self.last_read_at {
            return false;
        }
        self.last_read_at = at;
        self.last_read_message_id = message_id;
        true
    }
}

/// Derived unread state for one view of a group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnreadSummary {
    /// Number of unread messages from other participants.
    pub count: usize,
    /// Earliest unread message, used as the boundary marker.
    pub first_unread: Option<MessageId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pointer(at: i64) -> ReadPointer {
        ReadPointer {
            group_id: GroupId::new("g"),
            user_id: UserId::new("u"),
            last_read_at: Timestamp::from_millis(at),
            last_read_message_id: None,
        }
    }

    #[test]
    fn pointer_only_moves_forward() {
        let mut p = pointer(100);
        assert!(!p.advance(Some(MessageId::new("old")), Timestamp::from_millis(50)));
        assert!(!p.advance(Some(MessageId::new("same")), Timestamp::from_millis(100)));
        assert_eq!(p.last_read_at, Timestamp::from_millis(100));

        assert!(p.advance(Some(MessageId::new("new")), Timestamp::from_millis(150)));
        assert_eq!(p.last_read_message_id, Some(MessageId::new("new")));
    }

    #[test]
    fn push_hint_requires_both_ids() {
        assert!(PushHint::new(MessageId::new("m"), GroupId::new("g")).is_valid());
        assert!(!PushHint::new(MessageId::new(""), GroupId::new("g")).is_valid());
        assert!(!PushHint::new(MessageId::new("m"), GroupId::new("")).is_valid());
    }

    #[test]
    fn token_debug_hides_secret() {
        let token = AuthToken {
            id: "tok-1".into(),
            secret: "s3cret".into(),
            expires_at: Timestamp::from_millis(1),
        };
        let debug = format!("{:?}", token);
        assert!(debug.contains("tok-1"));
        assert!(!debug.contains("s3cret"));
    }

    #[test]
    fn terminal_events() {
        assert!(ChangeEvent::Closed.is_terminal());
        assert!(ChangeEvent::ChannelError("boom".into()).is_terminal());
        assert!(!ChangeEvent::HeartbeatAck.is_terminal());
    }
}

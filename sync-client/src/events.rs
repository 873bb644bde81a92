//! What the engine tells its UI collaborator.

use sync_core::ConnectionStatus;
use sync_types::{GroupId, MessageRow, UnreadSummary, UserId};
use tokio::sync::broadcast;

/// Capacity of the update channel. Slow subscribers see `Lagged` and
/// should re-read a snapshot.
pub const UPDATE_CAPACITY: usize = 256;

/// Change notification. Carries no data; read a [`Snapshot`] to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncUpdate {
    /// The visible sequence of a group changed.
    Messages {
        /// Affected group.
        group: GroupId,
    },
    /// The connection status changed.
    Connection(ConnectionStatus),
    /// A read pointer moved.
    ReadPointer {
        /// Affected group.
        group: GroupId,
        /// Reader.
        user: UserId,
    },
}

/// Read-only view of one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Visible messages, oldest first.
    pub messages: Vec<MessageRow>,
    /// Connection status.
    pub status: ConnectionStatus,
    /// Unread count and first-unread boundary.
    pub unread: UnreadSummary,
}

/// What the notification layer should do with a push wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeDisposition {
    /// The hint was malformed.
    Ignored,
    /// Host in background: show a system notification.
    Notify,
    /// Host in foreground on another conversation: notify and bump its
    /// unread badge.
    NotifyAndCountUnread,
    /// The hint is for the open conversation: just refresh it.
    RefreshActiveView,
}

/// Sender half shared by the engine's services.
pub type UpdateSender = broadcast::Sender<SyncUpdate>;

/// Create the update channel.
pub fn update_channel() -> UpdateSender {
    broadcast::channel(UPDATE_CAPACITY).0
}

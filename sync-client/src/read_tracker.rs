//! Per-user read positions and unread state.
//!
//! A conversation counts as read only after it has been open for the
//! configured dwell time. Opening starts a dwell timer that marks the
//! newest message read when it fires; closing before it fires leaves the
//! pointer where it was.

use crate::config::ReadConfig;
use crate::events::{SyncUpdate, UpdateSender};
use crate::reconcile::Reconciler;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use sync_core::compute_unread;
use sync_store::{ReadPointerStore, SqliteStore};
use sync_types::{
    GroupId, MessageId, MessageRow, ReadPointer, SyncError, Timestamp, UnreadSummary, UserId,
};
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct OpenView {
    opened_at: Instant,
    dwell: JoinHandle<()>,
}

/// Tracks read pointers and computes unread state.
pub struct ReadTracker {
    store: SqliteStore,
    reconciler: Arc<Reconciler>,
    config: ReadConfig,
    updates: UpdateSender,
    views: Mutex<HashMap<(GroupId, UserId), OpenView>>,
}

impl ReadTracker {
    /// Create a tracker.
    pub fn new(
        store: SqliteStore,
        reconciler: Arc<Reconciler>,
        config: ReadConfig,
        updates: UpdateSender,
    ) -> Self {
        Self {
            store,
            reconciler,
            config,
            updates,
            views: Mutex::new(HashMap::new()),
        }
    }

    /// Move a user's pointer forward. Older positions are ignored.
    ///
    /// Returns `true` if the pointer moved.
    pub async fn mark_read(
        &self,
        group_id: &GroupId,
        user_id: &UserId,
        message_id: Option<MessageId>,
        at: Timestamp,
    ) -> Result<bool, SyncError> {
        let pointer = ReadPointer {
            group_id: group_id.clone(),
            user_id: user_id.clone(),
            last_read_at: at,
            last_read_message_id: message_id,
        };
        let moved = self.store.advance_read_pointer(&pointer).await?;
        if moved {
            tracing::debug!("Read pointer for {} in {} at {}", user_id, group_id, at);
            let _ = self.updates.send(SyncUpdate::ReadPointer {
                group: group_id.clone(),
                user: user_id.clone(),
            });
        }
        Ok(moved)
    }

    /// Mark everything currently visible in a group as read.
    pub async fn mark_latest_read(
        &self,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> Result<bool, SyncError> {
        let newest = self
            .reconciler
            .visible(group_id)
            .into_iter()
            .filter(|m| !m.is_optimistic())
            .max_by_key(|m| m.created_at);
        match newest {
            Some(row) => {
                self.mark_read(group_id, user_id, Some(row.id), row.created_at)
                    .await
            }
            None => Ok(false),
        }
    }

    /// A user's own message was confirmed: nothing before it is unread.
    pub async fn on_own_message_confirmed(&self, row: &MessageRow) {
        if let Err(e) = self
            .mark_read(&row.group_id, &row.author_id, Some(row.id.clone()), row.created_at)
            .await
        {
            tracing::warn!("Failed to advance read pointer after send: {}", e);
        }
    }

    /// Current stored pointer.
    pub async fn pointer(
        &self,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> Result<Option<ReadPointer>, SyncError> {
        Ok(self.store.read_pointer(group_id, user_id).await?)
    }

    /// Unread count and first-unread boundary for a user.
    ///
    /// The first call for a group persists a baseline and reports zero.
    pub async fn unread(
        &self,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> Result<UnreadSummary, SyncError> {
        let pointer = self.store.read_pointer(group_id, user_id).await?;
        let visible = self.reconciler.visible(group_id);
        let view = compute_unread(
            group_id,
            user_id,
            pointer.as_ref(),
            &visible,
            self.config.first_view_baseline,
            Timestamp::now(),
        );
        if let Some(baseline) = view.baseline {
            tracing::debug!(
                "First view of {} by {}, baseline at {}",
                group_id,
                user_id,
                baseline.last_read_at
            );
            self.store.advance_read_pointer(&baseline).await?;
        }
        Ok(view.summary)
    }

    /// The user opened a conversation. Starts the dwell timer.
    pub fn open_conversation(self: &Arc<Self>, group_id: &GroupId, user_id: &UserId) {
        let this = Arc::clone(self);
        let (group, user) = (group_id.clone(), user_id.clone());
        let dwell = self.config.dwell();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(dwell).await;
            if let Err(e) = this.mark_latest_read(&group, &user).await {
                tracing::warn!("Failed to mark {} read: {}", group, e);
            }
        });

        let view = OpenView {
            opened_at: Instant::now(),
            dwell: handle,
        };
        if let Some(previous) = self
            .views()
            .insert((group_id.clone(), user_id.clone()), view)
        {
            previous.dwell.abort();
        }
    }

    /// The user left a conversation.
    ///
    /// Marks it read if the view lasted at least the dwell time. Returns
    /// `true` if the pointer moved.
    pub async fn close_conversation(
        &self,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> Result<bool, SyncError> {
        let Some(view) = self.views().remove(&(group_id.clone(), user_id.clone())) else {
            return Ok(false);
        };
        view.dwell.abort();
        if view.opened_at.elapsed() < self.config.dwell() {
            tracing::trace!("View of {} closed before dwell, not marking read", group_id);
            return Ok(false);
        }
        self.mark_latest_read(group_id, user_id).await
    }

    /// Whether a user has the conversation open.
    pub fn is_open(&self, group_id: &GroupId, user_id: &UserId) -> bool {
        self.views()
            .contains_key(&(group_id.clone(), user_id.clone()))
    }

    fn views(&self) -> MutexGuard<'_, HashMap<(GroupId, UserId), OpenView>> {
        self.views.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ReadTracker {
    fn drop(&mut self) {
        for (_, view) in self.views().drain() {
            view.dwell.abort();
        }
    }
}

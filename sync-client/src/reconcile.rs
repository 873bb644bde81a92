//! Reconciliation of local and remote message state.
//!
//! The [`Reconciler`] keeps one in-memory [`Timeline`] per loaded group and
//! mirrors every change into the durable store. Rows arrive from three
//! places: local sends (optimistic, then authoritative), the change feed,
//! and background fetches. Every path persists first and then updates the
//! timeline, so a restart reloads the same picture.
//!
//! Background fetches are tagged with a generation. Opening or closing a
//! view bumps it, and a fetch that resolves under an older generation is
//! dropped before it reaches the timeline.

use crate::events::{SyncUpdate, UpdateSender};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use sync_core::{FetchMerge, MergeOutcome, Timeline};
use sync_store::{MessageStore, SqliteStore, UpsertOutcome};
use sync_types::{ChangeEvent, DedupeKey, GroupId, MessageId, MessageRow, SyncError};

/// Merges optimistic, authoritative, and deleted rows per group.
pub struct Reconciler {
    store: SqliteStore,
    timelines: DashMap<GroupId, Timeline>,
    generation: AtomicU64,
    updates: UpdateSender,
    history_limit: u32,
}

impl Reconciler {
    /// Create a reconciler over `store`.
    pub fn new(store: SqliteStore, updates: UpdateSender, history_limit: u32) -> Self {
        Self {
            store,
            timelines: DashMap::new(),
            generation: AtomicU64::new(0),
            updates,
            history_limit,
        }
    }

    /// Load a group's timeline from the store unless it is already loaded.
    ///
    /// Returns the number of visible rows.
    pub async fn load_group(&self, group_id: &GroupId) -> Result<usize, SyncError> {
        if let Some(timeline) = self.timelines.get(group_id) {
            return Ok(timeline.len());
        }
        let rows = self
            .store
            .visible_messages(group_id, self.history_limit)
            .await?;
        let tombstones = self.store.tombstoned_ids(group_id).await?;
        let timeline = Timeline::from_rows(rows, tombstones);
        let len = timeline.len();

        // A concurrent loader may have won; keep whichever got there first.
        self.timelines.entry(group_id.clone()).or_insert(timeline);
        tracing::debug!("Loaded {} rows for group {}", len, group_id);
        Ok(len)
    }

    /// Whether a group's timeline is in memory.
    pub fn is_loaded(&self, group_id: &GroupId) -> bool {
        self.timelines.contains_key(group_id)
    }

    /// Visible rows of a group, oldest first. Empty if not loaded.
    pub fn visible(&self, group_id: &GroupId) -> Vec<MessageRow> {
        self.timelines
            .get(group_id)
            .map(|t| t.visible().to_vec())
            .unwrap_or_default()
    }

    /// Show and persist a locally submitted row.
    ///
    /// A store failure is logged, not returned: the outbox is the durable
    /// record of the send.
    pub async fn insert_optimistic(&self, row: MessageRow) -> MergeOutcome {
        if let Err(e) = self.store.upsert_message(&row).await {
            tracing::warn!("Failed to persist optimistic row {}: {}", row.id, e);
        }
        let group_id = row.group_id.clone();
        let outcome = self
            .timelines
            .entry(group_id.clone())
            .or_default()
            .insert_optimistic(row);
        self.notify(&group_id, &outcome);
        outcome
    }

    /// Persist and apply an authoritative row.
    pub async fn apply_authoritative(&self, row: MessageRow) -> MergeOutcome {
        match self.store.upsert_message(&row).await {
            Ok(UpsertOutcome::SkippedTombstoned) => {
                tracing::debug!("Suppressed tombstoned row {}", row.id);
                if let Some(mut timeline) = self.timelines.get_mut(&row.group_id) {
                    timeline.tombstone(&row.id);
                }
                return MergeOutcome::Suppressed;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to persist row {}: {}", row.id, e),
        }
        self.apply_in_memory(row)
    }

    /// Apply a row that is already persisted.
    pub fn apply_in_memory(&self, row: MessageRow) -> MergeOutcome {
        let group_id = row.group_id.clone();
        let outcome = match self.timelines.get_mut(&group_id) {
            Some(mut timeline) => timeline.apply(row),
            // Not on screen; the store has it for the next load.
            None => return MergeOutcome::Unchanged,
        };
        self.notify(&group_id, &outcome);
        outcome
    }

    /// Persist and apply a deletion.
    pub async fn apply_tombstone(&self, group_id: &GroupId, id: &MessageId) -> MergeOutcome {
        if let Err(e) = self.store.tombstone_message(group_id, id).await {
            tracing::warn!("Failed to persist tombstone {}: {}", id, e);
        }
        let outcome = match self.timelines.get_mut(group_id) {
            Some(mut timeline) => {
                if timeline.tombstone(id) {
                    MergeOutcome::Removed
                } else {
                    MergeOutcome::Suppressed
                }
            }
            None => MergeOutcome::Suppressed,
        };
        self.notify(group_id, &outcome);
        outcome
    }

    /// Remove the optimistic row of a send that will never be delivered.
    pub async fn discard_optimistic(&self, group_id: &GroupId, key: &DedupeKey) -> bool {
        if let Err(e) = self.store.delete_optimistic(key).await {
            tracing::warn!("Failed to delete optimistic row: {}", e);
        }
        let removed = self
            .timelines
            .get_mut(group_id)
            .and_then(|mut t| t.remove_optimistic(key))
            .is_some();
        if removed {
            self.emit(group_id);
        }
        removed
    }

    /// Route a change-feed event. Returns `true` if the visible sequence
    /// changed.
    pub async fn handle_change(&self, event: ChangeEvent) -> bool {
        match event {
            ChangeEvent::Insert(row) | ChangeEvent::Update(row) => {
                self.apply_authoritative(row).await.is_change()
            }
            ChangeEvent::Delete { group_id, id } => {
                self.apply_tombstone(&group_id, &id).await.is_change()
            }
            _ => false,
        }
    }

    // ===========================================
    // Background fetches
    // ===========================================

    /// Start a new fetch generation, invalidating outstanding fetches.
    pub fn begin_fetch(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Current fetch generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Merge a fetched page, unless its generation is stale.
    pub async fn complete_fetch(
        &self,
        group_id: &GroupId,
        generation: u64,
        rows: Vec<MessageRow>,
    ) -> Result<Option<FetchMerge>, SyncError> {
        if generation != self.generation() {
            tracing::debug!(
                "Dropping stale fetch for group {} (generation {} < {})",
                group_id,
                generation,
                self.generation()
            );
            return Ok(None);
        }

        let outcomes = self.store.upsert_messages(&rows).await?;
        let tombstoned: Vec<MessageId> = rows
            .iter()
            .zip(&outcomes)
            .filter(|(_, o)| **o == UpsertOutcome::SkippedTombstoned)
            .map(|(r, _)| r.id.clone())
            .collect();

        // The view may have changed while the page was being written.
        if generation != self.generation() {
            return Ok(None);
        }

        let report = {
            let mut timeline = self.timelines.entry(group_id.clone()).or_default();
            for id in &tombstoned {
                timeline.tombstone(id);
            }
            timeline.merge_fetch(rows)
        };
        tracing::debug!("Merged fetch for group {}: {:?}", group_id, report);
        self.emit(group_id);
        Ok(Some(report))
    }

    fn notify(&self, group_id: &GroupId, outcome: &MergeOutcome) {
        if outcome.is_change() {
            self.emit(group_id);
        }
    }

    fn emit(&self, group_id: &GroupId) {
        let _ = self.updates.send(SyncUpdate::Messages {
            group: group_id.clone(),
        });
    }
}

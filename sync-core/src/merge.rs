//! Reconciliation of optimistic, authoritative, and deleted rows.
//!
//! A [`Timeline`] is the visible message sequence of one group. It never
//! contains tombstoned rows, and at most one row per dedupe key.
//!
//! Incoming authoritative rows are matched in this order:
//! 1. by dedupe key, replacing the optimistic row in place;
//! 2. by id, confirming the existing row;
//! 3. otherwise inserted as a message from another participant.
//!
//! Tombstones are remembered for the lifetime of the timeline so a late
//! fetch cannot bring a deleted row back.

use std::collections::HashSet;
use sync_types::{DedupeKey, MessageId, MessageRow, RowTransition};

/// Result of applying one row to a [`Timeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// An authoritative row replaced the row with the same dedupe key.
    Replaced {
        /// Position of the row, unchanged by the replacement.
        index: usize,
    },
    /// A row with the same id was confirmed.
    Confirmed {
        /// Position of the row.
        index: usize,
    },
    /// A new row was inserted.
    Inserted {
        /// Position of the new row.
        index: usize,
    },
    /// The row was already represented; nothing changed.
    Unchanged,
    /// The row is tombstoned and was ignored.
    Suppressed,
    /// A tombstone removed a visible row.
    Removed,
}

impl MergeOutcome {
    /// Whether the visible sequence changed.
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::Unchanged | Self::Suppressed)
    }
}

/// Summary of merging a background fetch page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchMerge {
    /// Authoritative rows taken from the page.
    pub fetched: usize,
    /// Local rows superseded by a fetched row (same id or dedupe key).
    pub replaced: usize,
    /// Local rows the page did not cover, kept as they were.
    pub kept_local: usize,
    /// Fetched rows ignored because they are tombstoned.
    pub suppressed: usize,
}

/// Visible message sequence for one group.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    rows: Vec<MessageRow>,
    tombstones: HashSet<MessageId>,
}

impl Timeline {
    /// Create an empty timeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a timeline from persisted rows and known tombstones.
    pub fn from_rows(rows: Vec<MessageRow>, tombstones: HashSet<MessageId>) -> Self {
        let mut rows: Vec<MessageRow> = rows
            .into_iter()
            .filter(|r| r.state.is_visible() && !tombstones.contains(&r.id))
            .collect();
        sort_rows(&mut rows);
        Self { rows, tombstones }
    }

    /// The visible rows, oldest first.
    pub fn visible(&self) -> &[MessageRow] {
        &self.rows
    }

    /// Number of visible rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no rows are visible.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of optimistic rows awaiting confirmation.
    pub fn pending(&self) -> usize {
        self.rows.iter().filter(|r| r.is_optimistic()).count()
    }

    /// Newest visible row.
    pub fn last(&self) -> Option<&MessageRow> {
        self.rows.iter().max_by_key(|r| r.created_at)
    }

    /// Look up a visible row by id.
    pub fn get(&self, id: &MessageId) -> Option<&MessageRow> {
        self.rows.iter().find(|r| &r.id == id)
    }

    /// Whether `id` has been tombstoned.
    pub fn is_tombstoned(&self, id: &MessageId) -> bool {
        self.tombstones.contains(id)
    }

    /// Show a locally submitted row before the backend confirms it.
    pub fn insert_optimistic(&mut self, row: MessageRow) -> MergeOutcome {
        if self.tombstones.contains(&row.id) {
            return MergeOutcome::Suppressed;
        }
        let known = row
            .dedupe_key
            .as_ref()
            .and_then(|key| self.position_by_key(key))
            .or_else(|| self.position_by_id(&row.id));
        if known.is_some() {
            return MergeOutcome::Unchanged;
        }
        let index = self.insertion_index(&row);
        self.rows.insert(index, row);
        MergeOutcome::Inserted { index }
    }

    /// Apply a row from the realtime channel, a send acknowledgement, or a
    /// targeted fetch.
    pub fn apply(&mut self, incoming: MessageRow) -> MergeOutcome {
        if incoming.is_tombstoned() {
            return if self.tombstone(&incoming.id) {
                MergeOutcome::Removed
            } else {
                MergeOutcome::Suppressed
            };
        }
        if self.tombstones.contains(&incoming.id) {
            return MergeOutcome::Suppressed;
        }
        if incoming.is_optimistic() {
            return self.insert_optimistic(incoming);
        }

        let mut incoming = incoming;
        incoming.state = match incoming.state.apply(RowTransition::Confirm) {
            Ok(state) => state,
            Err(_) => return MergeOutcome::Suppressed,
        };

        if let Some(mut index) = incoming
            .dedupe_key
            .as_ref()
            .and_then(|key| self.position_by_key(key))
        {
            // A second copy under the authoritative id must not survive.
            if let Some(dup) = self.position_by_id(&incoming.id).filter(|&d| d != index) {
                self.rows.remove(dup);
                if dup < index {
                    index -= 1;
                }
            }
            self.rows[index] = incoming;
            return MergeOutcome::Replaced { index };
        }

        if let Some(index) = self.position_by_id(&incoming.id) {
            let existing = &mut self.rows[index];
            if incoming.dedupe_key.is_none() {
                incoming.dedupe_key = existing.dedupe_key.take();
            }
            *existing = incoming;
            return MergeOutcome::Confirmed { index };
        }

        let index = self.insertion_index(&incoming);
        self.rows.insert(index, incoming);
        MergeOutcome::Inserted { index }
    }

    /// Record a deletion. Returns `true` if a visible row was removed.
    pub fn tombstone(&mut self, id: &MessageId) -> bool {
        self.tombstones.insert(id.clone());
        match self.position_by_id(id) {
            Some(index) => {
                self.rows.remove(index);
                true
            }
            None => false,
        }
    }

    /// Remove an optimistic row whose send permanently failed.
    pub fn remove_optimistic(&mut self, key: &DedupeKey) -> Option<MessageRow> {
        let index = self
            .rows
            .iter()
            .position(|r| r.is_optimistic() && r.dedupe_key.as_ref() == Some(key))?;
        Some(self.rows.remove(index))
    }

    /// Merge a page of fetched rows with whatever arrived concurrently.
    ///
    /// Fetched rows replace local copies with the same id or dedupe key.
    /// Every other local row is kept: unacknowledged optimistic rows,
    /// realtime rows the page raced with, and history outside the page.
    /// A row only leaves the timeline through a tombstone, never by being
    /// absent from a page. The result is de-duplicated by id and sorted
    /// by timestamp.
    pub fn merge_fetch(&mut self, fetched: Vec<MessageRow>) -> FetchMerge {
        let mut report = FetchMerge::default();
        let mut authoritative = Vec::with_capacity(fetched.len());

        for mut row in fetched {
            if row.is_tombstoned() {
                self.tombstone(&row.id);
                report.suppressed += 1;
                continue;
            }
            if self.tombstones.contains(&row.id) {
                report.suppressed += 1;
                continue;
            }
            row.state = match row.state.apply(RowTransition::Confirm) {
                Ok(state) => state,
                Err(_) => continue,
            };
            authoritative.push(row);
        }

        if authoritative.is_empty() {
            return report;
        }
        report.fetched = authoritative.len();

        let ids: HashSet<MessageId> = authoritative.iter().map(|r| r.id.clone()).collect();
        let keys: HashSet<DedupeKey> = authoritative
            .iter()
            .filter_map(|r| r.dedupe_key.clone())
            .collect();

        let mut merged = Vec::with_capacity(self.rows.len() + authoritative.len());
        for row in std::mem::take(&mut self.rows) {
            let superseded = ids.contains(&row.id)
                || row.dedupe_key.as_ref().is_some_and(|k| keys.contains(k));
            if superseded {
                report.replaced += 1;
            } else {
                report.kept_local += 1;
                merged.push(row);
            }
        }
        merged.extend(authoritative);

        // Later entries win, and fetched rows were appended last.
        let mut seen = HashSet::new();
        let mut deduped: Vec<MessageRow> = merged
            .into_iter()
            .rev()
            .filter(|r| seen.insert(r.id.clone()))
            .collect();
        deduped.reverse();
        sort_rows(&mut deduped);

        self.rows = deduped;
        report
    }

    fn position_by_key(&self, key: &DedupeKey) -> Option<usize> {
        self.rows
            .iter()
            .position(|r| r.dedupe_key.as_ref() == Some(key))
    }

    fn position_by_id(&self, id: &MessageId) -> Option<usize> {
        self.rows.iter().position(|r| &r.id == id)
    }

    /// After every row that is not newer than `row`; usually the end.
    fn insertion_index(&self, row: &MessageRow) -> usize {
        self.rows
            .iter()
            .rposition(|r| r.created_at <= row.created_at)
            .map(|i| i + 1)
            .unwrap_or(0)
    }
}

fn sort_rows(rows: &mut [MessageRow]) {
    rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_types::{GroupId, OutgoingMessage, RowState, Timestamp, UserId};

    fn group() -> GroupId {
        GroupId::new("g1")
    }

    fn outgoing(content: &str) -> OutgoingMessage {
        OutgoingMessage::new(group(), UserId::new("me"), content)
    }

    fn optimistic(msg: &OutgoingMessage, at: i64) -> MessageRow {
        MessageRow::optimistic(msg, Timestamp::from_millis(at))
    }

    /// The backend's copy of a local send: new id, same dedupe key.
    fn authoritative(msg: &OutgoingMessage, server_id: &str, at: i64) -> MessageRow {
        MessageRow {
            id: MessageId::new(server_id),
            state: RowState::Confirmed,
            created_at: Timestamp::from_millis(at),
            ..MessageRow::optimistic(msg, Timestamp::from_millis(at))
        }
    }

    fn remote(id: &str, at: i64) -> MessageRow {
        MessageRow {
            id: MessageId::new(id),
            group_id: group(),
            author_id: UserId::new("bob"),
            content: format!("msg {}", id),
            attachment: None,
            created_at: Timestamp::from_millis(at),
            dedupe_key: None,
            state: RowState::Confirmed,
        }
    }

    fn ids(timeline: &Timeline) -> Vec<&str> {
        timeline.visible().iter().map(|r| r.id.as_str()).collect()
    }

    // ===========================================
    // Realtime / ack application
    // ===========================================

    #[test]
    fn authoritative_replaces_optimistic_by_dedupe_key() {
        let mut t = Timeline::new();
        let msg = outgoing("hello");
        t.insert_optimistic(optimistic(&msg, 100));

        let outcome = t.apply(authoritative(&msg, "srv-1", 105));

        assert_eq!(outcome, MergeOutcome::Replaced { index: 0 });
        assert_eq!(t.len(), 1);
        assert_eq!(t.visible()[0].id, MessageId::new("srv-1"));
        assert_eq!(t.visible()[0].state, RowState::Confirmed);
        assert_eq!(t.pending(), 0);
    }

    #[test]
    fn replacement_keeps_position() {
        let mut t = Timeline::new();
        t.apply(remote("a", 100));
        let msg = outgoing("mine");
        t.insert_optimistic(optimistic(&msg, 200));
        t.apply(remote("b", 300));

        // Server stamped it later than the row after it; position holds.
        let outcome = t.apply(authoritative(&msg, "srv-9", 400));

        assert_eq!(outcome, MergeOutcome::Replaced { index: 1 });
        assert_eq!(ids(&t), vec!["a", "srv-9", "b"]);
    }

    #[test]
    fn duplicate_echo_does_not_double_count() {
        let mut t = Timeline::new();
        let msg = outgoing("hello");
        t.insert_optimistic(optimistic(&msg, 100));

        t.apply(authoritative(&msg, "srv-1", 105));
        t.apply(authoritative(&msg, "srv-1", 105));

        assert_eq!(t.len(), 1);
    }

    #[test]
    fn id_match_confirms_existing_row() {
        let mut t = Timeline::new();
        let msg = outgoing("hello");
        t.insert_optimistic(optimistic(&msg, 100));

        // Backend kept the client id and the update carries no key.
        let mut update = optimistic(&msg, 100);
        update.state = RowState::Confirmed;
        update.dedupe_key = None;
        let outcome = t.apply(update);

        assert_eq!(outcome, MergeOutcome::Confirmed { index: 0 });
        assert_eq!(t.visible()[0].dedupe_key.as_ref(), Some(&msg.dedupe_key));
        assert_eq!(t.pending(), 0);
    }

    #[test]
    fn other_participant_rows_are_inserted_in_time_order() {
        let mut t = Timeline::new();
        t.apply(remote("a", 100));
        t.apply(remote("c", 300));
        let outcome = t.apply(remote("b", 200));

        assert_eq!(outcome, MergeOutcome::Inserted { index: 1 });
        assert_eq!(ids(&t), vec!["a", "b", "c"]);
    }

    #[test]
    fn resubmitting_same_optimistic_row_is_unchanged() {
        let mut t = Timeline::new();
        let msg = outgoing("hello");
        t.insert_optimistic(optimistic(&msg, 100));
        assert_eq!(
            t.insert_optimistic(optimistic(&msg, 100)),
            MergeOutcome::Unchanged
        );
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn optimistic_after_confirmation_is_unchanged() {
        let mut t = Timeline::new();
        let msg = outgoing("hello");
        t.apply(authoritative(&msg, "srv-1", 100));
        assert_eq!(t.apply(optimistic(&msg, 90)), MergeOutcome::Unchanged);
        assert_eq!(t.visible()[0].state, RowState::Confirmed);
    }

    // ===========================================
    // Tombstones
    // ===========================================

    #[test]
    fn tombstone_removes_and_suppresses() {
        let mut t = Timeline::new();
        t.apply(remote("a", 100));

        assert!(t.tombstone(&MessageId::new("a")));
        assert!(t.is_empty());
        assert_eq!(t.apply(remote("a", 100)), MergeOutcome::Suppressed);
        assert!(t.is_empty());
    }

    #[test]
    fn tombstone_row_via_apply() {
        let mut t = Timeline::new();
        t.apply(remote("a", 100));
        let outcome = t.apply(MessageRow::tombstone(group(), MessageId::new("a")));
        assert_eq!(outcome, MergeOutcome::Removed);
        assert!(t.is_tombstoned(&MessageId::new("a")));
    }

    #[test]
    fn late_fetch_cannot_resurrect_tombstone() {
        let mut t = Timeline::new();
        t.apply(remote("a", 100));
        t.tombstone(&MessageId::new("a"));

        let report = t.merge_fetch(vec![remote("a", 100), remote("b", 200)]);

        assert_eq!(report.suppressed, 1);
        assert_eq!(ids(&t), vec!["b"]);
    }

    #[test]
    fn from_rows_filters_tombstones() {
        let mut tombstones = HashSet::new();
        tombstones.insert(MessageId::new("b"));
        let t = Timeline::from_rows(
            vec![remote("c", 300), remote("b", 200), remote("a", 100)],
            tombstones,
        );
        assert_eq!(ids(&t), vec!["a", "c"]);
    }

    #[test]
    fn remove_optimistic_only_touches_unconfirmed() {
        let mut t = Timeline::new();
        let failed = outgoing("rejected");
        let delivered = outgoing("delivered");
        t.insert_optimistic(optimistic(&failed, 100));
        t.apply(authoritative(&delivered, "srv-1", 110));

        assert!(t.remove_optimistic(&failed.dedupe_key).is_some());
        assert!(t.remove_optimistic(&delivered.dedupe_key).is_none());
        assert_eq!(ids(&t), vec!["srv-1"]);
    }

    // ===========================================
    // Fetch merge
    // ===========================================

    #[test]
    fn fetch_preserves_optimistic_and_newer_realtime_rows() {
        let mut t = Timeline::new();
        let pending = outgoing("still sending");
        t.apply(remote("old", 50));
        t.insert_optimistic(optimistic(&pending, 250));
        t.apply(remote("live", 400));

        let report = t.merge_fetch(vec![remote("f1", 100), remote("f2", 300)]);

        assert_eq!(ids(&t), vec!["old", "f1", pending.id.as_str(), "f2", "live"]);
        assert_eq!(report.kept_local, 3);
        assert_eq!(report.fetched, 2);
    }

    #[test]
    fn fetch_replaces_stale_local_copies() {
        let mut t = Timeline::new();
        let mut stale = remote("a", 100);
        stale.content = "before edit".into();
        t.apply(stale);

        let mut fresh = remote("a", 100);
        fresh.content = "after edit".into();
        let report = t.merge_fetch(vec![fresh]);

        assert_eq!(report.replaced, 1);
        assert_eq!(t.len(), 1);
        assert_eq!(t.visible()[0].content, "after edit");
    }

    #[test]
    fn fetch_supersedes_optimistic_by_dedupe_key() {
        let mut t = Timeline::new();
        let msg = outgoing("hello");
        t.insert_optimistic(optimistic(&msg, 100));

        t.merge_fetch(vec![authoritative(&msg, "srv-1", 101)]);

        assert_eq!(ids(&t), vec!["srv-1"]);
        assert_eq!(t.pending(), 0);
    }

    #[test]
    fn fetch_keeps_realtime_row_inside_page_span() {
        let mut t = Timeline::new();
        t.apply(remote("live", 150));
        let report = t.merge_fetch(vec![remote("a", 100), remote("b", 200)]);
        assert_eq!(report.kept_local, 1);
        assert_eq!(ids(&t), vec!["a", "live", "b"]);
    }

    #[test]
    fn page_cut_through_equal_timestamps_keeps_siblings() {
        let mut t = Timeline::new();
        t.apply(remote("x1", 100));
        t.apply(remote("x2", 100));

        // The page limit cut between the two rows sharing the oldest timestamp.
        t.merge_fetch(vec![remote("x2", 100), remote("y", 200)]);

        assert_eq!(ids(&t), vec!["x1", "x2", "y"]);
    }

    #[test]
    fn fetched_tombstone_is_the_only_way_out() {
        let mut t = Timeline::new();
        t.apply(remote("a", 100));
        t.apply(remote("b", 200));
        let mut deleted = remote("a", 100);
        deleted.state = RowState::Tombstoned;

        let report = t.merge_fetch(vec![deleted, remote("b", 200)]);

        assert_eq!(report.suppressed, 1);
        assert_eq!(ids(&t), vec!["b"]);
    }

    #[test]
    fn fetch_dedupes_by_id_and_sorts() {
        let mut t = Timeline::new();
        let report = t.merge_fetch(vec![remote("b", 200), remote("a", 100), remote("b", 200)]);
        assert_eq!(ids(&t), vec!["a", "b"]);
        assert_eq!(report.fetched, 3);
    }

    #[test]
    fn empty_fetch_is_noop() {
        let mut t = Timeline::new();
        t.apply(remote("a", 100));
        assert_eq!(t.merge_fetch(vec![]), FetchMerge::default());
        assert_eq!(t.len(), 1);
    }
}

//! Unread computation for the read-position tracker.
//!
//! The first time a user views a group there is no read pointer. That view
//! reports no boundary and zero unread, and yields a baseline pointer for
//! the caller to persist, so history is never retroactively flagged.

use serde::Deserialize;
use sync_types::{GroupId, MessageRow, ReadPointer, Timestamp, UnreadSummary, UserId};

/// Where the baseline goes on a user's first view of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirstViewBaseline {
    /// At the newest visible message (the epoch for an empty group).
    #[default]
    LastMessage,
    /// At the wall-clock time of the view.
    Now,
}

/// Result of computing unread state for one view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadView {
    /// Count and first-unread boundary.
    pub summary: UnreadSummary,
    /// Pointer to persist when this was the first view.
    pub baseline: Option<ReadPointer>,
}

/// Compute unread state for `viewer` over `visible` (oldest first).
///
/// Unread messages are those newer than the pointer and not authored by
/// the viewer; the earliest of them is the boundary.
pub fn compute_unread(
    group_id: &GroupId,
    viewer: &UserId,
    pointer: Option<&ReadPointer>,
    visible: &[MessageRow],
    first_view: FirstViewBaseline,
    now: Timestamp,
) -> UnreadView {
    let Some(pointer) = pointer else {
        return UnreadView {
            summary: UnreadSummary::default(),
            baseline: Some(baseline(group_id, viewer, visible, first_view, now)),
        };
    };

    let mut unread = visible
        .iter()
        .filter(|m| m.created_at > pointer.last_read_at && &m.author_id != viewer);
    let first = unread.next();
    let count = first.map(|_| 1 + unread.count()).unwrap_or(0);

    UnreadView {
        summary: UnreadSummary {
            count,
            first_unread: first.map(|m| m.id.clone()),
        },
        baseline: None,
    }
}

fn baseline(
    group_id: &GroupId,
    viewer: &UserId,
    visible: &[MessageRow],
    first_view: FirstViewBaseline,
    now: Timestamp,
) -> ReadPointer {
    let (last_read_at, last_read_message_id) = match first_view {
        FirstViewBaseline::Now => (now, None),
        FirstViewBaseline::LastMessage => match visible.iter().max_by_key(|m| m.created_at) {
            Some(last) => (last.created_at, Some(last.id.clone())),
            None => (Timestamp::zero(), None),
        },
    };
    ReadPointer {
        group_id: group_id.clone(),
        user_id: viewer.clone(),
        last_read_at,
        last_read_message_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_types::{MessageId, RowState};

    fn group() -> GroupId {
        GroupId::new("g1")
    }

    fn me() -> UserId {
        UserId::new("me")
    }

    fn msg(id: &str, author: &str, at: i64) -> MessageRow {
        MessageRow {
            id: MessageId::new(id),
            group_id: group(),
            author_id: UserId::new(author),
            content: String::new(),
            attachment: None,
            created_at: Timestamp::from_millis(at),
            dedupe_key: None,
            state: RowState::Confirmed,
        }
    }

    fn pointer_at(at: i64) -> ReadPointer {
        ReadPointer {
            group_id: group(),
            user_id: me(),
            last_read_at: Timestamp::from_millis(at),
            last_read_message_id: None,
        }
    }

    #[test]
    fn first_view_reports_nothing_unread() {
        let visible = vec![msg("a", "bob", 100), msg("b", "bob", 200)];
        let view = compute_unread(
            &group(),
            &me(),
            None,
            &visible,
            FirstViewBaseline::LastMessage,
            Timestamp::from_millis(999),
        );

        assert_eq!(view.summary, UnreadSummary::default());
        let baseline = view.baseline.unwrap();
        assert_eq!(baseline.last_read_at, Timestamp::from_millis(200));
        assert_eq!(baseline.last_read_message_id, Some(MessageId::new("b")));
    }

    #[test]
    fn first_view_baseline_now() {
        let view = compute_unread(
            &group(),
            &me(),
            None,
            &[msg("a", "bob", 100)],
            FirstViewBaseline::Now,
            Timestamp::from_millis(999),
        );
        let baseline = view.baseline.unwrap();
        assert_eq!(baseline.last_read_at, Timestamp::from_millis(999));
        assert_eq!(baseline.last_read_message_id, None);
    }

    #[test]
    fn first_view_of_empty_group_baselines_at_epoch() {
        let view = compute_unread(
            &group(),
            &me(),
            None,
            &[],
            FirstViewBaseline::LastMessage,
            Timestamp::from_millis(999),
        );
        assert_eq!(view.baseline.unwrap().last_read_at, Timestamp::zero());
    }

    #[test]
    fn counts_messages_after_pointer() {
        let visible = vec![
            msg("a", "bob", 100),
            msg("b", "bob", 200),
            msg("c", "carol", 300),
        ];
        let pointer = pointer_at(100);
        let view = compute_unread(
            &group(),
            &me(),
            Some(&pointer),
            &visible,
            FirstViewBaseline::LastMessage,
            Timestamp::zero(),
        );

        assert_eq!(view.summary.count, 2);
        assert_eq!(view.summary.first_unread, Some(MessageId::new("b")));
        assert!(view.baseline.is_none());
    }

    #[test]
    fn own_messages_are_never_unread() {
        let visible = vec![
            msg("a", "me", 200),
            msg("b", "bob", 300),
            msg("c", "me", 400),
        ];
        let pointer = pointer_at(100);
        let view = compute_unread(
            &group(),
            &me(),
            Some(&pointer),
            &visible,
            FirstViewBaseline::LastMessage,
            Timestamp::zero(),
        );

        assert_eq!(view.summary.count, 1);
        assert_eq!(view.summary.first_unread, Some(MessageId::new("b")));
    }

    #[test]
    fn message_at_pointer_is_read() {
        let pointer = pointer_at(200);
        let view = compute_unread(
            &group(),
            &me(),
            Some(&pointer),
            &[msg("a", "bob", 200)],
            FirstViewBaseline::LastMessage,
            Timestamp::zero(),
        );
        assert_eq!(view.summary.count, 0);
        assert_eq!(view.summary.first_unread, None);
    }
}

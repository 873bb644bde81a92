//! # sync-types
//!
//! Data model for the chatsync offline-first message engine.
//!
//! This crate provides the foundational types used across all chatsync crates:
//! - [`GroupId`], [`UserId`], [`MessageId`], [`DedupeKey`], [`Timestamp`] - Identity and ordering types
//! - [`OutgoingMessage`], [`MessageRow`], [`OutboxEntry`] - Messages in flight and at rest
//! - [`ReadPointer`], [`UnreadSummary`] - Read state
//! - [`ChangeEvent`], [`PushHint`], [`AuthToken`] - Backend-facing types
//! - [`SyncError`] - Error taxonomy

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod feed;
mod ids;
mod message;

pub use error::SyncError;
pub use feed::{AuthToken, ChangeEvent, PushHint, ReadPointer, UnreadSummary};
pub use ids::{ChannelId, DedupeKey, GroupId, MessageId, Timestamp, UserId};
pub use message::{
    MessageRow, OutboxEntry, OutgoingMessage, RowState, RowTransition, SendOutcome,
    TransitionError,
};

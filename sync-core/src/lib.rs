//! # sync-core
//!
//! Pure logic for chatsync (no I/O, instant tests).
//!
//! This crate implements the state machines and algorithms of the sync
//! engine without any network or disk I/O, enabling fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. Time is an argument, never read from a clock.
//! This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output, jitter aside)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (network, disk) is performed by `sync-client` and
//! `sync-store`, which interpret the decisions made here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod heartbeat;
pub mod merge;
pub mod outbox;
pub mod read;
pub mod state;

pub use backoff::Backoff;
pub use heartbeat::{HeartbeatConfig, Liveness, LivenessTracker};
pub use merge::{FetchMerge, MergeOutcome, Timeline};
pub use outbox::{DrainGate, RetryDecision, RetryPolicy};
pub use read::{compute_unread, FirstViewBaseline, UnreadView};
pub use state::{Action, ConnectionState, ConnectionStatus, Event, ReconnectPolicy};

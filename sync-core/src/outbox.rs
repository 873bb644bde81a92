//! Outbox scheduling logic for chatsync.
//!
//! This module decides *when* a queued send is retried and *whether* a
//! drain run should start. It provides:
//! - [`RetryPolicy`] - exponential backoff with a cap and a retry ceiling
//! - [`DrainGate`] - single-flight coalescing of drain requests
//!
//! The queue itself lives in the durable store; sync-client's
//! `OutboxProcessor` applies these decisions to it.

use crate::backoff::Backoff;
use std::time::Duration;
use sync_types::{OutboxEntry, Timestamp};

/// Retry scheduling for failed sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed before an entry is dropped as permanently failed.
    pub max_retries: u32,
    /// Delay schedule between retries.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(300)),
        }
    }
}

/// What to do with an entry after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Keep the entry and try again later.
    Retry {
        /// New retry count.
        retry_count: u32,
        /// Earliest time of the next attempt.
        next_retry_at: Timestamp,
    },
    /// Drop the entry; the failure is permanent.
    GiveUp {
        /// Attempts made in total.
        attempts: u32,
    },
}

impl RetryPolicy {
    /// Decide the fate of `entry` after an attempt failed at `now`.
    pub fn on_failure(&self, entry: &OutboxEntry, now: Timestamp) -> RetryDecision {
        let retry_count = entry.retry_count.saturating_add(1);
        if retry_count > self.max_retries {
            return RetryDecision::GiveUp {
                attempts: retry_count,
            };
        }
        let delay = self.backoff.delay(retry_count);
        RetryDecision::Retry {
            retry_count,
            next_retry_at: now.plus_millis(delay.as_millis() as u64),
        }
    }

    /// Whether `entry` may be attempted at `now`.
    pub fn is_due(entry: &OutboxEntry, now: Timestamp) -> bool {
        entry.next_retry_at <= now
    }
}

/// Single-flight gate for drain runs.
///
/// Requests that arrive while a run is active collapse into one follow-up
/// run, so no request is lost and at most one run is ever active.
///
/// ```text
/// request() → true   (caller starts a run)
/// request() → false  (folded into a follow-up)
/// request() → false  (folded into the same follow-up)
/// finish()  → true   (caller runs once more)
/// finish()  → false  (idle)
/// ```
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainGate {
    running: bool,
    pending: bool,
}

impl DrainGate {
    /// Create an idle gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a drain. Returns `true` if the caller should start a run.
    pub fn request(&mut self) -> bool {
        if self.running {
            self.pending = true;
            false
        } else {
            self.running = true;
            true
        }
    }

    /// Mark the current run finished. Returns `true` if a request arrived
    /// during the run and the caller should run again.
    pub fn finish(&mut self) -> bool {
        if self.pending {
            self.pending = false;
            true
        } else {
            self.running = false;
            false
        }
    }

    /// Whether a run is active.
    pub fn is_running(&self) -> bool {
        self.running
    }
}

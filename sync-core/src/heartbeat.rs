//! Liveness tracking for the realtime channel.
//!
//! Any inbound event, heartbeat acknowledgements included, refreshes the
//! last-event time. The channel is only declared dead after `dead_after`
//! of complete silence, so a quiet group with acks flowing stays alive
//! indefinitely. Outbound heartbeats never count as proof of life.
//!
//! Time is passed in by the caller, keeping the tracker deterministic.

use std::time::{Duration, Instant};

/// Heartbeat and watchdog timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// How often a heartbeat is sent while connected.
    pub interval: Duration,
    /// How often the watchdog checks liveness.
    pub watchdog_interval: Duration,
    /// Silence after which the channel is considered dead.
    pub dead_after: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            watchdog_interval: Duration::from_secs(10),
            dead_after: Duration::from_secs(70),
        }
    }
}

impl HeartbeatConfig {
    /// Check the timing relations the watchdog depends on.
    pub fn validate(&self) -> Result<(), String> {
        if self.interval.is_zero() || self.watchdog_interval.is_zero() {
            return Err("heartbeat and watchdog intervals must be non-zero".into());
        }
        if self.watchdog_interval >= self.interval {
            return Err(format!(
                "watchdog interval {:?} must be shorter than heartbeat interval {:?}",
                self.watchdog_interval, self.interval
            ));
        }
        if self.dead_after <= self.interval * 2 {
            return Err(format!(
                "dead_after {:?} must exceed twice the heartbeat interval {:?}",
                self.dead_after, self.interval
            ));
        }
        Ok(())
    }
}

/// Watchdog verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// An event arrived recently enough.
    Alive,
    /// No inbound event for at least `dead_after`.
    Dead {
        /// Time since the last inbound event.
        silent_for: Duration,
    },
}

/// Tracks the last inbound event on one channel.
#[derive(Debug, Clone)]
pub struct LivenessTracker {
    dead_after: Duration,
    last_inbound: Instant,
    outstanding_heartbeats: u32,
}

impl LivenessTracker {
    /// Start tracking at `now` (the subscription acknowledgement counts as
    /// the first event).
    pub fn new(dead_after: Duration, now: Instant) -> Self {
        Self {
            dead_after,
            last_inbound: now,
            outstanding_heartbeats: 0,
        }
    }

    /// Record any inbound event.
    pub fn record_event(&mut self, now: Instant) {
        if now > self.last_inbound {
            self.last_inbound = now;
        }
        self.outstanding_heartbeats = 0;
    }

    /// Record an outbound heartbeat. Does not refresh liveness.
    pub fn record_heartbeat_sent(&mut self) {
        self.outstanding_heartbeats = self.outstanding_heartbeats.saturating_add(1);
    }

    /// Heartbeats sent since the last inbound event.
    pub fn outstanding_heartbeats(&self) -> u32 {
        self.outstanding_heartbeats
    }

    /// Time of the last inbound event.
    pub fn last_event_at(&self) -> Instant {
        self.last_inbound
    }

    /// Evaluate liveness at `now`.
    pub fn check(&self, now: Instant) -> Liveness {
        let silent_for = now.saturating_duration_since(self.last_inbound);
        if silent_for >= self.dead_after {
            Liveness::Dead { silent_for }
        } else {
            Liveness::Alive
        }
    }
}

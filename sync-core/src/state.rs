//! Connection state machine for chatsync.
//!
//! This module provides a pure, side-effect-free state machine for the
//! realtime subscription lifecycle. The state machine takes events as input
//! and produces a new state plus a list of actions to execute.
//!
//! The actual I/O (token refresh, subscribe, heartbeats) is performed by
//! sync-client's `ConnectionManager`, not by this module.
//!
//! ```text
//! Disconnected → Connecting → Connected → Reconnecting → Connected | Disconnected
//! ```

use crate::backoff::Backoff;
use std::time::Duration;
use sync_types::ChannelId;

/// Connection state machine - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No subscription and none being attempted.
    #[default]
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Subscription acknowledged and live.
    Connected {
        /// Channel carrying the subscription.
        channel: ChannelId,
    },
    /// Lost or failed; retrying with backoff.
    Reconnecting {
        /// Number of failed attempts so far in this outage.
        attempt: u32,
    },
}

/// Coarse connection status exposed to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// Offline, backgrounded, or gave up.
    Disconnected,
    /// Establishing the first subscription.
    Connecting,
    /// Live.
    Connected,
    /// Recovering from a failure.
    Reconnecting,
}

/// Reconnection tuning consumed by [`ConnectionState::on_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay schedule between failed attempts.
    pub backoff: Backoff,
    /// Failed attempts after which the machine gives up and disconnects.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(30))
                .with_jitter(Duration::from_secs(2)),
            max_attempts: 10,
        }
    }
}

impl ConnectionState {
    /// Create a new state machine in the Disconnected state.
    pub fn new() -> Self {
        Self::Disconnected
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function apart from backoff jitter. The caller is
    /// responsible for executing the returned actions in order.
    pub fn on_event(self, event: Event, policy: &ReconnectPolicy) -> (Self, Vec<Action>) {
        match (self, event) {
            // Going offline wins from any state.
            (
                Self::Disconnected,
                Event::NetworkLost | Event::Backgrounded | Event::DisconnectRequested,
            ) => (Self::Disconnected, vec![]),
            (_, Event::NetworkLost | Event::Backgrounded | Event::DisconnectRequested) => (
                Self::Disconnected,
                vec![
                    Action::CancelReconnectTimer,
                    Action::Teardown,
                    Action::EmitStatus(ConnectionStatus::Disconnected),
                ],
            ),

            // From Disconnected
            (
                Self::Disconnected,
                Event::ConnectRequested
                | Event::ForceReconnect
                | Event::Foregrounded
                | Event::NetworkRestored,
            ) => (
                Self::Connecting,
                vec![
                    Action::EmitStatus(ConnectionStatus::Connecting),
                    Action::RunReconnect,
                ],
            ),
            // A sequence finished after we went offline; drop its channel.
            (Self::Disconnected, Event::Subscribed { .. }) => {
                (Self::Disconnected, vec![Action::Teardown])
            }

            // From Connecting / Reconnecting: the attempt succeeded
            (Self::Connecting | Self::Reconnecting { .. }, Event::Subscribed { channel }) => (
                Self::Connected { channel },
                vec![
                    Action::EmitStatus(ConnectionStatus::Connected),
                    Action::StartHeartbeat,
                    Action::ResumeOutbox,
                ],
            ),

            // From Connecting: first attempt failed
            (Self::Connecting, Event::ConnectFailed { .. }) => (
                Self::Reconnecting { attempt: 1 },
                vec![
                    Action::EmitStatus(ConnectionStatus::Reconnecting),
                    Action::StartReconnectTimer {
                        delay: policy.backoff.delay(1),
                    },
                ],
            ),
            (Self::Connecting, Event::ChannelFailed { .. }) => (
                Self::Reconnecting { attempt: 1 },
                vec![
                    Action::EmitStatus(ConnectionStatus::Reconnecting),
                    Action::RefreshToken,
                    Action::StartReconnectTimer {
                        delay: policy.backoff.delay(1),
                    },
                ],
            ),

            // From Connected
            (Self::Connected { .. }, Event::HeartbeatTimeout { .. } | Event::ForceReconnect) => (
                Self::Reconnecting { attempt: 0 },
                vec![
                    Action::Teardown,
                    Action::EmitStatus(ConnectionStatus::Reconnecting),
                    Action::RunReconnect,
                ],
            ),
            (Self::Connected { .. }, Event::ChannelFailed { .. }) => (
                Self::Reconnecting { attempt: 1 },
                vec![
                    Action::Teardown,
                    Action::EmitStatus(ConnectionStatus::Reconnecting),
                    Action::RefreshToken,
                    Action::StartReconnectTimer {
                        delay: policy.backoff.delay(1),
                    },
                ],
            ),
            (Self::Connected { channel }, Event::Foregrounded) => {
                (Self::Connected { channel }, vec![Action::ResumeOutbox])
            }

            // From Reconnecting
            (
                Self::Reconnecting { attempt },
                Event::ReconnectTimer
                | Event::ForceReconnect
                | Event::Foregrounded
                | Event::NetworkRestored,
            ) => (
                Self::Reconnecting { attempt },
                vec![Action::CancelReconnectTimer, Action::RunReconnect],
            ),
            (
                Self::Reconnecting { attempt },
                Event::ConnectFailed { .. } | Event::ChannelFailed { .. },
            ) => {
                let next_attempt = attempt.saturating_add(1);
                if next_attempt > policy.max_attempts {
                    (
                        Self::Disconnected,
                        vec![
                            Action::Teardown,
                            Action::EmitStatus(ConnectionStatus::Disconnected),
                        ],
                    )
                } else {
                    (
                        Self::Reconnecting {
                            attempt: next_attempt,
                        },
                        vec![
                            Action::RefreshToken,
                            Action::StartReconnectTimer {
                                delay: policy.backoff.delay(next_attempt),
                            },
                        ],
                    )
                }
            }

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if currently connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    /// Check if currently trying to connect.
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting { .. })
    }

    /// The live channel, if connected.
    pub fn channel(&self) -> Option<&ChannelId> {
        match self {
            Self::Connected { channel } => Some(channel),
            _ => None,
        }
    }

    /// Coarse status for the UI.
    pub fn status(&self) -> ConnectionStatus {
        match self {
            Self::Disconnected => ConnectionStatus::Disconnected,
            Self::Connecting => ConnectionStatus::Connecting,
            Self::Connected { .. } => ConnectionStatus::Connected,
            Self::Reconnecting { .. } => ConnectionStatus::Reconnecting,
        }
    }
}

/// Events that can occur in the connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Engine start.
    ConnectRequested,
    /// Explicit reconnect request from the UI.
    ForceReconnect,
    /// Host process came to the foreground.
    Foregrounded,
    /// Host process went to the background.
    Backgrounded,
    /// Network became reachable.
    NetworkRestored,
    /// Network became unreachable.
    NetworkLost,
    /// The reconnection sequence received its subscribe acknowledgement.
    Subscribed {
        /// Channel of the new subscription.
        channel: ChannelId,
    },
    /// The reconnection sequence failed.
    ConnectFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// A live channel reported error, close, or timeout.
    ChannelFailed {
        /// Reason reported by the channel.
        reason: String,
    },
    /// The watchdog saw no inbound event for too long.
    HeartbeatTimeout {
        /// How long the channel was silent.
        silent_for: Duration,
    },
    /// Reconnect backoff elapsed.
    ReconnectTimer,
    /// Engine shutdown.
    DisconnectRequested,
}

/// Actions to be executed by the connection manager.
///
/// These are instructions, not side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Run the reconnection sequence (single-flight).
    RunReconnect,
    /// Tear down the current subscription, heartbeat, and watchdog.
    Teardown,
    /// Start heartbeat emission and the watchdog.
    StartHeartbeat,
    /// Best-effort token refresh, falling back to the cached token.
    RefreshToken,
    /// Schedule [`Event::ReconnectTimer`] after a delay.
    StartReconnectTimer {
        /// Delay before the next attempt.
        delay: Duration,
    },
    /// Cancel any pending reconnect timer.
    CancelReconnectTimer,
    /// The channel is healthy: let the outbox drain.
    ResumeOutbox,
    /// Publish a status change.
    EmitStatus(ConnectionStatus),
}

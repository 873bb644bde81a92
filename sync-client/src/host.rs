//! Host process signals: foreground state and network reachability.
//!
//! The embedding application reports these; the engine only ever reads
//! the cached values, never polls the platform.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// Whether the host application is visible to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// In front of the user.
    Foreground,
    /// Suspended or hidden.
    Background,
}

/// Last reported foreground state.
#[derive(Debug)]
pub struct HostLifecycle {
    foreground: AtomicBool,
}

impl HostLifecycle {
    /// Start in `initial`.
    pub fn new(initial: HostState) -> Self {
        Self {
            foreground: AtomicBool::new(initial == HostState::Foreground),
        }
    }

    /// Record a new state. Returns `true` if it changed.
    pub fn set(&self, state: HostState) -> bool {
        let foreground = state == HostState::Foreground;
        self.foreground.swap(foreground, Ordering::SeqCst) != foreground
    }

    /// Current state.
    pub fn state(&self) -> HostState {
        if self.foreground.load(Ordering::SeqCst) {
            HostState::Foreground
        } else {
            HostState::Background
        }
    }

    /// Whether the host is in the foreground.
    pub fn is_foreground(&self) -> bool {
        self.state() == HostState::Foreground
    }
}

/// Cached network reachability.
#[derive(Debug)]
pub struct NetworkMonitor {
    reachable: watch::Sender<bool>,
}

impl NetworkMonitor {
    /// Start with the given reachability.
    pub fn new(reachable: bool) -> Self {
        let (tx, _rx) = watch::channel(reachable);
        Self { reachable: tx }
    }

    /// Record a reachability report. Returns `true` if it changed.
    pub fn set_reachable(&self, reachable: bool) -> bool {
        self.reachable.send_if_modified(|current| {
            if *current == reachable {
                false
            } else {
                *current = reachable;
                true
            }
        })
    }

    /// Last reported reachability.
    pub fn is_reachable(&self) -> bool {
        *self.reachable.borrow()
    }

    /// Watch reachability changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.reachable.subscribe()
    }
}

/// Check that the runtime still schedules tasks within `limit`.
pub async fn runtime_responsive(limit: Duration) -> bool {
    tokio::time::timeout(limit, tokio::task::yield_now())
        .await
        .is_ok()
}

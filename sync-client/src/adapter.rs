//! Feed adapters.
//!
//! The engine consumes one stream of [`ChangeEvent`]s regardless of how the
//! backend delivers changes. The adapter is chosen once, at startup, from
//! the backend's advertised [`Capabilities`].

use crate::backend::{Backend, BackendError, Capabilities, Subscription};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sync_types::{ChangeEvent, ChannelId, GroupId, Timestamp};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

static NEXT_POLL_CHANNEL: AtomicU64 = AtomicU64::new(1);

/// How change events reach the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedAdapter {
    /// The backend pushes changes over a realtime channel.
    Realtime,
    /// Changes are synthesized by fetching the newest page periodically.
    Polling {
        /// Time between polls.
        interval: Duration,
        /// Rows fetched per group per poll.
        page_size: u32,
    },
}

impl FeedAdapter {
    /// Pick the adapter for a backend.
    pub fn probe(capabilities: Capabilities, poll_interval: Duration, page_size: u32) -> Self {
        if capabilities.realtime {
            Self::Realtime
        } else {
            Self::Polling {
                interval: poll_interval,
                page_size,
            }
        }
    }

    /// Whether heartbeats and the liveness watchdog apply.
    pub fn uses_heartbeat(&self) -> bool {
        matches!(self, Self::Realtime)
    }

    /// Open a subscription for `groups`.
    pub async fn open<B: Backend>(
        &self,
        backend: &Arc<B>,
        groups: &[GroupId],
    ) -> Result<Subscription, BackendError> {
        match *self {
            Self::Realtime => backend.subscribe(groups).await,
            Self::Polling {
                interval,
                page_size,
            } => Ok(spawn_poller(
                Arc::clone(backend),
                groups.to_vec(),
                interval,
                page_size,
            )),
        }
    }

    /// Close a subscription opened by [`open`](Self::open).
    ///
    /// Polling channels stop on their own once the receiver is dropped.
    pub async fn close<B: Backend>(
        &self,
        backend: &Arc<B>,
        channel: &ChannelId,
    ) -> Result<(), BackendError> {
        match self {
            Self::Realtime => backend.unsubscribe(channel).await,
            Self::Polling { .. } => Ok(()),
        }
    }
}

fn spawn_poller<B: Backend>(
    backend: Arc<B>,
    groups: Vec<GroupId>,
    period: Duration,
    page_size: u32,
) -> Subscription {
    let channel = ChannelId::new(format!(
        "poll-{}",
        NEXT_POLL_CHANNEL.fetch_add(1, Ordering::Relaxed)
    ));
    let (tx, rx) = mpsc::channel(256);
    let ack = ChangeEvent::Subscribed {
        channel: channel.clone(),
    };

    tokio::spawn(async move {
        if tx.send(ack).await.is_err() {
            return;
        }
        let mut newest: HashMap<GroupId, Timestamp> = HashMap::new();
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            timer.tick().await;
            for group in &groups {
                let rows = match backend.fetch_messages(group, page_size).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        let _ = tx.send(ChangeEvent::ChannelError(e.to_string())).await;
                        return;
                    }
                };
                let seen = newest.get(group).copied();
                for row in rows {
                    if seen.is_some_and(|at| row.created_at <= at) {
                        continue;
                    }
                    newest.insert(group.clone(), row.created_at);
                    if tx.send(ChangeEvent::Insert(row)).await.is_err() {
                        return;
                    }
                }
            }
            tracing::trace!("Polled {} group(s)", groups.len());
        }
    });

    Subscription {
        channel,
        events: rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;

    #[test]
    fn probe_prefers_realtime() {
        let adapter = FeedAdapter::probe(Capabilities::default(), Duration::from_secs(15), 50);
        assert_eq!(adapter, FeedAdapter::Realtime);
        assert!(adapter.uses_heartbeat());

        let no_feed = Capabilities {
            realtime: false,
            heartbeat: false,
        };
        let adapter = FeedAdapter::probe(no_feed, Duration::from_secs(15), 50);
        assert!(matches!(adapter, FeedAdapter::Polling { .. }));
        assert!(!adapter.uses_heartbeat());
    }

    #[tokio::test(start_paused = true)]
    async fn poller_acknowledges_then_emits_new_rows_once() {
        let backend = Arc::new(MockBackend::polling());
        let group = GroupId::new("g1");
        let first = backend.insert_remote(&group, "bob", "before");

        let adapter = FeedAdapter::Polling {
            interval: Duration::from_secs(5),
            page_size: 50,
        };
        let mut sub = adapter.open(&backend, &[group.clone()]).await.unwrap();

        assert!(matches!(
            sub.events.recv().await,
            Some(ChangeEvent::Subscribed { .. })
        ));
        assert_eq!(sub.events.recv().await, Some(ChangeEvent::Insert(first)));

        let second = backend.insert_remote(&group, "bob", "after");
        // Next poll only carries the new row
        assert_eq!(sub.events.recv().await, Some(ChangeEvent::Insert(second)));
    }

    #[tokio::test(start_paused = true)]
    async fn poller_reports_fetch_failure() {
        let backend = Arc::new(MockBackend::polling());
        backend.set_online(false);
        let adapter = FeedAdapter::Polling {
            interval: Duration::from_secs(5),
            page_size: 50,
        };
        let mut sub = adapter.open(&backend, &[GroupId::new("g1")]).await.unwrap();

        assert!(matches!(
            sub.events.recv().await,
            Some(ChangeEvent::Subscribed { .. })
        ));
        assert!(matches!(
            sub.events.recv().await,
            Some(ChangeEvent::ChannelError(_))
        ));
        assert_eq!(sub.events.recv().await, None);
    }
}

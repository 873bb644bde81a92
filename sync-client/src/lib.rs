//! # sync-client
//!
//! Offline-first sync engine for group chat.
//!
//! Applications talk to a [`SyncEngine`]: they send messages, open and
//! close conversations, and report host and network signals. The engine
//! keeps a durable local copy of every conversation and stays consistent
//! with the backend across flaky networks and app suspension.
//!
//! ## Features
//!
//! - **Optimistic sends**: a message shows immediately and is confirmed
//!   once, whether the direct send, an outbox retry, or the realtime echo
//!   wins
//! - **Durable outbox**: unconfirmed sends survive restarts and retry with
//!   capped exponential backoff
//! - **Self-healing realtime**: heartbeats, a liveness watchdog, and a
//!   single-flight reconnect sequence
//! - **Read tracking**: monotonic read pointers with a first-view baseline
//!
//! ## Example
//!
//! ```ignore
//! use sync_client::{Config, MockBackend, SyncEngine};
//! use sync_types::{GroupId, OutgoingMessage, UserId};
//!
//! let engine = SyncEngine::open(Config::default(), Arc::new(MockBackend::new())).await?;
//! let group = GroupId::new("general");
//! engine.start(vec![group.clone()]).await?;
//!
//! let outcome = engine
//!     .send(OutgoingMessage::new(group, UserId::new("alice"), "hi"))
//!     .await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapter;
pub mod auth;
pub mod backend;
pub mod config;
pub mod connection;
pub mod engine;
pub mod events;
pub mod host;
pub mod outbox;
pub mod read_tracker;
pub mod reconcile;

pub use adapter::FeedAdapter;
pub use auth::TokenManager;
pub use backend::{Backend, BackendError, Capabilities, MockBackend, Subscription};
pub use config::{Config, ConfigError, ConnectionConfig, OutboxConfig, ReadConfig};
pub use connection::{ConnectionManager, FeedHandler, StoreProbe};
pub use engine::SyncEngine;
pub use events::{Snapshot, SyncUpdate, WakeDisposition};
pub use host::{HostLifecycle, HostState, NetworkMonitor};
pub use outbox::{DrainReport, OutboxProcessor};
pub use read_tracker::ReadTracker;
pub use reconcile::Reconciler;

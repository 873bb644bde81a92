//! CLI command implementations.

pub mod checkpoint;
pub mod demo;
pub mod outbox;
pub mod status;

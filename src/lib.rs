//! # quorumq
//!
//! Work queue layered over several independent set-store replicas and a
//! session-based coordination service.
//!
//! Producers get quorum-acknowledged writes across the replicas. Consumers
//! claim items through ephemeral lock nodes, so concurrent pollers never both
//! hold the same item. Delivery is at-least-once: a crashed consumer's locks
//! vanish with its coordination session.

pub mod config;
pub mod coordination;
pub mod error;
pub mod event;
pub mod memory;
pub mod model;
pub mod queue;
pub mod replica;
pub mod session;
pub mod telemetry;

pub use error::{Error, Result};
pub use queue::{Claim, Queue};

//! In-process replica and coordination backends.
//!
//! Used by tests and the `soak` command. Both support fault injection so the
//! failover and session-restart paths can be driven deterministically.

mod coordinator;
mod replica;

pub use coordinator::{MemoryCoordinationService, MemoryCoordinator};
pub use replica::MemoryReplica;

//! Coordination-service contract: sessions and ephemeral lock nodes.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::model::LockPath;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordinationError {
    /// The node is already present. Signals a held lock, not a fault.
    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("node does not exist: {0}")]
    NoNode(String),

    #[error("no active session")]
    NoSession,

    #[error("session expired")]
    SessionExpired,

    #[error("connection lost: {0}")]
    ConnectionLoss(String),

    #[error("coordination client is closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

/// Lifetime of a created node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeMode {
    Persistent,
    /// Removed automatically when the creating session ends.
    Ephemeral,
}

/// Version guard for deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Any,
    Exact(u64),
}

/// Session signals raised by the coordination client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session is gone along with every ephemeral node it created.
    Expired,
}

/// Session-oriented lock service.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Start (or restart) a session. Replaces any previous session.
    async fn start_session(&self) -> Result<(), CoordinationError>;

    /// Subscribe to session signals. Subscribe before starting a session to
    /// avoid missing an early expiry.
    fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent>;

    /// Atomically create `path` if absent, otherwise fail with
    /// [`CoordinationError::NodeExists`].
    async fn create_node(&self, path: &LockPath, mode: NodeMode) -> Result<(), CoordinationError>;

    async fn delete_node(&self, path: &LockPath, version: Version) -> Result<(), CoordinationError>;

    async fn close(&self) -> Result<(), CoordinationError>;
}

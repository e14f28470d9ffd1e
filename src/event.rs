//! Diagnostic events raised by the queue.
//!
//! Events go out on a bounded broadcast stream for external collectors and
//! are always logged through `tracing` as well, so a queue with no
//! subscribers still leaves a trace of every failure.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::model::Operation;

/// A diagnostic event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A coordination session was (re)started; `epoch` counts successful starts.
    Ready { epoch: u64 },
    /// A single replica call failed, or the replica reported a connection error.
    ReplicaError {
        replica: String,
        operation: Option<Operation>,
        error: String,
    },
    SessionError { error: String, retry_in_ms: u64 },
    SessionExpired,
    /// A replica reconnects too slowly to be useful for failover.
    ConfigWarning {
        replica: String,
        retry_max_delay_ms: Option<u64>,
        limit_ms: u64,
    },
    /// Deleting a lock node did not go cleanly.
    LockReleaseError { lock: String, error: String },
    CoordinatorCloseError { error: String },
    Closed,
}

/// Emitter half of the diagnostic stream.
pub struct Diagnostics {
    tx: broadcast::Sender<Event>,
    seq: AtomicU64,
}

impl Diagnostics {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            seq: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn emit(&self, kind: EventKind) {
        log_event(&kind);
        let event = Event {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp: Utc::now(),
            kind,
        };
        // No receivers is fine: the event was logged above.
        let _ = self.tx.send(event);
    }
}

fn log_event(kind: &EventKind) {
    match kind {
        EventKind::Ready { epoch } => info!(epoch, "coordination session ready"),
        EventKind::ReplicaError {
            replica,
            operation,
            error,
        } => warn!(
            replica = %replica,
            operation = operation.map(Operation::as_str).unwrap_or("stream"),
            "replica error: {error}"
        ),
        EventKind::SessionError { error, retry_in_ms } => {
            error!(retry_in_ms, "session start failed: {error}")
        }
        EventKind::SessionExpired => warn!("coordination session expired"),
        EventKind::ConfigWarning {
            replica,
            retry_max_delay_ms,
            limit_ms,
        } => warn!(
            replica = %replica,
            ?retry_max_delay_ms,
            limit_ms,
            "replica retry ceiling is too loose for fast failover"
        ),
        EventKind::LockReleaseError { lock, error } => {
            warn!(lock = %lock, "lock release: {error}")
        }
        EventKind::CoordinatorCloseError { error } => {
            error!("closing coordination client: {error}")
        }
        EventKind::Closed => info!("queue closed"),
    }
}

//! Queue lifecycle and the coordination-session supervisor.
//!
//! ```text
//! Initializing ──▶ Ready ──▶ Reconnecting ──▶ Ready ...
//!       │            │             │
//!       └────────────┴─────────────┴──▶ Closed (terminal)
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::coordination::{Coordinator, SessionEvent};
use crate::event::{Diagnostics, EventKind};
use crate::replica::ReplicaSet;
use crate::telemetry::queue::record_state_transition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    /// No session has been established yet.
    Initializing,
    /// A session is live; locks can be taken.
    Ready,
    /// The session expired and a new one is being started.
    Reconnecting,
    Closed,
}

impl QueueState {
    pub fn can_transition_to(self, to: QueueState) -> bool {
        use QueueState::*;
        matches!(
            (self, to),
            (Initializing, Ready)
                | (Ready, Reconnecting)
                | (Reconnecting, Ready)
                | (Initializing | Ready | Reconnecting, Closed)
        )
    }

    pub fn is_closed(&self) -> bool {
        *self == QueueState::Closed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current [`QueueState`], observable by any number of watchers.
pub struct Lifecycle {
    tx: watch::Sender<QueueState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(QueueState::Initializing);
        Self { tx }
    }

    pub fn state(&self) -> QueueState {
        *self.tx.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    pub fn subscribe(&self) -> watch::Receiver<QueueState> {
        self.tx.subscribe()
    }

    /// Move to `to` if allowed from the current state. Returns whether the
    /// state changed.
    pub fn transition(&self, to: QueueState) -> bool {
        let mut from = None;
        let changed = self.tx.send_if_modified(|state| {
            if state.can_transition_to(to) {
                from = Some(*state);
                *state = to;
                true
            } else {
                false
            }
        });
        if let Some(from) = from {
            record_state_transition(from, to);
        }
        changed
    }

    /// Wait until the state is `Ready` or `Closed`, returning which.
    pub async fn settled(&self) -> QueueState {
        let mut rx = self.subscribe();
        match rx
            .wait_for(|s| matches!(s, QueueState::Ready | QueueState::Closed))
            .await
        {
            Ok(state) => *state,
            // The sender lives in `self`, so this is unreachable in practice.
            Err(_) => QueueState::Closed,
        }
    }
}

/// Keeps a coordination session alive for one queue.
///
/// Starts the session, retrying with a fixed backoff until it succeeds or
/// the queue closes, then restarts it from scratch every time it expires.
pub(crate) struct SessionSupervisor {
    pub coordinator: Arc<dyn Coordinator>,
    pub replicas: ReplicaSet,
    pub diagnostics: Arc<Diagnostics>,
    pub lifecycle: Arc<Lifecycle>,
    pub retry: Duration,
    pub replica_retry_limit: Duration,
}

impl SessionSupervisor {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut expired = self.coordinator.subscribe_session();
        let mut state = self.lifecycle.subscribe();
        let mut epoch = 0u64;

        loop {
            if !self.start_session(&mut state).await {
                return;
            }
            epoch += 1;
            self.check_replica_backoff();

            if !self.lifecycle.transition(QueueState::Ready) {
                return;
            }
            self.diagnostics.emit(EventKind::Ready { epoch });

            tokio::select! {
                _ = closed(&mut state) => return,
                event = expired.recv() => match event {
                    Ok(SessionEvent::Expired) | Err(RecvError::Lagged(_)) => {
                        // Locks taken under the old session are gone with it.
                        self.diagnostics.emit(EventKind::SessionExpired);
                        if !self.lifecycle.transition(QueueState::Reconnecting) {
                            return;
                        }
                    }
                    Err(RecvError::Closed) => {
                        tracing::warn!("coordinator dropped its session signal, no further restarts");
                        closed(&mut state).await;
                        return;
                    }
                },
            }
        }
    }

    /// Returns `false` if the queue closed before a session was established.
    async fn start_session(&self, state: &mut watch::Receiver<QueueState>) -> bool {
        loop {
            if self.lifecycle.is_closed() {
                return false;
            }
            match self.coordinator.start_session().await {
                Ok(()) => return true,
                Err(e) => {
                    self.diagnostics.emit(EventKind::SessionError {
                        error: e.to_string(),
                        retry_in_ms: self.retry.as_millis() as u64,
                    });
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry) => {}
                        _ = closed(state) => return false,
                    }
                }
            }
        }
    }

    /// A replica that backs off for long stretches defeats fast failover.
    fn check_replica_backoff(&self) {
        let limit = self.replica_retry_limit;
        for replica in self.replicas.iter() {
            match replica.retry_max_delay() {
                Some(delay) if delay <= limit => {}
                ceiling => self.diagnostics.emit(EventKind::ConfigWarning {
                    replica: replica.name().to_string(),
                    retry_max_delay_ms: ceiling.map(|d| d.as_millis() as u64),
                    limit_ms: limit.as_millis() as u64,
                }),
            }
        }
    }
}

/// Resolves once the queue is closed.
async fn closed(state: &mut watch::Receiver<QueueState>) {
    // The watch guard is dropped here so callers never hold it.
    let _ = state.wait_for(QueueState::is_closed).await;
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::coordination::{CoordinationError, Coordinator, NodeMode, SessionEvent, Version};
use crate::model::LockPath;

#[derive(Debug, Clone)]
struct Node {
    version: u64,
    /// Owning session for ephemeral nodes.
    owner: Option<Uuid>,
}

/// The shared node tree. Several [`MemoryCoordinator`] clients connected to
/// the same service contend for the same nodes, like separate processes
/// talking to one coordination cluster.
#[derive(Default)]
pub struct MemoryCoordinationService {
    nodes: Mutex<HashMap<String, Node>>,
}

impl MemoryCoordinationService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a client with no session yet.
    pub fn connect(self: &Arc<Self>) -> MemoryCoordinator {
        let (events, _) = broadcast::channel(16);
        MemoryCoordinator {
            service: Arc::clone(self),
            session: Mutex::new(None),
            events,
            failing_starts: AtomicUsize::new(0),
            available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    pub fn exists(&self, path: &LockPath) -> bool {
        self.lock_nodes().contains_key(path.as_str())
    }

    pub fn node_count(&self) -> usize {
        self.lock_nodes().len()
    }

    fn drop_ephemerals(&self, session: Uuid) {
        self.lock_nodes()
            .retain(|_, node| node.owner != Some(session));
    }

    fn lock_nodes(&self) -> std::sync::MutexGuard<'_, HashMap<String, Node>> {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One client of a [`MemoryCoordinationService`].
pub struct MemoryCoordinator {
    service: Arc<MemoryCoordinationService>,
    session: Mutex<Option<Uuid>>,
    events: broadcast::Sender<SessionEvent>,
    failing_starts: AtomicUsize,
    available: AtomicBool,
    closed: AtomicBool,
}

impl MemoryCoordinator {
    pub fn service(&self) -> &Arc<MemoryCoordinationService> {
        &self.service
    }

    /// Make the next `n` session starts fail with a connection loss.
    pub fn fail_next_starts(&self, n: usize) {
        self.failing_starts.store(n, Ordering::SeqCst);
    }

    /// Simulate a network partition for node operations.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// End the current session as the service would after a timeout:
    /// its ephemeral nodes disappear and `Expired` is signalled.
    pub fn expire_session(&self) {
        let previous = self.lock_session().take();
        if let Some(session) = previous {
            self.service.drop_ephemerals(session);
        }
        let _ = self.events.send(SessionEvent::Expired);
    }

    pub fn has_session(&self) -> bool {
        self.lock_session().is_some()
    }

    fn current_session(&self) -> Result<Uuid, CoordinationError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordinationError::Closed);
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(CoordinationError::ConnectionLoss(
                "coordination service unreachable".to_string(),
            ));
        }
        (*self.lock_session()).ok_or(CoordinationError::NoSession)
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<Uuid>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn start_session(&self) -> Result<(), CoordinationError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordinationError::Closed);
        }
        let failing = self
            .failing_starts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(CoordinationError::ConnectionLoss(
                "session handshake timed out".to_string(),
            ));
        }

        let previous = self.lock_session().replace(Uuid::new_v4());
        if let Some(session) = previous {
            self.service.drop_ephemerals(session);
        }
        Ok(())
    }

    fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn create_node(&self, path: &LockPath, mode: NodeMode) -> Result<(), CoordinationError> {
        let session = self.current_session()?;
        let mut nodes = self.service.lock_nodes();
        if nodes.contains_key(path.as_str()) {
            return Err(CoordinationError::NodeExists(path.to_string()));
        }
        let owner = match mode {
            NodeMode::Ephemeral => Some(session),
            NodeMode::Persistent => None,
        };
        nodes.insert(path.to_string(), Node { version: 0, owner });
        Ok(())
    }

    async fn delete_node(&self, path: &LockPath, version: Version) -> Result<(), CoordinationError> {
        self.current_session()?;
        let mut nodes = self.service.lock_nodes();
        let Some(node) = nodes.get(path.as_str()) else {
            return Err(CoordinationError::NoNode(path.to_string()));
        };
        if let Version::Exact(expected) = version {
            if node.version != expected {
                return Err(CoordinationError::Other(format!(
                    "bad version for {path}: expected {expected}, found {}",
                    node.version
                )));
            }
        }
        nodes.remove(path.as_str());
        Ok(())
    }

    async fn close(&self) -> Result<(), CoordinationError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let previous = self.lock_session().take();
        if let Some(session) = previous {
            self.service.drop_ephemerals(session);
        }
        Ok(())
    }
}

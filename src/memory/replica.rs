use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::IteratorRandom;
use tokio::sync::broadcast;

use crate::model::Item;
use crate::replica::{Replica, ReplicaError};

/// A set-store replica held in memory.
pub struct MemoryReplica {
    name: String,
    sets: Mutex<HashMap<String, HashSet<Item>>>,
    available: AtomicBool,
    closed: AtomicBool,
    fail_close: AtomicBool,
    retry_max_delay: Option<Duration>,
    errors: broadcast::Sender<ReplicaError>,
}

impl MemoryReplica {
    pub fn new(name: impl Into<String>) -> Self {
        let (errors, _) = broadcast::channel(16);
        Self {
            name: name.into(),
            sets: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            retry_max_delay: Some(Duration::from_millis(1000)),
            errors,
        }
    }

    /// Report a reconnect ceiling; `None` reports an unbounded backoff.
    pub fn with_retry_max_delay(mut self, delay: Option<Duration>) -> Self {
        self.retry_max_delay = delay;
        self
    }

    /// Take the replica down or bring it back. Going down raises a
    /// connection error on the error stream; the data survives.
    pub fn set_available(&self, available: bool) {
        let was = self.available.swap(available, Ordering::SeqCst);
        if was && !available {
            let _ = self
                .errors
                .send(ReplicaError::ConnectionLost(self.name.clone()));
        }
    }

    /// Make the next `close` fail.
    pub fn fail_on_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Members at `key`, bypassing availability. For assertions.
    pub fn members(&self, key: &str) -> HashSet<Item> {
        self.lock_sets().get(key).cloned().unwrap_or_default()
    }

    fn check(&self) -> Result<(), ReplicaError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReplicaError::Closed(self.name.clone()));
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(ReplicaError::Unavailable(self.name.clone()));
        }
        Ok(())
    }

    fn lock_sets(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashSet<Item>>> {
        // A poisoned map is still a valid map.
        self.sets.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Replica for MemoryReplica {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add_member(&self, key: &str, item: &Item) -> Result<(), ReplicaError> {
        self.check()?;
        self.lock_sets()
            .entry(key.to_string())
            .or_default()
            .insert(item.clone());
        Ok(())
    }

    async fn remove_member(&self, key: &str, item: &Item) -> Result<(), ReplicaError> {
        self.check()?;
        let mut sets = self.lock_sets();
        if let Some(set) = sets.get_mut(key) {
            set.remove(item);
            if set.is_empty() {
                sets.remove(key);
            }
        }
        Ok(())
    }

    async fn random_member(&self, key: &str) -> Result<Option<Item>, ReplicaError> {
        self.check()?;
        let sets = self.lock_sets();
        Ok(sets
            .get(key)
            .and_then(|set| set.iter().choose(&mut rand::thread_rng()).cloned()))
    }

    async fn cardinality(&self, key: &str) -> Result<u64, ReplicaError> {
        self.check()?;
        Ok(self.lock_sets().get(key).map_or(0, |set| set.len() as u64))
    }

    async fn delete_key(&self, key: &str) -> Result<(), ReplicaError> {
        self.check()?;
        self.lock_sets().remove(key);
        Ok(())
    }

    fn subscribe_errors(&self) -> broadcast::Receiver<ReplicaError> {
        self.errors.subscribe()
    }

    fn retry_max_delay(&self) -> Option<Duration> {
        self.retry_max_delay
    }

    async fn close(&self) -> Result<(), ReplicaError> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(ReplicaError::Backend {
                replica: self.name.clone(),
                message: "connection reset during quit".to_string(),
            });
        }
        Ok(())
    }
}

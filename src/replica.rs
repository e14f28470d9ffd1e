//! Set-store replicas and randomized traversal over them.
//!
//! A [`Replica`] is one independent storage backend holding a copy of the
//! queue's item set. The queue never manages a replica's transport; it only
//! observes the errors a replica reports.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::model::Item;

/// Failure of a single replica call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplicaError {
    #[error("replica {0} is unavailable")]
    Unavailable(String),

    #[error("replica {0} connection lost")]
    ConnectionLost(String),

    #[error("replica {0} is closed")]
    Closed(String),

    #[error("replica {replica}: {message}")]
    Backend { replica: String, message: String },
}

/// Storage-backend contract for one replica of the queue's set.
#[async_trait]
pub trait Replica: Send + Sync {
    /// Human-readable identifier used in diagnostics.
    fn name(&self) -> &str;

    /// Add `item` to the set at `key`. Adding an existing member succeeds.
    async fn add_member(&self, key: &str, item: &Item) -> Result<(), ReplicaError>;

    async fn remove_member(&self, key: &str, item: &Item) -> Result<(), ReplicaError>;

    /// A random member of the set, or `None` when the set is empty or missing.
    async fn random_member(&self, key: &str) -> Result<Option<Item>, ReplicaError>;

    async fn cardinality(&self, key: &str) -> Result<u64, ReplicaError>;

    /// Delete the whole set.
    async fn delete_key(&self, key: &str) -> Result<(), ReplicaError>;

    /// Connection-level errors raised outside of any particular call.
    fn subscribe_errors(&self) -> broadcast::Receiver<ReplicaError>;

    /// Upper bound on the replica's reconnect backoff. `None` means unbounded.
    fn retry_max_delay(&self) -> Option<Duration>;

    async fn close(&self) -> Result<(), ReplicaError>;
}

/// The replicas backing one queue.
#[derive(Clone)]
pub struct ReplicaSet {
    replicas: Vec<Arc<dyn Replica>>,
}

impl ReplicaSet {
    pub fn new(replicas: Vec<Arc<dyn Replica>>) -> Self {
        Self { replicas }
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// All replicas in their construction order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Replica>> {
        self.replicas.iter()
    }

    /// A uniformly shuffled permutation of the replicas, fresh per call.
    ///
    /// Sequential scans walk this order so load spreads across replicas and a
    /// dead replica at the front only costs one failed call.
    pub fn order(&self) -> Vec<Arc<dyn Replica>> {
        let mut order = self.replicas.clone();
        order.shuffle(&mut rand::thread_rng());
        order
    }
}

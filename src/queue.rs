//! The queue: quorum writes, scan-and-lock pops, lifecycle.
//!
//! All item storage goes through the [`ReplicaSet`]; all mutual exclusion goes
//! through the [`Coordinator`]. No in-process lock guards an item. Two pops
//! racing for the same item are serialized only by the coordination
//! service's atomic create-if-absent on the item's lock node.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::join_all;
use opentelemetry::KeyValue;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, warn};

use crate::config::QueueConfig;
use crate::coordination::{CoordinationError, Coordinator, NodeMode, Version};
use crate::error::{Error, Result};
use crate::event::{Diagnostics, Event, EventKind};
use crate::model::{Item, LockPath, Operation, QueueKey};
use crate::replica::{Replica, ReplicaError, ReplicaSet};
use crate::session::{Lifecycle, QueueState, SessionSupervisor};
use crate::telemetry::metrics;
use crate::telemetry::queue::{record_acknowledged, start_operation_span};

/// A work queue over replicated set-stores.
///
/// Cloning is cheap; clones share replicas, session and lifecycle.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

struct Inner {
    key: QueueKey,
    config: QueueConfig,
    replicas: ReplicaSet,
    coordinator: Arc<dyn Coordinator>,
    diagnostics: Arc<Diagnostics>,
    lifecycle: Arc<Lifecycle>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Queue {
    /// Build a queue and start its coordination session in the background.
    ///
    /// Must be called inside a tokio runtime. The queue accepts writes
    /// immediately; pops wait for [`QueueState::Ready`].
    pub fn new(
        replicas: Vec<Arc<dyn Replica>>,
        coordinator: Arc<dyn Coordinator>,
        config: QueueConfig,
    ) -> Result<Self> {
        config.validate(replicas.len())?;

        let replicas = ReplicaSet::new(replicas);
        let diagnostics = Arc::new(Diagnostics::new(config.diagnostic_capacity));
        let lifecycle = Arc::new(Lifecycle::new());

        let mut tasks: Vec<JoinHandle<()>> = replicas
            .iter()
            .map(|replica| forward_replica_errors(replica, Arc::clone(&diagnostics)))
            .collect();

        tasks.push(
            SessionSupervisor {
                coordinator: Arc::clone(&coordinator),
                replicas: replicas.clone(),
                diagnostics: Arc::clone(&diagnostics),
                lifecycle: Arc::clone(&lifecycle),
                retry: config.session_retry_interval(),
                replica_retry_limit: config.replica_retry_limit(),
            }
            .spawn(),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                key: QueueKey::new(config.key.clone()),
                config,
                replicas,
                coordinator,
                diagnostics,
                lifecycle,
                tasks: Mutex::new(tasks),
            }),
        })
    }

    pub fn key(&self) -> &QueueKey {
        &self.inner.key
    }

    pub fn state(&self) -> QueueState {
        self.inner.lifecycle.state()
    }

    /// Subscribe to diagnostic events (replica errors, session errors,
    /// configuration warnings, readiness).
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.diagnostics.subscribe()
    }

    /// Wait until a session is established or the queue is closed.
    pub async fn ready(&self) -> QueueState {
        self.inner.lifecycle.settled().await
    }

    /// Add `item` to every replica in parallel.
    ///
    /// Succeeds with the number of acknowledging replicas if at least the
    /// write quorum acknowledged. A failed quorum leaves any partial writes
    /// in place. Pushing an item already present is a successful no-op.
    pub async fn push(&self, item: impl Into<Item>) -> Result<usize> {
        let item = item.into();
        let span = start_operation_span(self.inner.key.as_str(), Operation::Push);
        let started = Instant::now();

        let result: Result<usize> = async {
            self.inner.ensure_open(Operation::Push)?;
            if item.is_empty() {
                return Err(Error::EmptyItem);
            }

            let key = self.inner.key.as_str();
            let item = &item;
            let results = join_all(self.inner.replicas.order().into_iter().map(
                |replica| async move {
                    let result = replica.add_member(key, item).await;
                    (replica, result)
                },
            ))
            .await;

            let acknowledged = self.inner.tally(Operation::Push, results);
            record_acknowledged(&tracing::Span::current(), acknowledged);
            self.inner.require_quorum(Operation::Push, acknowledged)
        }
        .instrument(span)
        .await;

        self.inner.observe(Operation::Push, started, outcome(&result));
        result
    }

    /// Claim one unclaimed item, retrying lock conflicts up to the
    /// configured `pop_tries`.
    pub async fn pop(&self) -> Result<Option<Claim>> {
        self.pop_with_tries(self.inner.config.pop_tries).await
    }

    /// Claim one unclaimed item.
    ///
    /// Replicas are asked one at a time, in random order, for a random
    /// member. The first item found is locked with an ephemeral node; if the
    /// node already exists the whole scan is repeated, at most `tries` times
    /// in total. Contention that outlasts `tries` yields `Ok(None)`, the
    /// same as an empty queue.
    ///
    /// # Errors
    ///
    /// [`Error::NoReplicaAvailable`] if no replica answered,
    /// [`Error::Lock`] if lock creation failed for a reason other than
    /// contention, [`Error::NotReady`] without a live session.
    pub async fn pop_with_tries(&self, tries: u32) -> Result<Option<Claim>> {
        let span = start_operation_span(self.inner.key.as_str(), Operation::Pop);
        let started = Instant::now();

        let result: Result<Option<Claim>> = async {
            self.inner.ensure_open(Operation::Pop)?;
            if self.inner.lifecycle.state() != QueueState::Ready {
                return Err(Error::NotReady(Operation::Pop));
            }

            let mut remaining = tries.max(1);
            loop {
                let Some(item) = self.inner.scan_random_member().await? else {
                    return Ok(None);
                };

                let lock = self.inner.key.lock_path(&item);
                match self
                    .inner
                    .coordinator
                    .create_node(&lock, NodeMode::Ephemeral)
                    .await
                {
                    Ok(()) => {
                        debug!(lock = %lock, "item claimed");
                        return Ok(Some(Claim {
                            queue: self.clone(),
                            item,
                            lock,
                        }));
                    }
                    Err(CoordinationError::NodeExists(_)) => {
                        metrics::lock_conflicts().add(
                            1,
                            &[KeyValue::new("queue", self.inner.key.as_str().to_string())],
                        );
                        remaining -= 1;
                        if remaining == 0 {
                            debug!(tries, "every candidate was locked, giving up");
                            return Ok(None);
                        }
                        debug!(lock = %lock, remaining, "item already claimed, rescanning");
                    }
                    Err(e) => return Err(Error::Lock(e)),
                }
            }
        }
        .instrument(span)
        .await;

        let label = match &result {
            Ok(None) => "empty",
            other => outcome(other),
        };
        self.inner.observe(Operation::Pop, started, label);
        result
    }

    /// Delete `item` from every replica in parallel, best-effort.
    ///
    /// Returns the number of replicas that acknowledged. Failures are only
    /// reported as diagnostics.
    pub async fn remove(&self, item: impl Into<Item>) -> Result<usize> {
        let item = item.into();
        let span = start_operation_span(self.inner.key.as_str(), Operation::Remove);
        let started = Instant::now();

        let result: Result<usize> = async {
            self.inner.ensure_open(Operation::Remove)?;

            let key = self.inner.key.as_str();
            let item = &item;
            let results = join_all(self.inner.replicas.order().into_iter().map(
                |replica| async move {
                    let result = replica.remove_member(key, item).await;
                    (replica, result)
                },
            ))
            .await;

            let acknowledged = self.inner.tally(Operation::Remove, results);
            record_acknowledged(&tracing::Span::current(), acknowledged);
            Ok(acknowledged)
        }
        .instrument(span)
        .await;

        self.inner.observe(Operation::Remove, started, outcome(&result));
        result
    }

    /// Release the lock on `item`. Releasing a lock that is not held is
    /// not an error.
    pub async fn unlock(&self, item: impl Into<Item>) -> Result<()> {
        let item = item.into();
        let span = start_operation_span(self.inner.key.as_str(), Operation::Unlock);
        let started = Instant::now();
        let result = self
            .inner
            .release(&self.inner.key.lock_path(&item))
            .instrument(span)
            .await;
        self.inner.observe(Operation::Unlock, started, outcome(&result));
        result
    }

    /// Approximate number of items.
    ///
    /// This is the cardinality reported by the first reachable replica in a
    /// random order. Replicas may disagree after partial writes, so
    /// successive calls can return different values.
    pub async fn size(&self) -> Result<u64> {
        let span = start_operation_span(self.inner.key.as_str(), Operation::Size);
        let started = Instant::now();

        let result: Result<u64> = async {
            self.inner.ensure_open(Operation::Size)?;

            for replica in self.inner.replicas.order() {
                match replica.cardinality(self.inner.key.as_str()).await {
                    Ok(size) => return Ok(size),
                    Err(e) => self.inner.replica_error(replica.name(), Operation::Size, &e),
                }
            }
            Err(Error::SizeUnavailable)
        }
        .instrument(span)
        .await;

        self.inner.observe(Operation::Size, started, outcome(&result));
        result
    }

    /// Delete the whole set on every replica. Requires the write quorum.
    /// Outstanding locks are left alone.
    pub async fn clear(&self) -> Result<usize> {
        let span = start_operation_span(self.inner.key.as_str(), Operation::Clear);
        let started = Instant::now();

        let result: Result<usize> = async {
            self.inner.ensure_open(Operation::Clear)?;

            let key = self.inner.key.as_str();
            let results = join_all(self.inner.replicas.order().into_iter().map(
                |replica| async move {
                    let result = replica.delete_key(key).await;
                    (replica, result)
                },
            ))
            .await;

            let acknowledged = self.inner.tally(Operation::Clear, results);
            record_acknowledged(&tracing::Span::current(), acknowledged);
            self.inner.require_quorum(Operation::Clear, acknowledged)
        }
        .instrument(span)
        .await;

        self.inner.observe(Operation::Clear, started, outcome(&result));
        result
    }

    /// Close the queue for good.
    ///
    /// Stops session restarts, closes the coordination client (releasing
    /// every lock this queue holds) and closes every replica. Errors along
    /// the way are reported as diagnostics. Closing twice is a no-op.
    pub async fn close(&self) {
        if !self.inner.lifecycle.transition(QueueState::Closed) {
            return;
        }

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }

        if let Err(e) = self.inner.coordinator.close().await {
            self.inner
                .diagnostics
                .emit(EventKind::CoordinatorCloseError {
                    error: e.to_string(),
                });
        }

        let closes = join_all(self.inner.replicas.iter().map(|replica| async move {
            let result = replica.close().await;
            (Arc::clone(replica), result)
        }))
        .await;
        self.inner.tally(Operation::Close, closes);

        self.inner.diagnostics.emit(EventKind::Closed);
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("key", &self.inner.key)
            .field("replicas", &self.inner.replicas.len())
            .field("write_quorum", &self.inner.config.write_quorum)
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    fn ensure_open(&self, operation: Operation) -> Result<()> {
        if self.lifecycle.is_closed() {
            return Err(Error::Closed(operation));
        }
        Ok(())
    }

    /// Count successful replica calls, reporting every failure.
    fn tally(
        &self,
        operation: Operation,
        results: Vec<(Arc<dyn Replica>, std::result::Result<(), ReplicaError>)>,
    ) -> usize {
        let mut acknowledged = 0;
        for (replica, result) in results {
            match result {
                Ok(()) => acknowledged += 1,
                Err(e) => self.replica_error(replica.name(), operation, &e),
            }
        }
        acknowledged
    }

    fn require_quorum(&self, operation: Operation, acknowledged: usize) -> Result<usize> {
        let required = self.config.write_quorum;
        if acknowledged >= required {
            Ok(acknowledged)
        } else {
            Err(Error::Quorum {
                operation,
                required,
                acknowledged,
            })
        }
    }

    /// Ask replicas one by one for a random member.
    ///
    /// `Ok(None)` means at least one replica answered and none had an item.
    async fn scan_random_member(&self) -> Result<Option<Item>> {
        let mut reachable = false;
        for replica in self.replicas.order() {
            match replica.random_member(self.key.as_str()).await {
                Ok(Some(item)) => return Ok(Some(item)),
                Ok(None) => reachable = true,
                Err(e) => self.replica_error(replica.name(), Operation::Pop, &e),
            }
        }
        if reachable {
            Ok(None)
        } else {
            Err(Error::NoReplicaAvailable)
        }
    }

    async fn release(&self, lock: &LockPath) -> Result<()> {
        self.ensure_open(Operation::Unlock)?;

        match self.coordinator.delete_node(lock, Version::Any).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.diagnostics.emit(EventKind::LockReleaseError {
                    lock: lock.to_string(),
                    error: e.to_string(),
                });
                match e {
                    // Already released, e.g. by session expiry.
                    CoordinationError::NoNode(_) => Ok(()),
                    other => Err(Error::Lock(other)),
                }
            }
        }
    }

    fn replica_error(&self, replica: &str, operation: Operation, error: &ReplicaError) {
        metrics::replica_errors().add(
            1,
            &[
                KeyValue::new("replica", replica.to_string()),
                KeyValue::new("operation", operation.as_str()),
            ],
        );
        self.diagnostics.emit(EventKind::ReplicaError {
            replica: replica.to_string(),
            operation: Some(operation),
            error: error.to_string(),
        });
    }

    fn observe(&self, operation: Operation, started: Instant, result: &'static str) {
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", self.key.as_str().to_string()),
                KeyValue::new("operation", operation.as_str()),
                KeyValue::new("result", result),
            ],
        );
        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", operation.as_str())],
        );
    }
}

impl Drop for Inner {
    /// The last handle is gone: stop session restarts and error forwarding.
    /// Session and replica connections are left to their owners.
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

fn outcome<T>(result: &Result<T>) -> &'static str {
    if result.is_ok() { "ok" } else { "error" }
}

/// Relay a replica's connection-level errors into the diagnostic stream.
fn forward_replica_errors(
    replica: &Arc<dyn Replica>,
    diagnostics: Arc<Diagnostics>,
) -> JoinHandle<()> {
    let mut errors = replica.subscribe_errors();
    let name = replica.name().to_string();
    tokio::spawn(async move {
        loop {
            match errors.recv().await {
                Ok(error) => diagnostics.emit(EventKind::ReplicaError {
                    replica: name.clone(),
                    operation: None,
                    error: error.to_string(),
                }),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(replica = %name, skipped, "replica error stream lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// An item claimed by [`Queue::pop`], together with its lock.
///
/// Finish with [`Claim::complete`] or [`Claim::abandon`]. A claim that is
/// simply dropped keeps its lock until the coordination session ends, after
/// which the item becomes eligible again.
#[must_use = "a claim holds the item's lock until completed or abandoned"]
pub struct Claim {
    queue: Queue,
    item: Item,
    lock: LockPath,
}

impl Claim {
    pub fn item(&self) -> &Item {
        &self.item
    }

    pub fn lock_path(&self) -> &LockPath {
        &self.lock
    }

    /// Remove the item from every replica, then release the lock.
    ///
    /// Removal is best-effort; only the lock release can fail the call.
    pub async fn complete(self) -> Result<()> {
        match self.queue.remove(&self.item).await {
            Ok(acknowledged) => debug!(lock = %self.lock, acknowledged, "claimed item removed"),
            Err(e) => warn!(lock = %self.lock, "removing claimed item: {e}"),
        }
        self.queue.inner.release(&self.lock).await
    }

    /// Release the lock and leave the item for a later pop.
    pub async fn abandon(self) -> Result<()> {
        self.queue.inner.release(&self.lock).await
    }
}

impl fmt::Debug for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Claim")
            .field("item", &self.item)
            .field("lock", &self.lock)
            .finish()
    }
}

//! Integration tests for queue operations against in-memory backends.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use quorumq::config::QueueConfig;
use quorumq::coordination::{CoordinationError, Coordinator, NodeMode, SessionEvent, Version};
use quorumq::event::{Event, EventKind};
use quorumq::memory::{MemoryCoordinationService, MemoryCoordinator, MemoryReplica};
use quorumq::model::{Item, LockPath, Operation};
use quorumq::replica::Replica;
use quorumq::session::QueueState;
use quorumq::{Error, Queue};
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt as _};

struct Cluster {
    replicas: Vec<Arc<MemoryReplica>>,
    service: Arc<MemoryCoordinationService>,
    coordinator: Arc<MemoryCoordinator>,
    queue: Queue,
}

fn handles(replicas: &[Arc<MemoryReplica>]) -> Vec<Arc<dyn Replica>> {
    replicas
        .iter()
        .map(|r| Arc::clone(r) as Arc<dyn Replica>)
        .collect()
}

async fn cluster(replicas: usize, write_quorum: usize) -> Cluster {
    let replicas: Vec<Arc<MemoryReplica>> = (0..replicas)
        .map(|i| Arc::new(MemoryReplica::new(format!("r{i}"))))
        .collect();
    let service = MemoryCoordinationService::new();
    let coordinator = Arc::new(service.connect());
    let queue = Queue::new(
        handles(&replicas),
        coordinator.clone(),
        QueueConfig::new("woo").write_quorum(write_quorum),
    )
    .expect("valid queue config");
    assert_eq!(queue.ready().await, QueueState::Ready);

    Cluster {
        replicas,
        service,
        coordinator,
        queue,
    }
}

/// Wait for the next event matching `pred`.
async fn next_event(
    rx: &mut broadcast::Receiver<Event>,
    pred: impl Fn(&EventKind) -> bool,
) -> EventKind {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("diagnostic stream open");
            if pred(&event.kind) {
                return event.kind;
            }
        }
    })
    .await
    .expect("expected diagnostic event")
}

// ---------------------------------------------------------------------------
// Push / size
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_push_pop_complete_drains_queue() {
    let c = cluster(2, 1).await;

    let added = c.queue.push("A").await.unwrap();
    assert!(added >= 1);
    assert_eq!(c.queue.size().await.unwrap(), 1);

    c.queue.push("A").await.unwrap();
    assert_eq!(c.queue.size().await.unwrap(), 1);

    let claim = c.queue.pop().await.unwrap().expect("item available");
    assert_eq!(*claim.item(), "A");
    claim.complete().await.unwrap();

    assert_eq!(c.queue.size().await.unwrap(), 0);
    assert!(c.queue.pop().await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_push_succeeds_without_growing() {
    let c = cluster(3, 2).await;

    assert_eq!(c.queue.push("pew one").await.unwrap(), 3);
    assert_eq!(c.queue.push("pew one").await.unwrap(), 3);
    c.queue.push("pew two").await.unwrap();

    assert_eq!(c.queue.size().await.unwrap(), 2);
}

#[tokio::test]
async fn push_below_quorum_fails_and_keeps_partial_write() {
    let c = cluster(2, 2).await;
    let mut events = c.queue.subscribe();
    c.replicas[1].set_available(false);

    let err = c.queue.push("A").await.unwrap_err();
    assert!(matches!(
        err,
        Error::Quorum {
            operation: Operation::Push,
            required: 2,
            acknowledged: 1
        }
    ));

    // No rollback on the replica that accepted the write.
    assert!(c.replicas[0].members("woo").contains(&Item::from("A")));

    let kind = next_event(&mut events, |k| {
        matches!(k, EventKind::ReplicaError { operation: Some(Operation::Push), .. })
    })
    .await;
    assert!(matches!(kind, EventKind::ReplicaError { replica, .. } if replica == "r1"));
}

#[tokio::test]
async fn push_with_dead_replica_still_reports_the_failure() {
    let c = cluster(2, 1).await;
    let mut events = c.queue.subscribe();
    c.replicas[0].set_available(false);

    assert_eq!(c.queue.push("A").await.unwrap(), 1);
    next_event(&mut events, |k| {
        matches!(k, EventKind::ReplicaError { operation: Some(Operation::Push), .. })
    })
    .await;
}

#[tokio::test]
async fn push_rejects_empty_item() {
    let c = cluster(1, 1).await;
    assert!(matches!(c.queue.push("").await, Err(Error::EmptyItem)));
}

#[tokio::test]
async fn size_falls_through_a_dead_replica_and_reports_it() {
    let c = cluster(2, 1).await;
    let mut events = c.queue.subscribe();
    c.queue.push("A").await.unwrap();
    c.replicas[0].set_available(false);

    // Order is random; enough calls put r0 first at least once.
    for _ in 0..32 {
        assert_eq!(c.queue.size().await.unwrap(), 1);
    }
    let kind = next_event(&mut events, |k| {
        matches!(k, EventKind::ReplicaError { operation: Some(Operation::Size), .. })
    })
    .await;
    assert!(matches!(kind, EventKind::ReplicaError { replica, .. } if replica == "r0"));
}

#[tokio::test]
async fn size_fails_when_no_replica_is_reachable() {
    let c = cluster(2, 1).await;
    for replica in &c.replicas {
        replica.set_available(false);
    }
    assert!(matches!(c.queue.size().await, Err(Error::SizeUnavailable)));
}

// ---------------------------------------------------------------------------
// Pop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pop_on_empty_queue_returns_nothing() {
    let c = cluster(2, 1).await;
    assert!(c.queue.pop().await.unwrap().is_none());
}

#[tokio::test]
async fn pop_fails_when_no_replica_is_reachable() {
    let c = cluster(2, 1).await;
    c.queue.push("A").await.unwrap();
    for replica in &c.replicas {
        replica.set_available(false);
    }
    assert!(matches!(
        c.queue.pop().await,
        Err(Error::NoReplicaAvailable)
    ));
}

#[tokio::test]
async fn pop_falls_through_a_dead_replica() {
    let c = cluster(3, 3).await;
    c.queue.push("A").await.unwrap();
    let mut events = c.queue.subscribe();
    c.replicas[1].set_available(false);

    for _ in 0..32 {
        let claim = c.queue.pop().await.unwrap().expect("live replicas hold A");
        assert_eq!(*claim.item(), "A");
        claim.abandon().await.unwrap();
    }
    let kind = next_event(&mut events, |k| {
        matches!(k, EventKind::ReplicaError { operation: Some(Operation::Pop), .. })
    })
    .await;
    assert!(matches!(kind, EventKind::ReplicaError { replica, .. } if replica == "r1"));
}

#[tokio::test]
async fn pop_skips_empty_replica_and_finds_item_elsewhere() {
    let c = cluster(2, 1).await;
    c.replicas[0].set_available(false);
    c.queue.push("A").await.unwrap();
    c.replicas[0].set_available(true);

    // r0 is empty, r1 holds A; the scan must not stop at r0.
    for _ in 0..10 {
        let claim = c.queue.pop().await.unwrap().expect("r1 holds A");
        claim.abandon().await.unwrap();
    }
}

#[tokio::test]
async fn held_lock_makes_concurrent_pop_come_back_empty() {
    let c = cluster(2, 1).await;
    c.queue.push("A").await.unwrap();

    let first = c.queue.pop_with_tries(5).await.unwrap().expect("A claimed");
    assert_eq!(*first.item(), "A");

    let second = c.queue.pop_with_tries(5).await.unwrap();
    assert!(second.is_none(), "A is locked by the first caller");

    first.complete().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_pops_claim_a_single_item_once() {
    let c = cluster(2, 1).await;
    c.queue.push("only").await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let queue = c.queue.clone();
            tokio::spawn(async move { queue.pop_with_tries(3).await })
        })
        .collect();

    let mut claims = Vec::new();
    for handle in handles {
        if let Some(claim) = handle.await.unwrap().unwrap() {
            claims.push(claim);
        }
    }
    assert_eq!(claims.len(), 1);
}

#[tokio::test]
async fn two_items_two_pops_then_empty() {
    let c = cluster(2, 1).await;
    c.queue.push("pew one").await.unwrap();
    c.queue.push("pew two").await.unwrap();

    let mut claims = Vec::new();
    for _ in 0..2 {
        // Enough tries that a random hit on the locked item is retried.
        claims.push(c.queue.pop_with_tries(50).await.unwrap().expect("item"));
    }
    assert_ne!(claims[0].item(), claims[1].item());

    for _ in 0..3 {
        assert!(c.queue.pop().await.unwrap().is_none());
    }

    for claim in claims {
        claim.complete().await.unwrap();
    }
    assert_eq!(c.queue.size().await.unwrap(), 0);
}

#[tokio::test]
async fn abandoned_item_is_offered_again() {
    let c = cluster(2, 1).await;
    c.queue.push("X").await.unwrap();

    let claim = c.queue.pop().await.unwrap().expect("X");
    claim.abandon().await.unwrap();

    let again = c.queue.pop().await.unwrap().expect("X after abandon");
    assert_eq!(*again.item(), "X");
    assert_eq!(c.queue.size().await.unwrap(), 1);
}

#[tokio::test]
async fn complete_removes_item_from_every_replica_and_releases_lock() {
    let c = cluster(3, 3).await;
    c.queue.push("X").await.unwrap();

    let claim = c.queue.pop().await.unwrap().expect("X");
    let lock = claim.lock_path().clone();
    assert!(c.service.exists(&lock));

    claim.complete().await.unwrap();

    for replica in &c.replicas {
        assert!(replica.members("woo").is_empty());
    }
    assert!(!c.service.exists(&lock));
}

#[tokio::test]
async fn lock_service_failure_is_returned_from_pop() {
    let c = cluster(1, 1).await;
    c.queue.push("A").await.unwrap();
    c.coordinator.set_available(false);

    assert!(matches!(
        c.queue.pop().await,
        Err(Error::Lock(CoordinationError::ConnectionLoss(_)))
    ));
}

#[tokio::test]
async fn claims_are_exclusive_across_queue_instances() {
    let replicas: Vec<Arc<MemoryReplica>> =
        (0..2).map(|i| Arc::new(MemoryReplica::new(format!("r{i}")))).collect();
    let service = MemoryCoordinationService::new();
    let one = Queue::new(
        handles(&replicas),
        Arc::new(service.connect()),
        QueueConfig::new("shared"),
    )
    .unwrap();
    let two = Queue::new(
        handles(&replicas),
        Arc::new(service.connect()),
        QueueConfig::new("shared"),
    )
    .unwrap();
    one.ready().await;
    two.ready().await;

    one.push("job").await.unwrap();
    let claim = one.pop().await.unwrap().expect("job");
    assert!(two.pop_with_tries(5).await.unwrap().is_none());

    claim.abandon().await.unwrap();
    let claim = two.pop().await.unwrap().expect("job after release");
    assert_eq!(*claim.item(), "job");
}

/// Counts lock creation attempts on the way to a memory coordinator.
struct CountingCoordinator {
    inner: MemoryCoordinator,
    creates: AtomicUsize,
}

impl CountingCoordinator {
    fn take_creates(&self) -> usize {
        self.creates.swap(0, Ordering::SeqCst)
    }
}

#[async_trait]
impl Coordinator for CountingCoordinator {
    async fn start_session(&self) -> Result<(), CoordinationError> {
        self.inner.start_session().await
    }

    fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.subscribe_session()
    }

    async fn create_node(&self, path: &LockPath, mode: NodeMode) -> Result<(), CoordinationError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create_node(path, mode).await
    }

    async fn delete_node(&self, path: &LockPath, version: Version) -> Result<(), CoordinationError> {
        self.inner.delete_node(path, version).await
    }

    async fn close(&self) -> Result<(), CoordinationError> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn pop_rescans_at_most_tries_times_on_conflict() {
    let replicas = vec![Arc::new(MemoryReplica::new("r0"))];
    let service = MemoryCoordinationService::new();
    let coordinator = Arc::new(CountingCoordinator {
        inner: service.connect(),
        creates: AtomicUsize::new(0),
    });
    let queue = Queue::new(handles(&replicas), coordinator.clone(), QueueConfig::new("woo"))
        .unwrap();
    assert_eq!(queue.ready().await, QueueState::Ready);
    queue.push("A").await.unwrap();

    let held = queue.pop().await.unwrap().expect("A claimed");
    assert_eq!(coordinator.take_creates(), 1);

    assert!(queue.pop_with_tries(3).await.unwrap().is_none());
    assert_eq!(coordinator.take_creates(), 3);

    // Zero tries still makes one attempt.
    assert!(queue.pop_with_tries(0).await.unwrap().is_none());
    assert_eq!(coordinator.take_creates(), 1);

    // The configured default is a single attempt.
    assert!(queue.pop().await.unwrap().is_none());
    assert_eq!(coordinator.take_creates(), 1);

    held.abandon().await.unwrap();
    let again = queue.pop_with_tries(3).await.unwrap().expect("A released");
    assert_eq!(coordinator.take_creates(), 1);
    again.complete().await.unwrap();
}

// ---------------------------------------------------------------------------
// Remove / unlock / clear
// ---------------------------------------------------------------------------

#[tokio::test]
async fn remove_is_best_effort() {
    let c = cluster(2, 1).await;
    c.queue.push("A").await.unwrap();
    let mut events = c.queue.subscribe();
    c.replicas[0].set_available(false);

    assert_eq!(c.queue.remove("A").await.unwrap(), 1);
    assert!(c.replicas[1].members("woo").is_empty());

    let kind = next_event(&mut events, |k| {
        matches!(k, EventKind::ReplicaError { operation: Some(Operation::Remove), .. })
    })
    .await;
    assert!(matches!(kind, EventKind::ReplicaError { replica, .. } if replica == "r0"));
}

#[tokio::test]
async fn unlock_of_unheld_lock_succeeds_and_is_reported() {
    let c = cluster(1, 1).await;
    let mut events = c.queue.subscribe();

    c.queue.unlock("never-locked").await.unwrap();
    c.queue.unlock("never-locked").await.unwrap();

    next_event(&mut events, |k| matches!(k, EventKind::LockReleaseError { .. })).await;
}

/// Collects the `queue.operation` field of every operation span.
#[derive(Clone, Default)]
struct OperationSpans(Arc<Mutex<Vec<String>>>);

struct OperationField(Option<String>);

impl Visit for OperationField {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "queue.operation" {
            self.0 = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, _field: &Field, _value: &dyn fmt::Debug) {}
}

impl<S: tracing::Subscriber> Layer<S> for OperationSpans {
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
        if attrs.metadata().name() != "queue.operation" {
            return;
        }
        let mut field = OperationField(None);
        attrs.record(&mut field);
        if let Some(operation) = field.0 {
            self.0.lock().unwrap().push(operation);
        }
    }
}

#[tokio::test]
async fn unlock_runs_in_an_operation_span() {
    let spans = OperationSpans::default();
    let _default =
        tracing::subscriber::set_default(tracing_subscriber::registry().with(spans.clone()));

    let c = cluster(1, 1).await;
    c.queue.unlock("A").await.unwrap();

    assert!(spans.0.lock().unwrap().iter().any(|op| op == "unlock"));
}

#[tokio::test]
async fn clear_then_size_is_zero() {
    let c = cluster(2, 2).await;
    c.queue.push("A").await.unwrap();
    c.queue.push("B").await.unwrap();

    assert_eq!(c.queue.clear().await.unwrap(), 2);
    assert_eq!(c.queue.size().await.unwrap(), 0);
}

#[tokio::test]
async fn clear_requires_quorum() {
    let c = cluster(2, 2).await;
    c.replicas[0].set_available(false);
    assert!(matches!(
        c.queue.clear().await,
        Err(Error::Quorum {
            operation: Operation::Clear,
            acknowledged: 1,
            ..
        })
    ));
}

#[tokio::test]
async fn clear_leaves_locks_in_place() {
    let c = cluster(1, 1).await;
    c.queue.push("A").await.unwrap();
    let claim = c.queue.pop().await.unwrap().expect("A");

    c.queue.clear().await.unwrap();
    assert!(c.service.exists(claim.lock_path()));
    claim.abandon().await.unwrap();
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

#[tokio::test]
async fn construction_validates_replicas_and_quorum() {
    let service = MemoryCoordinationService::new();

    let none = Queue::new(Vec::new(), Arc::new(service.connect()), QueueConfig::new("q"));
    assert!(matches!(none, Err(Error::Config(_))));

    let replicas = vec![Arc::new(MemoryReplica::new("r0"))];
    let too_many = Queue::new(
        handles(&replicas),
        Arc::new(service.connect()),
        QueueConfig::new("q").write_quorum(2),
    );
    assert!(matches!(too_many, Err(Error::Config(_))));

    let zero = Queue::new(
        handles(&replicas),
        Arc::new(service.connect()),
        QueueConfig::new("q").write_quorum(0),
    );
    assert!(matches!(zero, Err(Error::Config(_))));
}

//! Metric instrument factories for quorumq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without one, every instrument is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("quorumq")
}

/// Counter: queue operations.
/// Labels: `queue`, `operation`, `result` ("ok" | "empty" | "error").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("quorumq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: failed calls against a single replica.
/// Labels: `replica`, `operation`.
pub fn replica_errors() -> Counter<u64> {
    meter()
        .u64_counter("quorumq.replica.errors")
        .with_description("Number of failed replica calls")
        .build()
}

/// Counter: pop attempts that found the item already locked.
/// Labels: `queue`.
pub fn lock_conflicts() -> Counter<u64> {
    meter()
        .u64_counter("quorumq.lock.conflicts")
        .with_description("Number of lock conflicts during pop")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("quorumq.operation.duration_ms")
        .with_description("Queue operation duration in milliseconds")
        .with_unit("ms")
        .build()
}

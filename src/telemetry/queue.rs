//! Span helpers for queue operations and lifecycle transitions.

use tracing::Span;

use crate::model::Operation;
use crate::session::QueueState;

/// Start a span for one queue operation.
///
/// `queue.acknowledged` is declared empty and filled in by
/// [`record_acknowledged`] for fan-out operations.
pub fn start_operation_span(queue: &str, operation: Operation) -> Span {
    tracing::info_span!(
        "queue.operation",
        "queue.key" = queue,
        "queue.operation" = operation.as_str(),
        "queue.acknowledged" = tracing::field::Empty,
    )
}

/// Record how many replicas acknowledged a fan-out on its span.
pub fn record_acknowledged(span: &Span, acknowledged: usize) {
    span.record("queue.acknowledged", acknowledged);
}

/// Emit a lifecycle transition event.
pub fn record_state_transition(from: QueueState, to: QueueState) {
    tracing::info!(from = from.as_str(), to = to.as_str(), "state_transition");
}

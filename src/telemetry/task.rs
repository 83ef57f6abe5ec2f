//! Task execution span helpers.

use tracing::Span;

use crate::model::TaskId;

/// Start a span for one attempt of a task.
///
/// The `task.state` field is declared empty and updated via
/// [`record_state_transition`].
pub fn start_task_span(task_name: &str, task_id: &TaskId, attempt: u32) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.name" = task_name,
        "task.id" = %task_id,
        "task.attempt" = attempt,
        "task.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the span and emit it as an event.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("task.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}

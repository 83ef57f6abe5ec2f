//! Metric instrument factories for taskwire.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"taskwire"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("taskwire")
}

/// Counter: tasks handed to the broker by producers and the scheduler.
/// Labels: `task`, `result` ("ok" | "error").
pub fn tasks_submitted() -> Counter<u64> {
    meter()
        .u64_counter("taskwire.tasks.submitted")
        .with_description("Number of task invocations submitted")
        .build()
}

/// Counter: per-attempt state transitions inside workers.
/// Labels: `task`, `from`, `to`.
pub fn task_transitions() -> Counter<u64> {
    meter()
        .u64_counter("taskwire.tasks.transitions")
        .with_description("Number of task state transitions")
        .build()
}

/// Counter: broker operations (send, read, delete, set_vt, requeue, archive).
/// Labels: `backend`, `queue`, `operation`.
pub fn broker_operations() -> Counter<u64> {
    meter()
        .u64_counter("taskwire.broker.operations")
        .with_description("Number of broker operations")
        .build()
}

/// Histogram: handler execution time in milliseconds.
/// Labels: `task`, `outcome`.
pub fn handler_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("taskwire.handler.duration_ms")
        .with_description("Task handler duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: messages moved to the dead-letter archive.
/// Labels: `reason` (undecodable messages have no task name).
pub fn dead_letters() -> Counter<u64> {
    meter()
        .u64_counter("taskwire.tasks.dead_letters")
        .with_description("Tasks dead-lettered for operator inspection")
        .build()
}

/// Counter: scheduler fires.
/// Labels: `entry`, `result` ("ok" | "deferred" | "disabled").
pub fn schedule_fires() -> Counter<u64> {
    meter()
        .u64_counter("taskwire.scheduler.fires")
        .with_description("Schedule entry evaluations that attempted an enqueue")
        .build()
}

/// Counter: events relayed by the monitor to its sink.
/// Labels: `type`.
pub fn events_forwarded() -> Counter<u64> {
    meter()
        .u64_counter("taskwire.monitor.events_forwarded")
        .with_description("Lifecycle events forwarded to the notification sink")
        .build()
}

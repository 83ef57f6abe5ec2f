//! Worker execution engine.
//!
//! A worker pops envelopes from one queue, runs the registered handler
//! under a timeout, and settles the attempt: ack on success, requeue with
//! backoff on a recoverable failure, dead-letter on a terminal one. Every
//! transition is published as a lifecycle event.

pub mod builtin;
pub mod engine;
pub mod registry;
pub mod transition;

pub use builtin::register_builtins;
pub use engine::{Worker, WorkerConfig};
pub use registry::{
    FnHandler, Handler, HandlerResult, RegisteredTask, Registry, TaskContext, TaskOptions,
    handler_fn,
};
pub use transition::{AttemptOutcome, FailReason, TaskState, Transition, decide};

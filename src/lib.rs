//! # taskwire
//!
//! A distributed task queue over Postgres + pgmq.
//!
//! Producers enqueue task envelopes; workers pop them with a visibility
//! lease, run registered handlers under a bounded pool of slots and settle
//! each attempt (ack, retry with backoff, or dead-letter). A periodic
//! scheduler enqueues recurring tasks through the same path, and a monitor
//! relays the workers' lifecycle events, in order, to operators.

pub mod backoff;
pub mod broker;
pub mod codec;
pub mod config;
pub mod error;
pub mod model;
pub mod monitor;
pub mod producer;
pub mod scheduler;
pub mod telemetry;
pub mod worker;

pub use error::{Error, HandlerError, Result};
pub use producer::Producer;

//! Core data model: envelopes, lifecycle events, schedule entries.

pub mod envelope;
pub mod event;
pub mod schedule;

pub use envelope::{DEFAULT_QUEUE, NewTask, TaskEnvelope, TaskId};
pub use event::{
    EVENTS_TOPIC, EventRecord, EventType, HEARTBEAT_TOPIC, Heartbeat, MAX_EVENT_BYTES,
};
pub use schedule::{ScheduleDefinition, ScheduleEntry, ScheduleFile};

//! Lifecycle events published by workers and relayed by the monitor.
//!
//! Events are the engine's voice. Per task, the order is
//! `started -> (retried -> started)* -> (succeeded | failed)`; every event
//! carries a sequence number derived from the attempt so consumers can
//! restore that order when the transport reorders.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::envelope::TaskId;

/// Pub/sub topic carrying [`EventRecord`]s.
pub const EVENTS_TOPIC: &str = "taskwire_events";

/// Pub/sub topic carrying [`Heartbeat`]s.
pub const HEARTBEAT_TOPIC: &str = "taskwire_heartbeats";

/// Largest encoded event a worker publishes. Stays under the 8000 byte
/// NOTIFY payload limit with room for the channel name.
pub const MAX_EVENT_BYTES: usize = 7 * 1024;

/// Characters kept from an oversized payload field.
const PREVIEW_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Started,
    Succeeded,
    Failed,
    Retried,
}

impl EventType {
    /// Does this event end the task's lifecycle?
    pub fn is_terminal(self) -> bool {
        matches!(self, EventType::Succeeded | EventType::Failed)
    }

    /// Position of this event within the task's lifecycle.
    ///
    /// Attempt `n` contributes `started = 2n` and its outcome `2n + 1`, so
    /// the sequence is stable no matter which worker ran the attempt.
    pub fn sequence(self, attempt: u32) -> u64 {
        let base = u64::from(attempt) * 2;
        match self {
            EventType::Started => base,
            _ => base + 1,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::Started => "started",
            EventType::Succeeded => "succeeded",
            EventType::Failed => "failed",
            EventType::Retried => "retried",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    /// Accepts canonical names and the common broker-native spellings
    /// (`task-started`, `SUCCESS`, `FAILURE`, `RETRY`).
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let bare = lowered
            .strip_prefix("task-")
            .or_else(|| lowered.strip_prefix("task_"))
            .unwrap_or(&lowered);
        match bare {
            "started" | "start" => Ok(EventType::Started),
            "succeeded" | "success" | "completed" => Ok(EventType::Succeeded),
            "failed" | "failure" | "dead" => Ok(EventType::Failed),
            "retried" | "retry" => Ok(EventType::Retried),
            _ => Err(format!("unknown event type: {s}")),
        }
    }
}

/// A normalized, immutable lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub task_id: TaskId,

    #[serde(rename = "type")]
    pub event_type: EventType,

    pub timestamp: DateTime<Utc>,

    /// Result on success, error summary on failure or retry.
    #[serde(default)]
    pub payload: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl EventRecord {
    /// Build an event for a given attempt of a task, stamping its sequence.
    pub fn for_attempt(
        task_id: TaskId,
        task_name: &str,
        event_type: EventType,
        attempt: u32,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            task_id,
            event_type,
            timestamp: Utc::now(),
            payload,
            task_name: Some(task_name.to_string()),
            worker_id: None,
            seq: Some(event_type.sequence(attempt)),
        }
    }

    pub fn from_worker(mut self, worker_id: &str) -> Self {
        self.worker_id = Some(worker_id.to_string());
        self
    }

    /// Drop the sequence number so consumers release the event on arrival.
    pub fn unsequenced(mut self) -> Self {
        self.seq = None;
        self
    }

    /// Encode the record in at most `max_bytes`.
    ///
    /// An oversized payload is cut down to previews of its large fields and
    /// marked `"truncated": true`; if that still does not fit, only the
    /// marker is kept.
    pub fn encode_bounded(&self, max_bytes: usize) -> serde_json::Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() <= max_bytes {
            return Ok(bytes);
        }

        let mut shrunk = self.clone();
        shrunk.payload = summarize(&self.payload);
        let summary = serde_json::to_vec(&shrunk)?;
        if summary.len() <= max_bytes {
            return Ok(summary);
        }

        shrunk.payload = serde_json::json!({ "truncated": true });
        serde_json::to_vec(&shrunk)
    }
}

/// Previews of every large field of `payload`, flagged as truncated.
fn summarize(payload: &serde_json::Value) -> serde_json::Value {
    use serde_json::{Map, Value};

    let mut out = Map::new();
    match payload {
        Value::Object(fields) => {
            for (key, value) in fields {
                let small = match value {
                    Value::String(s) => s.chars().count() <= PREVIEW_CHARS,
                    Value::Array(_) | Value::Object(_) => {
                        value.to_string().chars().count() <= PREVIEW_CHARS
                    }
                    _ => true,
                };
                let kept = if small {
                    value.clone()
                } else {
                    Value::String(preview(value))
                };
                out.insert(key.clone(), kept);
            }
        }
        other => {
            out.insert("preview".to_string(), Value::String(preview(other)));
        }
    }
    out.insert("truncated".to_string(), Value::Bool(true));
    Value::Object(out)
}

fn preview(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.chars().take(PREVIEW_CHARS).collect(),
        other => other.to_string().chars().take(PREVIEW_CHARS).collect(),
    }
}

/// Periodic liveness signal from a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: String,
    pub queue: String,
    pub timestamp: DateTime<Utc>,
    pub in_flight: usize,
    pub concurrency: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_follows_lifecycle_order() {
        let order = [
            EventType::Started.sequence(0),
            EventType::Retried.sequence(0),
            EventType::Started.sequence(1),
            EventType::Retried.sequence(1),
            EventType::Started.sequence(2),
            EventType::Succeeded.sequence(2),
        ];
        assert!(order.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn oversized_failure_keeps_error_preview_and_small_fields() {
        let payload = serde_json::json!({
            "error": "x".repeat(20_000),
            "reason": "fatal",
            "attempts": 1,
        });
        let record = EventRecord::for_attempt(TaskId::new(), "t", EventType::Failed, 0, payload);

        let bytes = record.encode_bounded(MAX_EVENT_BYTES).unwrap();
        assert!(bytes.len() <= MAX_EVENT_BYTES);
        let back: EventRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.event_type, EventType::Failed);
        assert_eq!(back.seq, Some(1));
        assert_eq!(back.payload["truncated"], true);
        assert_eq!(back.payload["reason"], "fatal");
        assert_eq!(back.payload["attempts"], 1);
        assert_eq!(back.payload["error"].as_str().unwrap().len(), PREVIEW_CHARS);
    }

    #[test]
    fn small_events_are_untouched() {
        let record = EventRecord::for_attempt(
            TaskId::new(),
            "t",
            EventType::Succeeded,
            0,
            serde_json::json!({"ok": true}),
        );
        let bytes = record.encode_bounded(MAX_EVENT_BYTES).unwrap();
        assert_eq!(bytes, serde_json::to_vec(&record).unwrap());
    }

    #[test]
    fn many_large_fields_collapse_to_the_marker() {
        let mut fields = serde_json::Map::new();
        for i in 0..64 {
            fields.insert(format!("f{i}"), serde_json::Value::String("y".repeat(1000)));
        }
        let record = EventRecord::for_attempt(
            TaskId::new(),
            "t",
            EventType::Succeeded,
            0,
            serde_json::Value::Object(fields),
        );
        let bytes = record.encode_bounded(MAX_EVENT_BYTES).unwrap();
        let back: EventRecord = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.payload, serde_json::json!({"truncated": true}));
    }

    #[test]
    fn parses_native_type_names() {
        assert_eq!("task-started".parse(), Ok(EventType::Started));
        assert_eq!("SUCCESS".parse(), Ok(EventType::Succeeded));
        assert_eq!("task_failed".parse(), Ok(EventType::Failed));
        assert_eq!("RETRY".parse(), Ok(EventType::Retried));
        assert!("task-received".parse::<EventType>().is_err());
    }
}

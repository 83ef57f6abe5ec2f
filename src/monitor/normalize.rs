//! Turn raw lifecycle messages into [`EventRecord`]s.
//!
//! Workers publish canonical records, but the monitor also accepts the
//! field and type spellings common to other task-queue event streams
//! (`uuid`, `state`, `task-succeeded`, unix timestamps, ...).

use crate::error::{Error, Result};
use crate::model::{EventRecord, EventType, TaskId};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use tracing::debug;

fn first<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k).filter(|v| !v.is_null()))
}

fn timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => {
            let secs = n.as_f64()?;
            let whole = secs.floor();
            let nanos = ((secs - whole) * 1e9).round() as u32;
            Utc.timestamp_opt(whole as i64, nanos.min(999_999_999)).single()
        }
        _ => None,
    }
}

/// Normalize one raw message.
///
/// Returns `Ok(None)` for well-formed messages of an event type the monitor
/// does not track, and an error for anything that is not an event at all.
pub fn normalize(raw: &[u8]) -> Result<Option<EventRecord>> {
    let value: Value = serde_json::from_slice(raw)?;
    let Value::Object(obj) = value else {
        return Err(Error::Codec("event is not a JSON object".to_string()));
    };

    let kind = first(&obj, &["type", "event", "state", "kind"])
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Codec("event has no type".to_string()))?;
    let event_type = match kind.parse::<EventType>() {
        Ok(t) => t,
        Err(e) => {
            debug!("skipping event: {e}");
            return Ok(None);
        }
    };

    let task_id = first(&obj, &["task_id", "uuid", "id"])
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Codec("event has no task id".to_string()))?
        .parse::<TaskId>()
        .map_err(|e| Error::Codec(format!("bad task id: {e}")))?;

    let timestamp = match first(&obj, &["timestamp", "ts", "time"]) {
        Some(v) => timestamp(v).ok_or_else(|| Error::Codec(format!("bad timestamp: {v}")))?,
        None => Utc::now(),
    };

    let payload = first(&obj, &["payload", "result", "exception", "error"])
        .cloned()
        .unwrap_or(Value::Null);

    let text = |keys: &[&str]| first(&obj, keys).and_then(Value::as_str).map(str::to_string);

    Ok(Some(EventRecord {
        task_id,
        event_type,
        timestamp,
        payload,
        task_name: text(&["task_name", "name"]),
        worker_id: text(&["worker_id", "hostname", "worker"]),
        seq: first(&obj, &["seq", "sequence", "clock"]).and_then(Value::as_u64),
    }))
}

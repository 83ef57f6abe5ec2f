//! Schedule entries for periodic tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::envelope::{DEFAULT_QUEUE, NewTask};

/// One row of the schedule table.
///
/// `cadence` is kept in its textual form and parsed on every tick, so a
/// corrupted row is detected (and disabled) without poisoning the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Unique key of the entry.
    pub name: String,
    pub task_name: String,
    pub cadence: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default)]
    pub max_retries: Option<u32>,
    pub next_due: DateTime<Utc>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Why the scheduler disabled this entry, if it did.
    #[serde(default)]
    pub flagged: Option<String>,
}

impl ScheduleEntry {
    /// A new entry, due immediately.
    pub fn new(
        name: impl Into<String>,
        task_name: impl Into<String>,
        cadence: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            task_name: task_name.into(),
            cadence: cadence.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            queue: default_queue(),
            max_retries: None,
            next_due: now,
            last_run: None,
            enabled: true,
            flagged: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && now >= self.next_due
    }

    /// A fresh invocation for this entry. No relation to previous runs.
    pub fn to_task(&self) -> NewTask {
        let mut task = NewTask::new(&self.task_name)
            .args(self.args.clone())
            .kwargs(self.kwargs.clone())
            .queue(&self.queue);
        if let Some(n) = self.max_retries {
            task = task.max_retries(n);
        }
        task
    }
}

/// Top-level TOML wrapper for schedule files.
#[derive(Debug, Deserialize)]
pub struct ScheduleFile {
    #[serde(default)]
    pub schedule: Vec<ScheduleDefinition>,
}

/// An entry as written by operators, before it has any runtime state.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleDefinition {
    pub name: String,
    pub task: String,
    pub cadence: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ScheduleDefinition {
    pub fn into_entry(self, now: DateTime<Utc>) -> ScheduleEntry {
        ScheduleEntry {
            args: self.args,
            kwargs: self.kwargs,
            queue: self.queue,
            max_retries: self.max_retries,
            enabled: self.enabled,
            ..ScheduleEntry::new(self.name, self.task, self.cadence, now)
        }
    }
}

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

fn default_enabled() -> bool {
    true
}

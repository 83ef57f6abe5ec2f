//! Task envelope: one invocation of a registered task.
//!
//! The envelope's id is assigned once at submit time and survives retries;
//! only `retries` changes between attempts.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const DEFAULT_QUEUE: &str = "default";

// ---------------------------------------------------------------------------
// Task Id
// ---------------------------------------------------------------------------

/// Newtype for task invocation IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(TaskId)
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A serialized unit of work with identity and retry metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    /// Stable across retries of the same logical invocation.
    pub id: TaskId,

    /// Selects the registered handler.
    pub name: String,

    #[serde(default)]
    pub args: Vec<Value>,

    #[serde(default)]
    pub kwargs: Map<String, Value>,

    /// Earliest execution time. None means "as soon as possible".
    #[serde(default)]
    pub eta: Option<DateTime<Utc>>,

    /// Attempts that have already failed recoverably.
    #[serde(default)]
    pub retries: u32,

    /// Retry bound for this invocation. None defers to the handler's
    /// registered bound.
    #[serde(default)]
    pub max_retries: Option<u32>,

    pub created_at: DateTime<Utc>,
}

impl TaskEnvelope {
    /// True while the envelope's eta lies in the future.
    pub fn is_early(&self, now: DateTime<Utc>) -> bool {
        self.eta.is_some_and(|eta| eta > now)
    }

    /// Time left until the eta, zero if none or already passed.
    pub fn remaining_delay(&self, now: DateTime<Utc>) -> std::time::Duration {
        self.eta
            .map(|eta| eta - now)
            .and_then(|d| d.to_std().ok())
            .unwrap_or_default()
    }

    /// The next attempt of this invocation: same id, one more retry.
    pub fn next_attempt(&self) -> Self {
        Self {
            retries: self.retries + 1,
            eta: None,
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new task invocations. The producer's public API for submitting work.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub(crate) name: String,
    pub(crate) args: Vec<Value>,
    pub(crate) kwargs: Map<String, Value>,
    pub(crate) eta: Option<DateTime<Utc>>,
    pub(crate) max_retries: Option<u32>,
    pub(crate) queue: Option<String>,
}

impl NewTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            eta: None,
            max_retries: None,
            queue: None,
        }
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    /// Run no earlier than `delay` from now.
    pub fn countdown(mut self, delay: std::time::Duration) -> Self {
        self.eta = Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Stamp a fresh identity onto this invocation.
    pub fn into_envelope(self) -> TaskEnvelope {
        TaskEnvelope {
            id: TaskId::new(),
            name: self.name,
            args: self.args,
            kwargs: self.kwargs,
            eta: self.eta,
            retries: 0,
            max_retries: self.max_retries,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn next_attempt_keeps_identity() {
        let env = NewTask::new("send_email").arg("a@b.c").into_envelope();
        let next = env.next_attempt();
        assert_eq!(next.id, env.id);
        assert_eq!(next.retries, 1);
        assert_eq!(next.args, vec![json!("a@b.c")]);
    }

    #[test]
    fn eta_in_future_is_early() {
        let now = Utc::now();
        let env = NewTask::new("t")
            .eta(now + Duration::seconds(30))
            .into_envelope();
        assert!(env.is_early(now));
        assert!(env.remaining_delay(now) >= std::time::Duration::from_secs(29));
        assert!(!env.is_early(now + Duration::seconds(31)));
    }
}

//! Per-attempt state machine.
//!
//! `Dequeued -> Running -> {Succeeded, Failed, Retrying}`. The decision of
//! where a finished attempt goes is a pure function of its outcome and the
//! envelope's retry bookkeeping; the engine only carries it out.

use crate::backoff::Backoff;
use crate::error::HandlerError;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Dequeued,
    Running,
    Succeeded,
    Failed,
    Retrying,
}

impl TaskState {
    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Dequeued, Running)
                | (Dequeued, Failed)    // unknown task, dead-lettered before running
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Retrying)
                | (Retrying, Dequeued)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Dequeued => "dequeued",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Retrying => "retrying",
        };
        write!(f, "{s}")
    }
}

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Returned(Value),
    Raised(HandlerError),
    TimedOut(Duration),
    Panicked(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    Fatal,
    RetriesExhausted,
    TimedOut,
    Panicked,
}

impl std::fmt::Display for FailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailReason::Fatal => "fatal",
            FailReason::RetriesExhausted => "retries_exhausted",
            FailReason::TimedOut => "timed_out",
            FailReason::Panicked => "panicked",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Succeed {
        result: Value,
    },
    Retry {
        error: String,
        delay: Duration,
        next_retries: u32,
    },
    Fail {
        error: String,
        reason: FailReason,
    },
}

impl Transition {
    pub fn target(&self) -> TaskState {
        match self {
            Transition::Succeed { .. } => TaskState::Succeeded,
            Transition::Retry { .. } => TaskState::Retrying,
            Transition::Fail { .. } => TaskState::Failed,
        }
    }
}

/// Decide where a finished attempt goes.
///
/// `retries` is the number of attempts that already failed recoverably, so
/// a task with `max_retries = n` runs at most `n + 1` times.
pub fn decide(outcome: AttemptOutcome, retries: u32, max_retries: u32, backoff: &Backoff) -> Transition {
    match outcome {
        AttemptOutcome::Returned(result) => Transition::Succeed { result },
        AttemptOutcome::Raised(HandlerError::Recoverable(error)) if retries < max_retries => {
            Transition::Retry {
                error,
                delay: backoff.delay(retries),
                next_retries: retries + 1,
            }
        }
        AttemptOutcome::Raised(HandlerError::Recoverable(error)) => Transition::Fail {
            error,
            reason: FailReason::RetriesExhausted,
        },
        AttemptOutcome::Raised(HandlerError::Fatal(error)) => Transition::Fail {
            error,
            reason: FailReason::Fatal,
        },
        AttemptOutcome::TimedOut(limit) => Transition::Fail {
            error: format!("handler timed out after {limit:?}"),
            reason: FailReason::TimedOut,
        },
        AttemptOutcome::Panicked(error) => Transition::Fail {
            error,
            reason: FailReason::Panicked,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_secs(1), Duration::from_secs(10))
    }

    #[test]
    fn success_is_terminal() {
        let t = decide(AttemptOutcome::Returned(json!(1)), 0, 3, &backoff());
        assert_eq!(t, Transition::Succeed { result: json!(1) });
        assert!(t.target().is_terminal());
    }

    #[test]
    fn recoverable_error_retries_until_bound() {
        let b = backoff();
        let mut retries = 0;
        let mut attempts = 0;
        loop {
            attempts += 1;
            match decide(
                AttemptOutcome::Raised(HandlerError::recoverable("flaky")),
                retries,
                2,
                &b,
            ) {
                Transition::Retry {
                    next_retries,
                    delay,
                    ..
                } => {
                    assert_eq!(delay, b.delay(retries));
                    retries = next_retries;
                }
                Transition::Fail { reason, .. } => {
                    assert_eq!(reason, FailReason::RetriesExhausted);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(attempts, 3);
    }

    #[test]
    fn fatal_error_skips_retries() {
        let t = decide(
            AttemptOutcome::Raised(HandlerError::fatal("bad input")),
            0,
            5,
            &backoff(),
        );
        assert!(matches!(
            t,
            Transition::Fail {
                reason: FailReason::Fatal,
                ..
            }
        ));
    }

    #[test]
    fn timeout_fails_even_with_retries_left() {
        let t = decide(
            AttemptOutcome::TimedOut(Duration::from_secs(2)),
            0,
            5,
            &backoff(),
        );
        assert_eq!(t.target(), TaskState::Failed);
    }

    #[test]
    fn lifecycle_edges() {
        use TaskState::*;
        assert!(Dequeued.can_transition_to(Running));
        assert!(Running.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Dequeued));
        assert!(!Succeeded.can_transition_to(Running));
        assert!(!Dequeued.can_transition_to(Succeeded));
    }
}

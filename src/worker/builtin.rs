//! Handlers shipped with the `taskwire worker` binary, useful for smoke
//! testing a deployment end to end.

use super::registry::{HandlerResult, Registry, TaskContext, handler_fn};
use crate::error::HandlerError;
use serde_json::{Value, json};
use std::time::Duration;

/// `echo`: returns its arguments.
async fn echo(ctx: TaskContext) -> HandlerResult {
    Ok(json!({ "args": ctx.args, "kwargs": ctx.kwargs }))
}

/// `sleep`: waits `seconds` (kwarg or first positional arg).
async fn sleep(ctx: TaskContext) -> HandlerResult {
    let seconds = ctx
        .kwargs
        .get("seconds")
        .or_else(|| ctx.args.first())
        .and_then(Value::as_f64)
        .ok_or_else(|| HandlerError::fatal("sleep needs a numeric `seconds` argument"))?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(HandlerError::fatal(format!("invalid sleep duration: {seconds}")));
    }
    tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
    Ok(json!({ "slept": seconds }))
}

/// `fail`: fails recoverably, or fatally with `fatal = true`. Succeeds once
/// `succeed_on` (an attempt number) is reached.
async fn fail(ctx: TaskContext) -> HandlerResult {
    let succeed_on = ctx.kwargs.get("succeed_on").and_then(Value::as_u64);
    if succeed_on.is_some_and(|n| u64::from(ctx.attempt) >= n) {
        return Ok(json!({ "attempt": ctx.attempt }));
    }
    let msg = format!("requested failure on attempt {}", ctx.attempt);
    match ctx.kwargs.get("fatal").and_then(Value::as_bool) {
        Some(true) => Err(HandlerError::fatal(msg)),
        _ => Err(HandlerError::recoverable(msg)),
    }
}

pub fn register_builtins(registry: &mut Registry) {
    registry
        .register("echo", handler_fn(echo), 0, Duration::from_secs(30))
        .register("sleep", handler_fn(sleep), 0, Duration::from_secs(3600))
        .register("fail", handler_fn(fail), 3, Duration::from_secs(30));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskId;
    use serde_json::Map;

    fn ctx(attempt: u32, kwargs: Value) -> TaskContext {
        TaskContext {
            task_id: TaskId::new(),
            task_name: "fail".into(),
            args: vec![],
            kwargs: kwargs.as_object().cloned().unwrap_or_else(Map::new),
            attempt,
            worker_id: "w".into(),
        }
    }

    #[tokio::test]
    async fn fail_switches_to_success() {
        let kwargs = json!({ "succeed_on": 2 });
        assert!(fail(ctx(0, kwargs.clone())).await.unwrap_err().is_recoverable());
        assert!(fail(ctx(2, kwargs)).await.is_ok());
        assert!(!fail(ctx(0, json!({ "fatal": true }))).await.unwrap_err().is_recoverable());
    }

    #[tokio::test]
    async fn sleep_rejects_missing_duration() {
        let err = sleep(ctx(0, json!({}))).await.unwrap_err();
        assert!(!err.is_recoverable());
    }

    #[test]
    fn builtins_register() {
        let mut registry = Registry::new();
        register_builtins(&mut registry);
        assert_eq!(registry.len(), 3);
    }
}

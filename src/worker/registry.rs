//! Task handler registration.
//!
//! Task authors register a handler per task name before the worker starts;
//! envelopes are resolved against this table at decode time.

use crate::codec::TaskCatalog;
use crate::error::HandlerError;
use crate::model::TaskId;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub type HandlerResult = std::result::Result<Value, HandlerError>;

/// What a handler sees of the invocation.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub task_name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    /// 0 on the first attempt.
    pub attempt: u32,
    pub worker_id: String,
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: TaskContext) -> HandlerResult;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn call(&self, ctx: TaskContext) -> HandlerResult {
        (self.0)(ctx).await
    }
}

/// Per-task execution options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOptions {
    /// Retry bound used when the envelope carries none.
    pub max_retries: u32,
    /// An attempt running longer than this fails terminally.
    pub timeout: Duration,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(300),
        }
    }
}

impl TaskOptions {
    pub fn new(max_retries: u32, timeout: Duration) -> Self {
        Self {
            max_retries,
            timeout,
        }
    }
}

#[derive(Clone)]
pub struct RegisteredTask {
    pub handler: Arc<dyn Handler>,
    pub options: TaskOptions,
}

/// Registry of handlers, indexed by task name.
#[derive(Clone, Default)]
pub struct Registry {
    tasks: HashMap<String, RegisteredTask>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `task_name`.
    pub fn register<H: Handler + 'static>(
        &mut self,
        task_name: impl Into<String>,
        handler: H,
        max_retries: u32,
        timeout: Duration,
    ) -> &mut Self {
        self.tasks.insert(
            task_name.into(),
            RegisteredTask {
                handler: Arc::new(handler),
                options: TaskOptions::new(max_retries, timeout),
            },
        );
        self
    }

    pub fn get(&self, task_name: &str) -> Option<&RegisteredTask> {
        self.tasks.get(task_name)
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl TaskCatalog for Registry {
    fn contains(&self, task_name: &str) -> bool {
        self.tasks.contains_key(task_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn closures_register_as_handlers() {
        let mut registry = Registry::new();
        registry.register(
            "add",
            handler_fn(|ctx: TaskContext| async move {
                let sum: i64 = ctx.args.iter().filter_map(Value::as_i64).sum();
                Ok(json!(sum))
            }),
            0,
            Duration::from_secs(1),
        );

        assert!(registry.contains("add"));
        assert!(!registry.contains("sub"));

        let task = registry.get("add").unwrap();
        let ctx = TaskContext {
            task_id: TaskId::new(),
            task_name: "add".into(),
            args: vec![json!(2), json!(3)],
            kwargs: Map::new(),
            attempt: 0,
            worker_id: "w".into(),
        };
        assert_eq!(task.handler.call(ctx).await, Ok(json!(5)));
    }
}

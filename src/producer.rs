//! Enqueue interface used by API processes and the scheduler.

use crate::broker::{Broker, RetryPolicy, retry_connectivity};
use crate::codec;
use crate::error::Result;
use crate::model::{DEFAULT_QUEUE, NewTask, TaskEnvelope, TaskId};
use crate::telemetry::metrics;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct Producer {
    broker: Arc<dyn Broker>,
    default_queue: String,
    retry: RetryPolicy,
}

impl Producer {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            default_queue: DEFAULT_QUEUE.to_string(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = queue.into();
        self
    }

    /// Connectivity retry policy for enqueues. When it runs out the
    /// submit fails with a connectivity error; a task is never dropped
    /// without the caller knowing.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Submit one invocation of `task_name`. Returns its id.
    pub async fn submit(
        &self,
        task_name: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        eta: Option<DateTime<Utc>>,
    ) -> Result<TaskId> {
        let mut task = NewTask::new(task_name).args(args).kwargs(kwargs);
        if let Some(eta) = eta {
            task = task.eta(eta);
        }
        self.send(task).await
    }

    /// Submit a fully-built task.
    pub async fn send(&self, task: NewTask) -> Result<TaskId> {
        let queue = task
            .queue
            .clone()
            .unwrap_or_else(|| self.default_queue.clone());
        let envelope = task.into_envelope();
        self.enqueue_envelope(&queue, &envelope).await?;
        Ok(envelope.id)
    }

    /// Enqueue a prepared envelope, honouring its eta as a delivery delay.
    pub async fn enqueue_envelope(&self, queue: &str, envelope: &TaskEnvelope) -> Result<()> {
        let payload = codec::encode(envelope)?;
        let delay = envelope.remaining_delay(Utc::now());

        let result = retry_connectivity(&self.retry, "enqueue", || {
            self.broker.enqueue(queue, &payload, delay)
        })
        .await;

        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::tasks_submitted().add(
            1,
            &[
                KeyValue::new("task", envelope.name.clone()),
                KeyValue::new("result", outcome),
            ],
        );

        match result {
            Ok(receipt) => {
                debug!(task_id = %envelope.id, task = %envelope.name, queue, %receipt, ?delay, "task enqueued");
                Ok(())
            }
            Err(e) => {
                warn!(task_id = %envelope.id, task = %envelope.name, queue, "enqueue failed: {e}");
                Err(e)
            }
        }
    }
}

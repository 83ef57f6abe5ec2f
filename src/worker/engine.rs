//! Worker loop: pop envelopes while a slot is free, run handlers, settle
//! each attempt with the broker and publish its lifecycle events.

use crate::backoff::Backoff;
use crate::broker::{Broker, Delivery, RetryPolicy, retry_connectivity};
use crate::codec;
use crate::error::{Error, Result};
use crate::model::{
    DEFAULT_QUEUE, EVENTS_TOPIC, EventRecord, EventType, HEARTBEAT_TOPIC, Heartbeat,
    MAX_EVENT_BYTES, TaskEnvelope, TaskId,
};
use crate::telemetry::metrics;
use crate::telemetry::task::{record_state_transition, start_task_span};
use chrono::Utc;
use opentelemetry::KeyValue;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use super::registry::{RegisteredTask, Registry, TaskContext};
use super::transition::{AttemptOutcome, TaskState, Transition, decide};

/// Configuration for a worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue: String,
    /// Maximum attempts running at once.
    pub concurrency: usize,
    /// How long one dequeue blocks waiting for work.
    pub poll_wait: Duration,
    /// Lease on a popped envelope. An unacked envelope becomes visible to
    /// other workers once it lapses, which is how a dead worker's tasks get
    /// redelivered.
    pub visibility_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Delay schedule between recoverable failures of a task.
    pub retry_backoff: Backoff,
    /// Connectivity retries for broker calls.
    pub broker_retry: RetryPolicy,
    /// How long a graceful shutdown waits for in-flight attempts.
    pub drain_timeout: Duration,
    /// Defaults to a random `worker-xxxxxxxx`.
    pub worker_id: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            concurrency: 4,
            poll_wait: Duration::from_secs(5),
            visibility_timeout: Duration::from_secs(600),
            heartbeat_interval: Duration::from_secs(10),
            retry_backoff: Backoff::default(),
            broker_retry: RetryPolicy::default(),
            drain_timeout: Duration::from_secs(30),
            worker_id: None,
        }
    }
}

/// A pool of execution slots fed from one queue.
#[derive(Clone)]
pub struct Worker {
    broker: Arc<dyn Broker>,
    registry: Arc<Registry>,
    config: WorkerConfig,
    worker_id: String,
    slots: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<TaskId>>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Worker {
    pub fn new(broker: Arc<dyn Broker>, registry: Arc<Registry>, config: WorkerConfig) -> Self {
        let concurrency = config.concurrency.max(1);
        let worker_id = config.worker_id.clone().unwrap_or_else(|| {
            let id = Uuid::new_v4().simple().to_string();
            format!("worker-{}", &id[..8])
        });
        let (shutdown, _) = watch::channel(false);
        Self {
            broker,
            registry,
            config: WorkerConfig {
                concurrency,
                ..config
            },
            worker_id,
            slots: Arc::new(Semaphore::new(concurrency)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Attempts currently running a handler. A slot held by a pending
    /// pop does not count.
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Ids of the envelopes currently running.
    pub async fn in_flight_ids(&self) -> Vec<TaskId> {
        self.in_flight.lock().await.iter().copied().collect()
    }

    /// Signal the worker to stop popping and drain.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Run until shutdown.
    ///
    /// Dropping the returned future aborts every in-flight attempt without
    /// settling it; the broker redelivers those envelopes once their
    /// visibility timeout lapses.
    pub async fn run(&self) -> Result<()> {
        let queue = self.config.queue.clone();
        retry_connectivity(&self.config.broker_retry, "ensure_queue", || {
            self.broker.ensure_queue(&queue)
        })
        .await?;

        for name in self.registry.task_names() {
            if let Some(task) = self.registry.get(name)
                && task.options.timeout >= self.config.visibility_timeout
            {
                warn!(
                    task = name,
                    timeout = ?task.options.timeout,
                    visibility = ?self.config.visibility_timeout,
                    "handler timeout exceeds visibility timeout; a slow attempt may be redelivered while still running"
                );
            }
        }

        let mut shutdown = self.shutdown.subscribe();
        let mut tasks: JoinSet<()> = JoinSet::new();
        tasks.spawn(self.clone().heartbeat_loop(self.shutdown.subscribe()));

        info!(
            worker_id = %self.worker_id,
            queue = %queue,
            concurrency = self.config.concurrency,
            handlers = self.registry.len(),
            "worker started"
        );

        loop {
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(worker_id = %self.worker_id, "attempt task aborted: {e}");
                }
            }
            if *shutdown.borrow_and_update() {
                break;
            }

            // Backpressure: only pop when a slot is free.
            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                permit = Arc::clone(&self.slots).acquire_owned() => permit
                    .map_err(|_| Error::Other("worker slots closed".to_string()))?,
            };

            let popped = tokio::select! {
                _ = shutdown.changed() => break,
                popped = self.pop() => popped,
            };

            match popped {
                Ok(Some(delivery)) => {
                    let this = self.clone();
                    tasks.spawn(async move {
                        this.process(delivery).await;
                        drop(permit);
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    error!(worker_id = %self.worker_id, "dequeue failed: {e}");
                    drop(permit);
                    tokio::time::sleep(self.config.poll_wait.min(Duration::from_secs(1))).await;
                }
            }
        }

        let in_flight = self.in_flight().await;
        info!(
            worker_id = %self.worker_id,
            in_flight,
            "worker shutting down, draining in-flight tasks"
        );
        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                worker_id = %self.worker_id,
                remaining = tasks.len(),
                "drain timeout reached, abandoning attempts to redelivery"
            );
            tasks.shutdown().await;
        }
        info!(worker_id = %self.worker_id, "worker stopped");
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Delivery>> {
        retry_connectivity(&self.config.broker_retry, "dequeue", || {
            self.broker.dequeue(
                &self.config.queue,
                self.config.poll_wait,
                self.config.visibility_timeout,
            )
        })
        .await
    }

    /// Carry one delivery through its attempt.
    async fn process(&self, delivery: Delivery) {
        let envelope = match codec::decode_registered(&delivery.payload, self.registry.as_ref()) {
            Ok(envelope) => envelope,
            Err(Error::UnknownTask { .. }) => {
                self.reject_unknown(&delivery).await;
                return;
            }
            Err(e) => {
                error!(receipt = %delivery.receipt, "undecodable envelope, dead-lettering: {e}");
                self.dead_letter(&delivery, "undecodable").await;
                return;
            }
        };

        let now = Utc::now();
        if envelope.is_early(now) {
            let delay = envelope.remaining_delay(now);
            debug!(task_id = %envelope.id, ?delay, "eta not reached, returning to queue");
            self.settle("nack", || {
                self.broker.nack(&self.config.queue, delivery.receipt, delay)
            })
            .await;
            return;
        }

        let Some(task) = self.registry.get(&envelope.name).cloned() else {
            return;
        };

        let span = start_task_span(&envelope.name, &envelope.id, envelope.retries);
        self.execute(delivery, envelope, task, span.clone())
            .instrument(span)
            .await;
    }

    async fn execute(
        &self,
        delivery: Delivery,
        envelope: TaskEnvelope,
        task: RegisteredTask,
        span: tracing::Span,
    ) {
        let queue = &self.config.queue;
        let max_retries = envelope.max_retries.unwrap_or(task.options.max_retries);

        self.in_flight.lock().await.insert(envelope.id);
        self.transition(&span, &envelope.name, TaskState::Dequeued, TaskState::Running);
        if delivery.deliveries > 1 {
            info!(task_id = %envelope.id, deliveries = delivery.deliveries, "redelivered envelope");
        }
        self.emit(self.event(&envelope, EventType::Started, Value::Null))
            .await;

        let started = Instant::now();
        let outcome = self.invoke(&task, &envelope).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let transition = decide(outcome, envelope.retries, max_retries, &self.config.retry_backoff);
        let target = transition.target();
        metrics::handler_duration_ms().record(
            elapsed_ms,
            &[
                KeyValue::new("task", envelope.name.clone()),
                KeyValue::new("outcome", target.to_string()),
            ],
        );
        self.transition(&span, &envelope.name, TaskState::Running, target);

        match transition {
            Transition::Succeed { result } => {
                info!(task_id = %envelope.id, elapsed_ms, "task succeeded");
                self.emit(self.event(&envelope, EventType::Succeeded, result))
                    .await;
                self.settle("ack", || self.broker.ack(queue, delivery.receipt))
                    .await;
            }
            Transition::Retry {
                error,
                delay,
                next_retries,
            } => {
                warn!(
                    task_id = %envelope.id,
                    attempt = envelope.retries,
                    max_retries,
                    ?delay,
                    "task failed, retrying: {error}"
                );
                let next = TaskEnvelope {
                    retries: next_retries,
                    ..envelope.next_attempt()
                };
                match codec::encode(&next) {
                    Ok(payload) => {
                        self.emit(self.event(
                            &envelope,
                            EventType::Retried,
                            json!({
                                "error": error,
                                "retries": next_retries,
                                "max_retries": max_retries,
                                "retry_in_ms": delay.as_millis() as u64,
                            }),
                        ))
                        .await;
                        self.settle("requeue", || {
                            self.broker.requeue(queue, delivery.receipt, &payload, delay)
                        })
                        .await;
                    }
                    // Cannot happen for an envelope that decoded; the lease
                    // lapsing redelivers the unchanged attempt.
                    Err(e) => error!(task_id = %envelope.id, "cannot encode retry: {e}"),
                }
            }
            Transition::Fail { error, reason } => {
                error!(task_id = %envelope.id, %reason, attempts = envelope.retries + 1, "task failed: {error}");
                let emitted = self
                    .emit(self.event(
                        &envelope,
                        EventType::Failed,
                        json!({
                            "error": error,
                            "reason": reason.to_string(),
                            "attempts": envelope.retries + 1,
                        }),
                    ))
                    .await;
                if emitted {
                    self.dead_letter(&delivery, &reason.to_string()).await;
                } else {
                    warn!(task_id = %envelope.id, "failure event not delivered, leaving envelope for redelivery");
                }
            }
        }

        self.in_flight.lock().await.remove(&envelope.id);
    }

    /// Run the handler in its own task so a panic or timeout stays contained.
    async fn invoke(&self, task: &RegisteredTask, envelope: &TaskEnvelope) -> AttemptOutcome {
        let ctx = TaskContext {
            task_id: envelope.id,
            task_name: envelope.name.clone(),
            args: envelope.args.clone(),
            kwargs: envelope.kwargs.clone(),
            attempt: envelope.retries,
            worker_id: self.worker_id.clone(),
        };
        let handler = Arc::clone(&task.handler);
        let mut call = AbortOnDrop(tokio::spawn(async move { handler.call(ctx).await }));

        match tokio::time::timeout(task.options.timeout, &mut call.0).await {
            Ok(Ok(Ok(result))) => AttemptOutcome::Returned(result),
            Ok(Ok(Err(e))) => AttemptOutcome::Raised(e),
            Ok(Err(join_err)) if join_err.is_panic() => {
                let panic = join_err.into_panic();
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                AttemptOutcome::Panicked(format!("handler panicked: {msg}"))
            }
            Ok(Err(_)) => AttemptOutcome::Panicked("handler task cancelled".to_string()),
            Err(_) => AttemptOutcome::TimedOut(task.options.timeout),
        }
    }

    /// Unknown task names are terminal: report and dead-letter, never retry.
    async fn reject_unknown(&self, delivery: &Delivery) {
        let envelope = match codec::decode(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(receipt = %delivery.receipt, "undecodable envelope, dead-lettering: {e}");
                self.dead_letter(delivery, "undecodable").await;
                return;
            }
        };
        warn!(task_id = %envelope.id, task = %envelope.name, "no handler registered, dead-lettering");
        // No attempt ran, so there is no started event for this one to follow.
        let record = self
            .event(
                &envelope,
                EventType::Failed,
                json!({
                    "error": format!("no handler registered for task {}", envelope.name),
                    "reason": "unknown_task",
                    "attempts": envelope.retries,
                }),
            )
            .unsequenced();
        let emitted = self.emit(record).await;
        if emitted {
            self.dead_letter(delivery, "unknown_task").await;
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) {
        metrics::dead_letters().add(1, &[KeyValue::new("reason", reason.to_string())]);
        self.settle("dead_letter", || {
            self.broker.dead_letter(&self.config.queue, delivery.receipt)
        })
        .await;
    }

    /// Lifecycle event for the current attempt of `envelope`.
    fn event(&self, envelope: &TaskEnvelope, event_type: EventType, payload: Value) -> EventRecord {
        EventRecord::for_attempt(
            envelope.id,
            &envelope.name,
            event_type,
            envelope.retries,
            payload,
        )
        .from_worker(&self.worker_id)
    }

    /// Publish a lifecycle event. Returns whether it reached the broker.
    ///
    /// If the broker refuses the event for anything but connectivity, it is
    /// sent again without payload or task name, so every event has a form
    /// that can be delivered.
    async fn emit(&self, record: EventRecord) -> bool {
        let (task_id, event_type) = (record.task_id, record.event_type);
        let refused = match self.publish_event(&record).await {
            Ok(()) => return true,
            Err(e) if e.is_connectivity() => {
                error!(%task_id, event = %event_type, "event publish failed: {e}");
                return false;
            }
            Err(e) => e,
        };

        warn!(%task_id, event = %event_type, "event refused, publishing without payload: {refused}");
        let bare = EventRecord {
            payload: json!({ "truncated": true }),
            task_name: None,
            ..record
        };
        match self.publish_event(&bare).await {
            Ok(()) => true,
            Err(e) => {
                error!(%task_id, event = %event_type, "event publish failed: {e}");
                false
            }
        }
    }

    async fn publish_event(&self, record: &EventRecord) -> Result<()> {
        let bytes = record.encode_bounded(MAX_EVENT_BYTES)?;
        retry_connectivity(&self.config.broker_retry, "publish", || {
            self.broker.publish(EVENTS_TOPIC, &bytes)
        })
        .await
    }

    /// Settle an attempt with the broker. Failures are logged; the lease
    /// lapsing hands the envelope to another attempt.
    async fn settle<T, F, Fut>(&self, what: &str, op: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if let Err(e) = retry_connectivity(&self.config.broker_retry, what, op).await {
            error!(worker_id = %self.worker_id, operation = what, "broker settle failed: {e}");
        }
    }

    fn transition(&self, span: &tracing::Span, task: &str, from: TaskState, to: TaskState) {
        debug_assert!(from.can_transition_to(to), "{from} -> {to}");
        record_state_transition(span, &from.to_string(), &to.to_string());
        metrics::task_transitions().add(
            1,
            &[
                KeyValue::new("task", task.to_string()),
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", to.to_string()),
            ],
        );
    }

    async fn heartbeat_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            let beat = Heartbeat {
                worker_id: self.worker_id.clone(),
                queue: self.config.queue.clone(),
                timestamp: Utc::now(),
                in_flight: self.in_flight().await,
                concurrency: self.config.concurrency,
            };
            let published = match serde_json::to_vec(&beat) {
                Ok(bytes) => self.broker.publish(HEARTBEAT_TOPIC, &bytes).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = published {
                warn!(worker_id = %self.worker_id, "heartbeat publish failed: {e}");
            }
        }
    }
}

/// Aborts the wrapped task when dropped, so cancelling an attempt also
/// cancels its handler.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

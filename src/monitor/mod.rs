//! Event monitor.
//!
//! Subscribes to the lifecycle and heartbeat topics, normalizes each raw
//! event, restores per-task order and forwards the result to a
//! [`NotificationSink`]. It is read-only with respect to task state.

pub mod liveness;
pub mod normalize;
pub mod reorder;
pub mod sink;

pub use liveness::LivenessTracker;
pub use normalize::normalize;
pub use reorder::ReorderBuffer;
pub use sink::{ChannelSink, LogSink, NotificationSink, WebhookSink};

use crate::backoff::Backoff;
use crate::broker::{Broker, RetryPolicy, Subscription, retry_connectivity};
use crate::error::Result;
use crate::model::{EVENTS_TOPIC, EventRecord, HEARTBEAT_TOPIC, Heartbeat};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How long an early event waits for the gap before it is released.
    pub reorder_window: Duration,
    /// A worker silent for longer than this is reported stale.
    pub heartbeat_timeout: Duration,
    /// Retries when the sink reports a connectivity failure.
    pub sink_retry: RetryPolicy,
    /// Retries while (re)subscribing.
    pub broker_retry: RetryPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            reorder_window: Duration::from_secs(2),
            heartbeat_timeout: Duration::from_secs(30),
            sink_retry: RetryPolicy::bounded(
                Backoff::new(Duration::from_millis(250), Duration::from_secs(5)),
                5,
            ),
            broker_retry: RetryPolicy::default(),
        }
    }
}

pub struct Monitor {
    broker: Arc<dyn Broker>,
    sink: Arc<dyn NotificationSink>,
    config: MonitorConfig,
    shutdown: watch::Sender<bool>,
}

impl Monitor {
    pub fn new(
        broker: Arc<dyn Broker>,
        sink: Arc<dyn NotificationSink>,
        config: MonitorConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            broker,
            sink,
            config,
            shutdown,
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        retry_connectivity(&self.config.broker_retry, "subscribe", || {
            self.broker.subscribe(topic)
        })
        .await
    }

    /// Relay events until shutdown. Anything still held for reordering is
    /// released on the way out.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        let mut events = self.subscribe(EVENTS_TOPIC).await?;
        let mut heartbeats = self.subscribe(HEARTBEAT_TOPIC).await?;

        let mut reorder = ReorderBuffer::new(self.config.reorder_window);
        let mut liveness = LivenessTracker::new(self.config.heartbeat_timeout);
        let mut liveness_check =
            tokio::time::interval((self.config.heartbeat_timeout / 2).max(Duration::from_millis(100)));
        liveness_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(window = ?self.config.reorder_window, "monitor started");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            let deadline = reorder.next_deadline();
            let flush_due = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                raw = events.recv() => match raw {
                    Some(raw) => match normalize(&raw) {
                        Ok(Some(event)) => {
                            for ready in reorder.push(event, Instant::now()) {
                                self.forward(&ready).await;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("dropping malformed event: {e}"),
                    },
                    None => {
                        warn!("event subscription closed, resubscribing");
                        events = self.subscribe(EVENTS_TOPIC).await?;
                    }
                },
                raw = heartbeats.recv() => match raw {
                    Some(raw) => match serde_json::from_slice::<Heartbeat>(&raw) {
                        Ok(beat) => liveness.observe(beat, Instant::now()),
                        Err(e) => warn!("dropping malformed heartbeat: {e}"),
                    },
                    None => {
                        warn!("heartbeat subscription closed, resubscribing");
                        heartbeats = self.subscribe(HEARTBEAT_TOPIC).await?;
                    }
                },
                _ = flush_due => {
                    for ready in reorder.flush_expired(Instant::now()) {
                        self.forward(&ready).await;
                    }
                }
                _ = liveness_check.tick() => {
                    for beat in liveness.newly_stale(Instant::now()) {
                        warn!(
                            worker_id = %beat.worker_id,
                            queue = %beat.queue,
                            last_seen = %beat.timestamp,
                            in_flight = beat.in_flight,
                            "worker heartbeat lost; its in-flight tasks will be redelivered after their visibility timeout"
                        );
                    }
                    let now = Instant::now();
                    for worker_id in liveness.forget_departed(now) {
                        debug!(%worker_id, "forgetting departed worker");
                    }
                    let evicted = reorder.evict_idle(now);
                    if evicted > 0 {
                        debug!(evicted, tracked = reorder.len(), "evicted idle event streams");
                    }
                }
            }
        }

        for ready in reorder.flush_all() {
            self.forward(&ready).await;
        }
        info!("monitor stopped");
        Ok(())
    }

    async fn forward(&self, event: &EventRecord) {
        let result = retry_connectivity(&self.config.sink_retry, "notify", || {
            self.sink.notify(event)
        })
        .await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::events_forwarded().add(
            1,
            &[
                KeyValue::new("type", event.event_type.to_string()),
                KeyValue::new("result", outcome),
            ],
        );
        if let Err(e) = result {
            error!(task_id = %event.task_id, event = %event.event_type, "notification failed: {e}");
        }
    }
}

//! Periodic scheduler.
//!
//! On every tick the scheduler scans the schedule table and, for each
//! enabled entry whose `next_due` has passed, enqueues a fresh envelope
//! through the same producer path API processes use, then advances
//! `next_due` to one cadence after the tick. A missed window fires once,
//! never as a catch-up burst. A failed enqueue leaves `next_due` alone so
//! the slot is retried on the next tick.
//!
//! The table is single-owner: running two schedulers against one store
//! duplicates enqueues.

pub mod cadence;
pub mod store;

pub use cadence::Cadence;
pub use store::{
    MemoryScheduleStore, PgScheduleStore, ScheduleStore, load_schedule_file, parse_schedule,
};

use crate::backoff::Backoff;
use crate::broker::{Broker, RetryPolicy, retry_connectivity};
use crate::error::{Error, Result};
use crate::model::{DEFAULT_QUEUE, ScheduleEntry};
use crate::producer::Producer;
use crate::telemetry::metrics;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick: Duration,
    /// Queue for entries that do not name one.
    pub default_queue: String,
    /// Connectivity retries per enqueue. Bounded, so an unreachable broker
    /// defers the entry to the next tick instead of stalling the scan.
    pub enqueue_retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(5),
            default_queue: DEFAULT_QUEUE.to_string(),
            enqueue_retry: RetryPolicy::bounded(
                Backoff::new(Duration::from_millis(200), Duration::from_secs(2)),
                3,
            ),
        }
    }
}

/// What one tick did, by entry name.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub fired: Vec<String>,
    /// Due but the enqueue failed; retried next tick.
    pub deferred: Vec<String>,
    /// Disabled and flagged as malformed.
    pub disabled: Vec<String>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.fired.is_empty() && self.deferred.is_empty() && self.disabled.is_empty()
    }
}

pub struct Scheduler {
    broker: Arc<dyn Broker>,
    producer: Producer,
    store: Arc<dyn ScheduleStore>,
    config: SchedulerConfig,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(broker: Arc<dyn Broker>, store: Arc<dyn ScheduleStore>, config: SchedulerConfig) -> Self {
        let producer = Producer::new(Arc::clone(&broker))
            .with_default_queue(config.default_queue.clone())
            .with_retry(config.enqueue_retry);
        let (shutdown, _) = watch::channel(false);
        Self {
            broker,
            producer,
            store,
            config,
            shutdown,
        }
    }

    /// Register entries (typically from a schedule file) without resetting
    /// the runtime state of ones that already exist.
    pub async fn register_all(&self, entries: Vec<ScheduleEntry>) -> Result<()> {
        for entry in entries {
            let name = entry.name.clone();
            if self.store.register(entry).await? {
                info!(entry = %name, "schedule entry registered");
            } else {
                debug!(entry = %name, "schedule entry updated");
            }
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Evaluate every entry once against `now`.
    ///
    /// Failures are isolated per entry; only a failure to read the table
    /// fails the tick.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();

        for entry in self.store.load().await? {
            if !entry.is_due(now) {
                continue;
            }

            let next_due = match Cadence::parse(&entry.cadence) {
                Ok(cadence) => cadence.next_after(now).ok_or_else(|| Error::ScheduleCorruption {
                    entry: entry.name.clone(),
                    reason: format!("cadence {:?} never fires again", entry.cadence),
                }),
                Err(e) => Err(Error::ScheduleCorruption {
                    entry: entry.name.clone(),
                    reason: e.to_string(),
                }),
            };
            let next_due = match next_due {
                Ok(next_due) => next_due,
                Err(e) => {
                    error!(entry = %entry.name, "disabling schedule entry: {e}");
                    if let Err(store_err) = self.store.disable(&entry.name, &e.to_string()).await {
                        error!(entry = %entry.name, "could not disable entry: {store_err}");
                    }
                    record_fire(&entry.name, "disabled");
                    report.disabled.push(entry.name);
                    continue;
                }
            };

            match self.producer.send(entry.to_task()).await {
                Ok(task_id) => {
                    info!(entry = %entry.name, task = %entry.task_name, %task_id, %next_due, "schedule entry fired");
                    let name = entry.name.clone();
                    let advanced = ScheduleEntry {
                        next_due,
                        last_run: Some(now),
                        ..entry
                    };
                    // A crash here re-fires the entry once after restart.
                    if let Err(e) = self.store.save(&advanced).await {
                        error!(entry = %name, "enqueued but could not persist next_due: {e}");
                    }
                    record_fire(&name, "ok");
                    report.fired.push(name);
                }
                Err(e) => {
                    warn!(entry = %entry.name, "enqueue failed, keeping slot for next tick: {e}");
                    record_fire(&entry.name, "deferred");
                    report.deferred.push(entry.name);
                }
            }
        }

        Ok(report)
    }

    /// Tick until shutdown.
    pub async fn run(&self) -> Result<()> {
        let mut queues: Vec<String> = self
            .store
            .load()
            .await?
            .into_iter()
            .map(|e| e.queue)
            .collect();
        queues.push(self.config.default_queue.clone());
        queues.sort();
        queues.dedup();
        for queue in &queues {
            retry_connectivity(&self.config.enqueue_retry, "ensure_queue", || {
                self.broker.ensure_queue(queue)
            })
            .await?;
        }

        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(tick = ?self.config.tick, "scheduler started");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            match self.tick(Utc::now()).await {
                Ok(report) if !report.is_empty() => debug!(?report, "scheduler tick"),
                Ok(_) => {}
                Err(e) => error!("scheduler tick failed: {e}"),
            }
        }

        info!("scheduler stopped");
        Ok(())
    }
}

fn record_fire(entry: &str, result: &'static str) {
    metrics::schedule_fires().add(
        1,
        &[
            KeyValue::new("entry", entry.to_string()),
            KeyValue::new("result", result),
        ],
    );
}

//! In-process broker with the same delivery semantics as pgmq.
//!
//! Messages are kept in receipt order per queue; a pop leases the oldest
//! visible message for the visibility timeout. Useful for embedded
//! deployments and for exercising workers without Postgres.

use super::{Broker, Delivery, Receipt, Subscription, check_publish_size};
use crate::error::{Error, Result};
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::time::Instant;
use tracing::debug;

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
    online: AtomicBool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            online: AtomicBool::new(true),
        }
    }
}

#[derive(Default)]
struct State {
    queues: HashMap<String, QueueState>,
    topics: HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>,
    next_receipt: i64,
}

impl State {
    fn issue_receipt(&mut self) -> Receipt {
        self.next_receipt += 1;
        Receipt(self.next_receipt)
    }
}

#[derive(Default)]
struct QueueState {
    messages: BTreeMap<Receipt, StoredMessage>,
    dead: Vec<Vec<u8>>,
}

struct StoredMessage {
    payload: Vec<u8>,
    visible_at: Instant,
    deliveries: u32,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the broker. While offline every
    /// operation fails with [`Error::Connectivity`].
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
        if online {
            self.inner.notify.notify_waiters();
        }
    }

    /// Messages stored in a queue, leased ones included.
    pub async fn queue_len(&self, queue: &str) -> usize {
        let state = self.inner.state.lock().await;
        state.queues.get(queue).map_or(0, |q| q.messages.len())
    }

    /// Bodies of dead-lettered messages, oldest first.
    pub async fn dead_letters(&self, queue: &str) -> Vec<Vec<u8>> {
        let state = self.inner.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|q| q.dead.clone())
            .unwrap_or_default()
    }

    fn check_online(&self) -> Result<()> {
        if self.inner.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Connectivity("memory broker is offline".to_string()))
        }
    }

    fn count(queue: &str, operation: &'static str) {
        metrics::broker_operations().add(
            1,
            &[
                KeyValue::new("backend", "memory"),
                KeyValue::new("queue", queue.to_string()),
                KeyValue::new("operation", operation),
            ],
        );
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ensure_queue(&self, queue: &str) -> Result<()> {
        self.check_online()?;
        let mut state = self.inner.state.lock().await;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn enqueue(&self, queue: &str, payload: &[u8], delay: Duration) -> Result<Receipt> {
        self.check_online()?;
        let receipt = {
            let mut state = self.inner.state.lock().await;
            let receipt = state.issue_receipt();
            state.queues.entry(queue.to_string()).or_default().messages.insert(
                receipt,
                StoredMessage {
                    payload: payload.to_vec(),
                    visible_at: Instant::now() + delay,
                    deliveries: 0,
                },
            );
            receipt
        };
        self.inner.notify.notify_waiters();
        Self::count(queue, "send");
        Ok(receipt)
    }

    async fn dequeue(
        &self,
        queue: &str,
        wait: Duration,
        visibility: Duration,
    ) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            self.check_online()?;

            // Register interest before looking, so a concurrent enqueue
            // between the scan and the wait still wakes us.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_visible = {
                let mut state = self.inner.state.lock().await;
                let now = Instant::now();
                let q = state.queues.entry(queue.to_string()).or_default();
                if let Some((receipt, msg)) =
                    q.messages.iter_mut().find(|(_, m)| m.visible_at <= now)
                {
                    msg.visible_at = now + visibility;
                    msg.deliveries += 1;
                    let delivery = Delivery {
                        receipt: *receipt,
                        payload: msg.payload.clone(),
                        deliveries: msg.deliveries,
                    };
                    Self::count(queue, "read");
                    return Ok(Some(delivery));
                }
                q.messages.values().map(|m| m.visible_at).min()
            };

            if Instant::now() >= deadline {
                Self::count(queue, "read_empty");
                return Ok(None);
            }
            let wake = next_visible.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn ack(&self, queue: &str, receipt: Receipt) -> Result<()> {
        self.check_online()?;
        let mut state = self.inner.state.lock().await;
        let removed = state
            .queues
            .get_mut(queue)
            .and_then(|q| q.messages.remove(&receipt));
        if removed.is_none() {
            debug!(queue, %receipt, "ack for unknown receipt");
        }
        Self::count(queue, "delete");
        Ok(())
    }

    async fn nack(&self, queue: &str, receipt: Receipt, delay: Duration) -> Result<()> {
        self.check_online()?;
        {
            let mut state = self.inner.state.lock().await;
            if let Some(msg) = state
                .queues
                .get_mut(queue)
                .and_then(|q| q.messages.get_mut(&receipt))
            {
                msg.visible_at = Instant::now() + delay;
            }
        }
        self.inner.notify.notify_waiters();
        Self::count(queue, "set_vt");
        Ok(())
    }

    async fn requeue(
        &self,
        queue: &str,
        receipt: Receipt,
        payload: &[u8],
        delay: Duration,
    ) -> Result<Receipt> {
        self.check_online()?;
        let new_receipt = {
            let mut state = self.inner.state.lock().await;
            let new_receipt = state.issue_receipt();
            let q = state.queues.entry(queue.to_string()).or_default();
            let deliveries = q.messages.remove(&receipt).map_or(0, |m| m.deliveries);
            q.messages.insert(
                new_receipt,
                StoredMessage {
                    payload: payload.to_vec(),
                    visible_at: Instant::now() + delay,
                    deliveries,
                },
            );
            new_receipt
        };
        self.inner.notify.notify_waiters();
        Self::count(queue, "requeue");
        Ok(new_receipt)
    }

    async fn dead_letter(&self, queue: &str, receipt: Receipt) -> Result<()> {
        self.check_online()?;
        let mut state = self.inner.state.lock().await;
        if let Some(q) = state.queues.get_mut(queue)
            && let Some(msg) = q.messages.remove(&receipt)
        {
            q.dead.push(msg.payload);
        }
        Self::count(queue, "archive");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.check_online()?;
        check_publish_size(topic, payload)?;
        let mut state = self.inner.state.lock().await;
        if let Some(subscribers) = state.topics.get_mut(topic) {
            subscribers.retain(|tx| tx.send(payload.to_vec()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        self.check_online()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock().await;
        state.topics.entry(topic.to_string()).or_default().push(tx);
        Ok(Subscription::new(rx))
    }
}

//! Broker client: the push/pop/pub-sub contract every component talks through.
//!
//! Two backends implement it: [`PgmqBroker`] over Postgres + pgmq, and
//! [`MemoryBroker`] for single-process use and tests. Delivery is
//! at-least-once: a popped message stays invisible for the visibility
//! timeout and reappears unless it is acked, requeued or dead-lettered.

pub mod memory;
pub mod pgmq;

pub use memory::MemoryBroker;
pub use pgmq::PgmqBroker;

use crate::backoff::Backoff;
use crate::error::Result;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Largest pub/sub payload any backend accepts (the NOTIFY limit).
pub const MAX_PUBLISH_BYTES: usize = 7999;

/// Reject a publish payload no backend could deliver.
pub(crate) fn check_publish_size(topic: &str, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_PUBLISH_BYTES {
        return Err(crate::error::Error::Codec(format!(
            "payload of {} bytes on {topic} exceeds the {MAX_PUBLISH_BYTES} byte publish limit",
            payload.len()
        )));
    }
    Ok(())
}

/// Broker-assigned handle for one stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Receipt(pub i64);

impl std::fmt::Display for Receipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message popped from a queue. Exclusive to the popper until its
/// visibility timeout lapses.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub receipt: Receipt,
    pub payload: Vec<u8>,
    /// How many times this message has been handed out, this one included.
    pub deliveries: u32,
}

/// Live subscription to a pub/sub topic. Only messages published after
/// subscribing are seen.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self { rx }
    }

    /// Next message, or None once the broker side has gone away.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Create the queue if it does not exist.
    async fn ensure_queue(&self, queue: &str) -> Result<()>;

    /// Append to the tail; the message becomes visible after `delay`.
    async fn enqueue(&self, queue: &str, payload: &[u8], delay: Duration) -> Result<Receipt>;

    /// Wait up to `wait` for the next visible message and lease it for
    /// `visibility`. Returns None on timeout.
    async fn dequeue(
        &self,
        queue: &str,
        wait: Duration,
        visibility: Duration,
    ) -> Result<Option<Delivery>>;

    /// Remove a delivered message permanently.
    async fn ack(&self, queue: &str, receipt: Receipt) -> Result<()>;

    /// Give a delivered message back, visible again after `delay`.
    async fn nack(&self, queue: &str, receipt: Receipt, delay: Duration) -> Result<()>;

    /// Give a delivered message back with a new body (updated retry
    /// metadata), visible again after `delay`.
    async fn requeue(
        &self,
        queue: &str,
        receipt: Receipt,
        payload: &[u8],
        delay: Duration,
    ) -> Result<Receipt>;

    /// Remove a delivered message from the live queue but keep it for
    /// operator inspection.
    async fn dead_letter(&self, queue: &str, receipt: Receipt) -> Result<()>;

    /// Fire-and-forget broadcast to current subscribers. Payloads over
    /// [`MAX_PUBLISH_BYTES`] fail with a non-retryable error.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}

/// How call sites retry broker operations that fail on connectivity.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub backoff: Backoff,
    /// None retries until the operation succeeds.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::new(Duration::from_millis(200), Duration::from_secs(30)),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn bounded(backoff: Backoff, max_attempts: u32) -> Self {
        Self {
            backoff,
            max_attempts: Some(max_attempts.max(1)),
        }
    }
}

/// Run `op`, retrying with backoff while it fails with a connectivity error.
///
/// Any other error is returned at once. When attempts run out the last
/// connectivity error is returned to the caller.
pub async fn retry_connectivity<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_connectivity() => {
                attempt += 1;
                if policy.max_attempts.is_some_and(|max| attempt >= max) {
                    return Err(e);
                }
                let delay = policy.backoff.delay(attempt - 1);
                warn!(operation = what, attempt, ?delay, "broker unreachable: {e}");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

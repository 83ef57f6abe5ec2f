//! pgmq-backed broker via direct SQLx.
//!
//! Queues are pgmq queues: pgmq.send, pgmq.read_with_poll, pgmq.delete,
//! pgmq.set_vt, pgmq.archive. Pub/sub rides on LISTEN/NOTIFY, which has
//! exactly the fire-and-forget semantics the contract asks for.

use super::{Broker, Delivery, Receipt, Subscription, check_publish_size};
use crate::error::{Error, Result};
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Broker handle. Owns the connection pool.
#[derive(Clone)]
pub struct PgmqBroker {
    pool: PgPool,
}

impl PgmqBroker {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations (pgmq extension, schedule table).
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn count(queue: &str, operation: &'static str) {
        metrics::broker_operations().add(
            1,
            &[
                KeyValue::new("backend", "pgmq"),
                KeyValue::new("queue", queue.to_string()),
                KeyValue::new("operation", operation),
            ],
        );
    }
}

/// pgmq stores jsonb, so message bodies must be JSON documents.
fn to_json(payload: &[u8]) -> Result<serde_json::Value> {
    serde_json::from_slice(payload)
        .map_err(|e| Error::Codec(format!("pgmq payloads must be JSON: {e}")))
}

fn whole_seconds(d: Duration) -> i32 {
    d.as_secs_f64().ceil().min(i32::MAX as f64) as i32
}

type MessageRow = (
    i64,
    i32,
    chrono::DateTime<chrono::Utc>,
    chrono::DateTime<chrono::Utc>,
    serde_json::Value,
);

#[async_trait]
impl Broker for PgmqBroker {
    async fn ensure_queue(&self, queue: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue)
            .execute(&self.pool)
            .await?;
        Self::count(queue, "create");
        Ok(())
    }

    async fn enqueue(&self, queue: &str, payload: &[u8], delay: Duration) -> Result<Receipt> {
        let body = to_json(payload)?;
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(queue)
            .bind(&body)
            .bind(whole_seconds(delay))
            .fetch_one(&self.pool)
            .await?;
        Self::count(queue, "send");
        Ok(Receipt(row.0))
    }

    async fn dequeue(
        &self,
        queue: &str,
        wait: Duration,
        visibility: Duration,
    ) -> Result<Option<Delivery>> {
        let vt = whole_seconds(visibility).max(1);
        let row: Option<MessageRow> = if wait < Duration::from_secs(1) {
            sqlx::query_as(
                "SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read($1, $2, 1)",
            )
            .bind(queue)
            .bind(vt)
            .fetch_optional(&self.pool)
            .await?
        } else {
            sqlx::query_as(
                "SELECT msg_id, read_ct, enqueued_at, vt, message
                 FROM pgmq.read_with_poll($1, $2, 1, $3, 100)",
            )
            .bind(queue)
            .bind(vt)
            .bind(whole_seconds(wait))
            .fetch_optional(&self.pool)
            .await?
        };

        let delivery = match row {
            Some((msg_id, read_ct, _enqueued_at, _vt, message)) => Some(Delivery {
                receipt: Receipt(msg_id),
                payload: serde_json::to_vec(&message)?,
                deliveries: read_ct.max(0) as u32,
            }),
            None => None,
        };

        Self::count(
            queue,
            if delivery.is_some() { "read" } else { "read_empty" },
        );
        Ok(delivery)
    }

    async fn ack(&self, queue: &str, receipt: Receipt) -> Result<()> {
        sqlx::query("SELECT pgmq.delete($1, $2)")
            .bind(queue)
            .bind(receipt.0)
            .execute(&self.pool)
            .await?;
        Self::count(queue, "delete");
        Ok(())
    }

    async fn nack(&self, queue: &str, receipt: Receipt, delay: Duration) -> Result<()> {
        sqlx::query("SELECT msg_id FROM pgmq.set_vt($1, $2, $3)")
            .bind(queue)
            .bind(receipt.0)
            .bind(whole_seconds(delay))
            .fetch_optional(&self.pool)
            .await?;
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
        let body = to_json(payload)?;

        // Send and delete commit together: either the retry is queued and
        // the old attempt gone, or nothing changed and the lease expires.
        let mut tx = self.pool.begin().await?;
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(queue)
            .bind(&body)
            .bind(whole_seconds(delay))
            .fetch_one(&mut *tx)
            .await?;
        sqlx::query("SELECT pgmq.delete($1, $2)")
            .bind(queue)
            .bind(receipt.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Self::count(queue, "requeue");
        Ok(Receipt(row.0))
    }

    async fn dead_letter(&self, queue: &str, receipt: Receipt) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue)
            .bind(receipt.0)
            .execute(&self.pool)
            .await?;
        Self::count(queue, "archive");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        check_publish_size(topic, payload)?;
        let text = std::str::from_utf8(payload)
            .map_err(|e| Error::Codec(format!("notify payload must be UTF-8: {e}")))?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(topic)
            .bind(text)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(topic).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let topic = topic.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    notif = listener.recv() => match notif {
                        Ok(n) => {
                            if tx.send(n.payload().as_bytes().to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(topic = %topic, "PgListener error: {e}, reconnecting");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    },
                }
            }
            debug!(topic = %topic, "subscription closed");
        });

        Ok(Subscription::new(rx))
    }
}

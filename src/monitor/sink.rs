//! Notification sinks: where the monitor sends normalized events.

use crate::error::{Error, Result};
use crate::model::EventRecord;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, event: &EventRecord) -> Result<()>;
}

/// Writes each event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, event: &EventRecord) -> Result<()> {
        info!(
            task_id = %event.task_id,
            event = %event.event_type,
            task = event.task_name.as_deref().unwrap_or("-"),
            worker_id = event.worker_id.as_deref().unwrap_or("-"),
            seq = event.seq,
            payload = %event.payload,
            "task event"
        );
        Ok(())
    }
}

/// Hands events to an in-process consumer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<EventRecord>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EventRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl NotificationSink for ChannelSink {
    async fn notify(&self, event: &EventRecord) -> Result<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| Error::Other("event channel closed".to_string()))
    }
}

/// POSTs each event as JSON to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("webhook client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn notify(&self, event: &EventRecord) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    Error::Connectivity(format!("webhook {}: {e}", self.url))
                } else {
                    Error::Other(format!("webhook {}: {e}", self.url))
                }
            })?;
        let status = response.status();
        if status.is_server_error() {
            return Err(Error::Connectivity(format!("webhook {} returned {status}", self.url)));
        }
        if !status.is_success() {
            return Err(Error::Other(format!("webhook {} returned {status}", self.url)));
        }
        Ok(())
    }
}

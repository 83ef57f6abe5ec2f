//! Envelope wire format.
//!
//! Envelopes travel as JSON objects so that pgmq can store them as jsonb
//! and operators can read them in archive tables.

use crate::error::{Error, Result};
use crate::model::TaskEnvelope;

/// Anything that can answer "is there a handler for this task name?".
pub trait TaskCatalog {
    fn contains(&self, task_name: &str) -> bool;
}

pub fn encode(envelope: &TaskEnvelope) -> Result<Vec<u8>> {
    serde_json::to_vec(envelope).map_err(|e| Error::Codec(format!("encode envelope: {e}")))
}

pub fn decode(bytes: &[u8]) -> Result<TaskEnvelope> {
    serde_json::from_slice(bytes).map_err(|e| Error::Codec(format!("decode envelope: {e}")))
}

/// Decode and resolve the task name against a catalog.
///
/// Unregistered names yield [`Error::UnknownTask`] carrying the envelope's
/// id, so the caller can dead-letter it and report the failure.
pub fn decode_registered(bytes: &[u8], catalog: &dyn TaskCatalog) -> Result<TaskEnvelope> {
    let envelope = decode(bytes)?;
    if !catalog.contains(&envelope.name) {
        return Err(Error::UnknownTask {
            id: envelope.id.to_string(),
            name: envelope.name,
        });
    }
    Ok(envelope)
}

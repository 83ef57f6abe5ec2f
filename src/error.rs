//! Error types for taskwire.

use thiserror::Error;

/// Failure raised by a task handler.
///
/// Recoverable failures are retried with backoff until the task's retry
/// bound is reached; fatal failures end the task immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("recoverable: {0}")]
    Recoverable(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn recoverable(msg: impl Into<String>) -> Self {
        Self::Recoverable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Recoverable(m) | Self::Fatal(m) => m,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("broker unreachable: {0}")]
    Connectivity(String),

    #[error("no handler registered for task {name} ({id})")]
    UnknownTask { id: String, name: String },

    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("malformed schedule entry {entry}: {reason}")]
    ScheduleCorruption { entry: String, reason: String },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for failures that a retry with backoff may resolve.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Error::Connectivity(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Error::Connectivity(e.to_string()),
            other => Error::Database(other),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

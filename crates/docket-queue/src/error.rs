//! Error types for queue setup, broker access and handler invocations.

use std::time::Duration;

use crate::job::JobId;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors raised by queues, the registry and worker pools.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Invalid options, duplicate handler registration, missing handler.
    /// Fatal at setup time and never retried.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl QueueError {
    /// Configuration failures prevent the affected queue from accepting work.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfiguration(_) | Self::UnknownQueue(_)
        )
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }
}

/// Errors reported by a durable broker implementation.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Job not found: {0}")]
    NotFound(JobId),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BackendError {
    pub fn backend(error: impl std::fmt::Display) -> Self {
        Self::Backend(error.to_string())
    }
}

/// Failure of a single handler invocation.
///
/// All variants are treated the same way for retry accounting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// The handler reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The payload did not match the shape the handler expects.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Job timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),

    /// The handler panicked; the pool survives and counts it as a failure.
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(error: impl std::fmt::Display) -> Self {
        Self::Failed(error.to_string())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut(_))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        Self::InvalidPayload(error.to_string())
    }
}

//! Error types shared across ports and handlers.

use thiserror::Error;

use super::ids::TaskId;
use super::task::TaskType;

/// Failure of a store (task store or knowledge store).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    AlreadyExists(String),

    #[error("write rejected: {0}")]
    Rejected(String),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Failure of a model call.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("rate limited, retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("malformed output: {0}")]
    Malformed(String),
}

/// Failure surfaced by a task handler. Every variant goes through the
/// orchestrator's retry/backoff path.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler not found for task_type={0}")]
    MissingHandler(TaskType),

    #[error("invalid payload for {task_id}: {reason}")]
    InvalidPayload { task_id: TaskId, reason: String },

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("model: {0}")]
    Model(#[from] ModelError),

    #[error("{0}")]
    Other(String),
}

impl HandlerError {
    pub fn other(message: impl Into<String>) -> Self {
        HandlerError::Other(message.into())
    }
}

//! Error types shared across the server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Persistence failures from a `JobStore` or `DistributedLock`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error during {operation}: {message}")]
    Storage { operation: String, message: String },

    #[error("corrupt row: {0}")]
    Corruption(String),

    #[error("job {0} not found")]
    NotFound(i64),
}

impl StoreError {
    pub fn storage(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: err.to_string(),
        }
    }
}

/// Failures handing a job to a `TaskQueue`.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("no processor registered")]
    NoProcessor,

    #[error("broker error: {0}")]
    Broker(String),

    #[error("failed to serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outcome of a processor run that did not complete a review.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Worth retrying: diff fetch, engine call, network timeout.
    #[error("{0}")]
    Transient(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProcessError {
    pub fn transient(err: impl std::fmt::Display) -> Self {
        Self::Transient(err.to_string())
    }
}

/// Reasons an inbound webhook is rejected.
///
/// All of these are dropped without creating a job.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("authentication failed: {0}")]
    Unauthorized(&'static str),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("unsupported event: {0}")]
    UnsupportedEvent(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl IngestError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::ProjectNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidPayload(_) | Self::UnsupportedEvent(_) => StatusCode::BAD_REQUEST,
            Self::Store(_) | Self::Queue(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Never echo signatures or storage internals back to the sender.
        let message = match &self {
            Self::Unauthorized(_) => "Unauthorized".to_string(),
            Self::ProjectNotFound(_) => "Project not found".to_string(),
            Self::InvalidPayload(detail) => format!("Invalid payload: {}", detail),
            Self::UnsupportedEvent(event) => format!("Unsupported event: {}", event),
            Self::Store(_) | Self::Queue(_) => "Internal server error".to_string(),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

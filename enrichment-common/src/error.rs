use std::time::Duration;

use thiserror::Error;

/// Marker trait consulted by the retry harness to decide whether an
/// error is worth another attempt, rather than typing exceptions.
pub trait Retryable {
    fn is_retryable(&self) -> bool {
        false
    }
}

/// Errors surfaced by the two caches and the result store.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("a database error occurred reading/writing the cache")]
    Database(#[from] sqlx::Error),
    #[error("failed to (de)serialize a cached value")]
    Serde(#[from] serde_json::Error),
}

impl Retryable for CacheError {
    fn is_retryable(&self) -> bool {
        matches!(self, CacheError::Database(_))
    }
}

/// Errors surfaced by the paginated callback transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("the callback could not be delivered but may be retried: {source}")]
    Retryable {
        source: reqwest::Error,
        /// Parsed from a `Retry-After` response header, if the receiver sent
        /// one — captured before the response is converted into `source` via
        /// `error_for_status`, which discards headers.
        retry_after: Option<Duration>,
    },
    #[error("the callback was rejected by the receiver and cannot be retried: {0}")]
    NonRetryable(reqwest::Error),
    #[error("failed to build the outbound request")]
    Build(#[from] reqwest::Error),
    #[error("failed to sign the callback bearer token")]
    Sign(#[from] jsonwebtoken::errors::Error),
    #[error("failed to serialize the callback body")]
    Serde(#[from] serde_json::Error),
}

impl Retryable for TransportError {
    fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Retryable { .. })
    }
}

/// Errors surfaced by the task runner, mapped to HTTP status at the queue
/// delivery endpoint.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("task payload is invalid: {0}")]
    InvalidPayload(#[from] crate::model::TaskPayloadError),
    #[error("no handler registered for task_kind `{0}`")]
    UnknownTaskKind(String),
    #[error("the result store could not be read or written")]
    Store(#[from] CacheError),
    #[error("the callback transport failed after the result was stored")]
    TransportAfterStore(#[source] TransportError),
    #[error("the delivery exceeded its deadline")]
    DeadlineExceeded,
}

impl RunnerError {
    /// HTTP status the queue delivery endpoint should return for this error.
    pub fn status_code(&self) -> http::StatusCode {
        match self {
            RunnerError::InvalidPayload(_) => http::StatusCode::BAD_REQUEST,
            RunnerError::UnknownTaskKind(_) => http::StatusCode::NOT_FOUND,
            RunnerError::Store(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
            RunnerError::TransportAfterStore(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
            RunnerError::DeadlineExceeded => http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Errors surfaced by the warehouse client.
#[derive(Error, Debug)]
pub enum WarehouseError {
    #[error("a database error occurred")]
    Database(#[from] sqlx::Error),
    #[error("row exceeds the maximum single-row size and was not chunked by the caller")]
    RowTooLarge { bytes: usize, limit: usize },
}

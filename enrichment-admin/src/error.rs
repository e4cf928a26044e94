use thiserror::Error;

use enrichment_common::error::{CacheError, WarehouseError};

#[derive(Error, Debug)]
pub enum StartupError {
    #[error("failed to connect to the warehouse")]
    Warehouse(#[from] WarehouseError),
    #[error("failed to bind the HTTP listener")]
    Bind(#[from] std::io::Error),
}

/// Errors surfaced by the status/retry handlers, mapped to HTTP status.
#[derive(Error, Debug)]
pub enum AdminError {
    #[error("the warehouse could not be read")]
    Store(#[from] CacheError),
    #[error("no job found for the given identifier")]
    NotFound,
    #[error("the job's latest status is not `failed`, or its payload cannot be replayed")]
    NotRetryable,
}

impl AdminError {
    pub fn status_code(&self) -> http::StatusCode {
        match self {
            AdminError::Store(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
            AdminError::NotFound => http::StatusCode::NOT_FOUND,
            AdminError::NotRetryable => http::StatusCode::CONFLICT,
        }
    }
}

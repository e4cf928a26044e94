use thiserror::Error;

use enrichment_common::error::WarehouseError;
use enrichment_common::http_pool::HttpPoolError;

/// Startup-time errors, surfaced as exit code 1.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("failed to connect to the warehouse")]
    Warehouse(#[from] WarehouseError),
    #[error("failed to build the shared HTTP client pool")]
    HttpPool(#[from] HttpPoolError),
    #[error("failed to run database migrations")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("failed to bind the HTTP listener")]
    Bind(#[from] std::io::Error),
}

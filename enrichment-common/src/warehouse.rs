//! Thin adapter over the Postgres-backed warehouse pool shared by every
//! persistence table: caches, the idempotency store, and the raw-data audit
//! trail.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::error::WarehouseError;

/// Single warehouse row cap; larger logical payloads are chunked by the
/// idempotency store before ever reaching this client.
pub const MAX_ROW_BYTES: usize = 900_000;

#[derive(Clone)]
pub struct WarehouseClient {
    pool: PgPool,
    max_batch_rows: usize,
}

impl WarehouseClient {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        max_batch_rows: usize,
    ) -> Result<Self, WarehouseError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool, max_batch_rows })
    }

    pub fn from_pool(pool: PgPool, max_batch_rows: usize) -> Self {
        Self { pool, max_batch_rows }
    }

    /// Reads and parameterized queries run directly against this pool via
    /// `sqlx::query`/`query_as`, so typed callers never interpolate values.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn max_batch_rows(&self) -> usize {
        self.max_batch_rows
    }

    /// Splits `rows` into batches of at most `max_batch_rows` and hands each
    /// batch to `write_batch`, so large appends are batched automatically
    /// without every call site re-deriving the chunk size.
    pub async fn append_rows<T, F, Fut>(
        &self,
        rows: Vec<T>,
        mut write_batch: F,
    ) -> Result<(), WarehouseError>
    where
        F: FnMut(Vec<T>) -> Fut,
        Fut: std::future::Future<Output = Result<(), sqlx::Error>>,
    {
        let batch_size = self.max_batch_rows.max(1);
        let mut iter = rows.into_iter();
        loop {
            let batch: Vec<T> = (&mut iter).take(batch_size).collect();
            if batch.is_empty() {
                break;
            }
            write_batch(batch).await?;
        }
        Ok(())
    }

    pub fn assert_row_fits(bytes: usize) -> Result<(), WarehouseError> {
        if bytes > MAX_ROW_BYTES {
            Err(WarehouseError::RowTooLarge {
                bytes,
                limit: MAX_ROW_BYTES,
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_size_guard() {
        assert!(WarehouseClient::assert_row_fits(100).is_ok());
        assert!(WarehouseClient::assert_row_fits(MAX_ROW_BYTES + 1).is_err());
    }
}

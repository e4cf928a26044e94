//! Process-wide HTTP client pool shared by the caches and the callback
//! transport.
//!
//! `reqwest::Client` is already internally reference-counted and connection
//! pooling, so the pool's job is twofold: configure per-host/idle limits on
//! one shared client, built once and cloned everywhere it's needed, and
//! enforce a total in-flight request ceiling via a semaphore, since reqwest
//! has no such global knob.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum HttpPoolError {
    #[error("failed to build the shared HTTP client")]
    Build(#[from] reqwest::Error),
}

/// A permit proving the holder has reserved a slot in the pool's concurrency
/// budget. Dropping it (including on an error path) releases the slot.
pub struct PoolPermit<'a> {
    _permit: SemaphorePermit<'a>,
}

pub struct HttpClientPool {
    client: reqwest::Client,
    semaphore: Semaphore,
}

impl HttpClientPool {
    pub fn new(
        max_connections: usize,
        per_host: usize,
        request_timeout: Duration,
    ) -> Result<Self, HttpPoolError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(per_host)
            .timeout(request_timeout)
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .build()?;

        Ok(Self {
            client,
            semaphore: Semaphore::new(max_connections),
        })
    }

    /// Acquires a concurrency slot and returns the shared client plus the
    /// permit. Callers must hold the permit for the duration of the request
    /// and release it (by dropping) on every exit path, including errors.
    pub async fn acquire(&self) -> (reqwest::Client, PoolPermit<'_>) {
        let permit = self
            .semaphore
            .acquire()
            .await
            .expect("HttpClientPool semaphore is never closed before shutdown");
        (self.client.clone(), PoolPermit { _permit: permit })
    }

    /// Fraction of the concurrency budget currently in use, exposed as a
    /// saturation gauge by the metrics module.
    pub fn saturation_percent(&self, total_permits: usize) -> f64 {
        if total_permits == 0 {
            return 0.0;
        }
        let available = self.semaphore.available_permits();
        let in_use = total_permits.saturating_sub(available);
        (in_use as f64 / total_permits as f64) * 100.0
    }

    /// Waits for all outstanding permits to return, up to `grace`. Returns
    /// `true` if the pool fully drained, `false` if the grace window elapsed
    /// with requests still in flight (shutdown proceeds regardless).
    pub async fn drain(&self, total_permits: usize, grace: Duration) -> bool {
        let acquire_all = self.semaphore.acquire_many(total_permits as u32);
        match tokio::time::timeout(grace, acquire_all).await {
            Ok(Ok(permits)) => {
                drop(permits);
                true
            }
            Ok(Err(_)) => true,
            Err(_) => {
                warn!("HTTP pool did not drain within the shutdown grace window");
                false
            }
        }
    }
}

pub type SharedHttpClientPool = Arc<HttpClientPool>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_round_trips_a_usable_client() {
        let pool = HttpClientPool::new(2, 1, Duration::from_secs(5)).unwrap();
        let (_client, _permit) = pool.acquire().await;
        assert_eq!(pool.saturation_percent(2), 50.0);
    }

    #[tokio::test]
    async fn drain_succeeds_when_nothing_in_flight() {
        let pool = HttpClientPool::new(2, 1, Duration::from_secs(5)).unwrap();
        assert!(pool.drain(2, Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn drain_times_out_with_permit_held() {
        let pool = HttpClientPool::new(1, 1, Duration::from_secs(5)).unwrap();
        let (_client, permit) = pool.acquire().await;
        assert!(!pool.drain(1, Duration::from_millis(50)).await);
        drop(permit);
    }
}

//! Graceful-shutdown wiring for the queue delivery endpoint, split out of
//! `main.rs` to keep lifecycle glue out of the startup sequence.

use std::time::Duration;

use enrichment_common::http_pool::HttpClientPool;
use enrichment_common::metrics::record_pool_saturation;
use tokio::signal;
use tracing::info;

/// Resolves once SIGINT or SIGTERM is received, so callers can pass this to
/// `axum::serve(..).with_graceful_shutdown(..)`.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, starting graceful shutdown"),
        _ = terminate => info!("received SIGTERM, starting graceful shutdown"),
    }
}

/// Drains the shared HTTP client pool once the listener has stopped
/// accepting new connections, giving in-flight callbacks up to `grace` to
/// complete before the process exits.
pub async fn drain_http_pool(pool: &HttpClientPool, total_permits: usize, grace: Duration) {
    record_pool_saturation(pool.saturation_percent(total_permits));
    if pool.drain(total_permits, grace).await {
        info!("HTTP pool drained cleanly before shutdown");
    } else {
        info!("HTTP pool shutdown grace window elapsed with requests still in flight");
    }
}

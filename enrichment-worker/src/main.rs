mod config;
mod error;
mod handlers;
mod lifecycle;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use envconfig::Envconfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use enrichment_common::auth::{CallbackTokenSigner, QueueTokenVerifier};
use enrichment_common::cache::{AiResponseCache, ApiResponseCache};
use enrichment_common::callback::CallbackTransport;
use enrichment_common::handler::HandlerContext;
use enrichment_common::health::HealthRegistry;
use enrichment_common::http_pool::HttpClientPool;
use enrichment_common::raw_data::RawDataStore;
use enrichment_common::registry::TaskRegistry;
use enrichment_common::result_store::ResultStore;
use enrichment_common::runner::Runner;
use enrichment_common::warehouse::WarehouseClient;

use config::Config;
use error::StartupError;
use handlers::app::AppState;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Config::init_from_env()?;
    if let Err(err) = run(config).await {
        tracing::error!(error = %err, "fatal startup error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(config: Config) -> Result<(), StartupError> {
    let common = &config.common;

    let warehouse = WarehouseClient::connect(
        &common.database_url,
        common.max_pg_connections,
        common.warehouse_max_batch_rows,
    )
    .await?;
    sqlx::migrate!("../enrichment-common/migrations")
        .run(warehouse.pool())
        .await?;

    let http_pool = Arc::new(HttpClientPool::new(
        common.http_max_connections,
        common.http_per_host,
        common.http_request_timeout_ms.0,
    )?);

    let api_cache = Arc::new(ApiResponseCache::new(warehouse.clone()));
    let ai_cache = Arc::new(AiResponseCache::new(warehouse.clone()));
    let handler_ctx = HandlerContext::new(http_pool.clone(), api_cache, ai_cache);

    let signer = CallbackTokenSigner::new(&common.callback_signing_key, &common.queue_issuer);
    let transport = CallbackTransport::new(http_pool.clone(), signer, common.callback_url.clone());

    let result_store = ResultStore::new(warehouse.clone());
    let raw_data = RawDataStore::new(warehouse.clone());
    let registry = TaskRegistry::new(enrichment_handlers_example::handlers());
    let runner = Arc::new(Runner::new(registry, result_store, raw_data, transport, handler_ctx));

    let verifier = Arc::new(QueueTokenVerifier::new(
        &common.queue_verification_key,
        &common.queue_issuer,
        &common.queue_audience,
    ));

    let health = HealthRegistry::new("readiness");
    let queue_health = health
        .register(
            "queue_endpoint".to_owned(),
            time::Duration::seconds(common.default_task_deadline_seconds.0.as_secs() as i64 * 2),
        )
        .await;
    queue_health.report_healthy().await;

    let state = AppState {
        runner,
        verifier,
        task_deadline: common.default_task_deadline_seconds.0,
        health,
    };

    let app = handlers::app::add_routes(Router::new(), state)
        .merge(enrichment_common::metrics::setup_metrics_router());

    let listener = tokio::net::TcpListener::bind(config.bind()).await?;
    tracing::info!(addr = %config.bind(), "queue delivery endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(lifecycle::shutdown_signal())
        .await?;

    lifecycle::drain_http_pool(
        &http_pool,
        common.http_max_connections,
        Duration::from_secs(common.shutdown_grace_seconds.0.as_secs()),
    )
    .await;

    Ok(())
}

mod config;
mod error;
mod handlers;

use axum::Router;
use envconfig::Envconfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use enrichment_common::auth::QueueTokenSigner;
use enrichment_common::raw_data::RawDataStore;
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

    let state = AppState {
        raw_data: RawDataStore::new(warehouse),
        http_client: reqwest::Client::new(),
        worker_base_url: common.worker_base_url.clone(),
        queue_signer: QueueTokenSigner::new(
            &common.queue_verification_key,
            &common.queue_issuer,
            &common.queue_audience,
        ),
    };

    let app = handlers::app::add_routes(Router::new(), state)
        .merge(enrichment_common::metrics::setup_metrics_router());

    let listener = tokio::net::TcpListener::bind(config.bind()).await?;
    tracing::info!(addr = %config.bind(), "admin/status API listening");

    axum::serve(listener, app).await?;
    Ok(())
}

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use futures::future::ready;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use replay_ingestion::{Config, ReplayIngestionService};

const DURATION_BUCKETS_MS: &[f64] = &[
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

pub async fn index() -> &'static str {
    "replay ingestion service"
}

fn setup_metrics_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets(DURATION_BUCKETS_MS)
        .context("invalid histogram buckets")?
        .install_recorder()
        .context("failed to install metrics recorder")?;
    Ok(handle)
}

fn start_server(config: &Config, recorder: PrometheusHandle) -> JoinHandle<()> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(|| ready("ok")))
        .route("/metrics", get(move || ready(recorder.render())));

    let bind = config.bind_address();

    tokio::task::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&bind).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind {bind}: {e:#}");
                return;
            }
        };
        if let Err(e) = axum::serve(listener, router).await {
            error!("Metrics server failed: {e:#}");
        }
    })
}

fn init_tracing(json: bool) {
    let log_layer = if json {
        fmt::layer()
            .with_target(true)
            .json()
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    };
    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;

    init_tracing(config.log_json);
    info!("Starting replay ingestion service");

    let recorder = setup_metrics_recorder()?;
    let server_handle = start_server(&config, recorder);
    info!("Started metrics server on {}", config.bind_address());

    let service = ReplayIngestionService::new(config)
        .await
        .context("Failed to create replay ingestion service")?;

    // Blocks until shutdown
    service.run().await?;

    server_handle.abort();
    Ok(())
}

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use envconfig::Envconfig;
use futures::future::ready;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tx_stream::config::Config;
use tx_stream::metrics::{serve, setup_metrics_routes};
use tx_stream::service::TxStreamService;

pub async fn index() -> &'static str {
    "tx-stream service"
}

fn start_server(config: &Config) -> Result<JoinHandle<()>> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(|| ready("ok")));
    let router = setup_metrics_routes(router).context("Failed to install metrics recorder")?;

    let bind = config.bind();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!(error = ?e, "Metrics server stopped");
        }
    }))
}

/// Cancel `shutdown` on the first SIGINT or SIGTERM
fn handle_signals(shutdown: CancellationToken) -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => info!("Received SIGINT, shutting down"),
            _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
        }
        shutdown.cancel();
    });

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting tx-stream service");

    let config = Config::init_from_env()
        .context("Failed to load configuration from environment variables")?;

    info!("Configuration loaded: {:?}", config);

    let server_handle = start_server(&config)?;
    info!("Started metrics server on {}", config.bind());

    let shutdown = CancellationToken::new();
    handle_signals(shutdown.clone())?;

    let service = TxStreamService::new(config)
        .context("Failed to create tx-stream service. Check your Kafka connection.")?;

    service.run(shutdown).await?;

    server_handle.abort();
    info!("tx-stream stopped");

    Ok(())
}

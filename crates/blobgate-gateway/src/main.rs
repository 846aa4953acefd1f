//! BlobGate gateway server

use std::path::PathBuf;

use anyhow::Context;
use blobgate_gateway::{BlobGateway, GatewayConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => GatewayConfig::load(&path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => GatewayConfig::default(),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    tracing::info!(
        processors = config.processors.len(),
        backends = config.backends.len(),
        "BlobGate gateway starting..."
    );

    let gateway = BlobGateway::new(config)?;
    gateway.start();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    let canceled = gateway.shutdown().await;
    tracing::info!(canceled, "BlobGate gateway stopped");
    tracing::debug!("final counters\n{}", gateway.counters().to_prometheus());
    Ok(())
}

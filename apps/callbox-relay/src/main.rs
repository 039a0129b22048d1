use anyhow::{Context, Result};
use callbox_relay::{server, telemetry::Telemetry, Cli, RelayConfig, RelayState};
use clap::Parser;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RelayConfig::try_from(cli)?;
    let telemetry = Telemetry::init(config.log_format)?;

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!(listen_addr = %config.listen_addr, "callbox relay listening");

    server::serve(
        listener,
        RelayState::new(),
        Some(telemetry.metrics_handle()),
        shutdown_signal(),
    )
    .await
    .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

//! Simulated boat controller
//!
//! Serves the same WebSocket endpoint as the onboard controller: a counter
//! frame every tick, and every JSON command echoed back to all clients.
//!
//! ```bash
//! boatsim --listen 127.0.0.1:8001 --interval-ms 500
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use relayd::sim::{DeviceSimulator, DEFAULT_SIM_ADDR, DEFAULT_TICK};

/// Simulated boat controller
#[derive(Parser, Debug)]
#[command(name = "boatsim", version, about)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = DEFAULT_SIM_ADDR)]
    listen: SocketAddr,

    /// WebSocket path
    #[arg(long, default_value = "/ws")]
    path: String,

    /// Milliseconds between counter frames
    #[arg(short, long, default_value_t = DEFAULT_TICK.as_millis() as u64)]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("relayd=info".parse()?))
        .init();

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Error waiting for Ctrl+C");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let simulator = DeviceSimulator::bind(
        args.listen,
        args.path,
        Duration::from_millis(args.interval_ms),
        cancel_token,
    )
    .await
    .context("Failed to start device simulator")?;

    simulator.run().await.context("Device simulator failed")?;
    Ok(())
}

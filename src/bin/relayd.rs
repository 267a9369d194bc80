//! Boat relay gateway
//!
//! Keeps one WebSocket link to the boat and relays its telemetry to every
//! connected client; authenticated crew members can send commands back.
//!
//! # Usage
//!
//! ```bash
//! # Run with the default or configured settings
//! relayd
//!
//! # Run with an explicit config file and upstream override
//! relayd run --config relayd.toml --upstream ws://boat.local:8001/ws
//!
//! # Print the allow-list digest for a crew member
//! relayd digest --username skipper
//! ```

use std::io::{self, BufRead};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use relayd::credentials::CredentialDigest;
use relayd::{Gateway, RelayConfig};

/// Boat relay gateway
#[derive(Parser, Debug)]
#[command(name = "relayd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway (default)
    Run {
        /// Configuration file (defaults to <config dir>/boatrelay/relayd.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Address to listen on, overriding the configuration
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// Upstream WebSocket URL, overriding the configuration
        #[arg(short, long)]
        upstream: Option<String>,
    },

    /// Print the credential digest for a crew member
    Digest {
        #[arg(short, long)]
        username: String,

        /// Read from stdin when omitted
        #[arg(short, long)]
        password: Option<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        None => run_gateway(None, None, None),
        Some(Command::Run {
            config,
            listen,
            upstream,
        }) => run_gateway(config, listen, upstream),
        Some(Command::Digest { username, password }) => print_digest(&username, password),
    }
}

fn print_digest(username: &str, password: Option<String>) -> Result<()> {
    let password = match password {
        Some(password) => password,
        None => {
            let mut line = String::new();
            io::stdin()
                .lock()
                .read_line(&mut line)
                .context("Failed to read password from stdin")?;
            line.trim_end_matches(['\r', '\n']).to_string()
        }
    };
    if password.is_empty() {
        bail!("Password must not be empty");
    }

    println!("{}", CredentialDigest::from_password(username, &password).to_hex());
    Ok(())
}

fn run_gateway(
    config_path: Option<PathBuf>,
    listen: Option<SocketAddr>,
    upstream: Option<String>,
) -> Result<()> {
    let mut config =
        RelayConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
    if let Some(addr) = listen {
        config.listen_addr = addr;
    }
    if let Some(url) = upstream {
        config.upstream.url = url;
    }
    config.validate().context("Invalid configuration")?;

    run_async(config)
}

#[tokio::main]
async fn run_async(config: RelayConfig) -> Result<()> {
    let level = config.log.level.as_str();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("relayd={level}").parse()?)
                .add_directive(format!("relay_core={level}").parse()?)
                .add_directive(format!("relay_protocol={level}").parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        upstream = %config.upstream.url,
        "Boat relay starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let gateway = Gateway::start(&config, cancel_token)
        .await
        .context("Failed to start gateway")?;
    info!(addr = %gateway.local_addr()?, "Gateway started");

    if let Err(e) = gateway.run().await {
        error!(error = %e, "Gateway error");
        return Err(e.into());
    }

    info!("Boat relay stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

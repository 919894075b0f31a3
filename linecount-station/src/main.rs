//! LineCount station - main entry point
//!
//! Reads one scan record per line from stdin and prints the outcome as JSON.
//! Background sync runs until stdin closes or a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use linecount_common::config::StationConfig;
use linecount_common::SystemClock;
use linecount_station::{remote, CounterService, JsonNormalizer};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for linecount-station
#[derive(Parser, Debug)]
#[command(name = "linecount-station")]
#[command(about = "Production line unit counter")]
#[command(version)]
struct Args {
    /// Config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local database file
    #[arg(long, env = "LINECOUNT_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Remote store URL (mysql://... or sqlite:...)
    #[arg(long, env = "LINECOUNT_REMOTE_URL")]
    remote_url: Option<String>,

    /// Line assumed for scans that do not name one
    #[arg(short, long, default_value = "M1", env = "LINECOUNT_LINE")]
    line: String,
}

#[derive(Serialize)]
struct OutputLine<'a> {
    line: &'a str,
    code: &'static str,
    message: String,
    #[serde(flatten)]
    outcome: &'a linecount_station::ScanOutcome,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "linecount_station=info,linecount_common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let (mut config, source) = StationConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    match &source {
        Some(path) => info!("Configuration loaded from {}", path.display()),
        None => info!("No config file found, using defaults"),
    }
    if args.db_path.is_some() {
        config.local.db_path = args.db_path.clone();
    }
    if args.remote_url.is_some() {
        config.remote.url = args.remote_url.clone();
    }

    let remote = remote::connect(&config.remote)
        .await
        .context("Failed to set up remote store")?;
    if remote.is_none() {
        warn!("No remote store configured, running local-only");
    }

    let service = CounterService::start(config, remote, Arc::new(JsonNormalizer), Arc::new(SystemClock))
        .await
        .context("Failed to start station")?;

    let default_line = args.line.trim().to_uppercase();
    info!(line = %default_line, "Reading scans from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            next = lines.next_line() => {
                let Some(raw) = next.context("Failed to read stdin")? else {
                    info!("Input closed");
                    break;
                };
                if raw.trim().is_empty() {
                    continue;
                }
                let outcome = service.submit_scan(&raw, &default_line).await;
                let output = OutputLine {
                    line: &default_line,
                    code: outcome.reason_code(),
                    message: outcome.describe(raw.trim()),
                    outcome: &outcome,
                };
                println!("{}", serde_json::to_string(&output).context("Failed to encode outcome")?);
            }
        }
    }

    let drained = service.shutdown().await;
    info!(cycles = drained.cycles, units = drained.units, increments = drained.increments, "Shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}

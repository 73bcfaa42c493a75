//! Operator binary: run the ingestion pipeline against a serial port and log
//! every emitted credit.

use anyhow::Context;
use clap::Parser;
use pulse_ingest::config::PulseConfig;
use pulse_ingest::orchestrator::PulseOrchestrator;
use pulse_ingest::store::JsonlStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Ingest payment pulses from an acceptor controller board.
#[derive(Debug, Parser)]
#[command(name = "pulse_ingest", version, about)]
struct Cli {
    /// Serial port of the controller board (e.g. /dev/ttyACM0).
    port: String,

    /// Optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path of the processed-id ledger file.
    #[arg(long, default_value = "processed_ids.jsonl")]
    ledger: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PulseConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => PulseConfig::default(),
    };

    let store = Arc::new(
        JsonlStore::open(&cli.ledger)
            .await
            .with_context(|| format!("opening ledger {}", cli.ledger.display()))?,
    );
    let orchestrator = PulseOrchestrator::new(config, store);
    orchestrator.initialize().await?;

    let mut credits = orchestrator.subscribe();
    orchestrator.start(&cli.port).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            delta = credits.recv() => match delta {
                Ok(delta) => info!(
                    accepter = %delta.accepter,
                    amount = delta.amount,
                    raw_count = delta.raw_count,
                    "credit"
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "credit subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    orchestrator.shutdown(Duration::from_secs(5)).await;
    Ok(())
}

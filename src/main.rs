//! Trade Orchestrator
//!
//! Runs the event bus and analysis-service layer of the trading core.

use clap::{Parser, Subcommand};
use serde_json::json;
use std::time::Duration;
use trade_orchestrator::{
    config::Config,
    events::{into_payload, Event, EventType},
    Orchestrator,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "trade-orchestrator")]
#[command(about = "Event bus and analysis-service orchestration for trading decisions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path; default locations are searched when omitted
    #[arg(short, long)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator until Ctrl-C
    Run {
        /// Override the number of general workers
        #[arg(short, long)]
        workers: Option<usize>,
        /// Publish a sample decision request periodically
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    match cli.command {
        Commands::Run { workers, dry_run } => run(config, workers, dry_run).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run(mut config: Config, workers: Option<usize>, dry_run: bool) -> anyhow::Result<()> {
    if let Some(workers) = workers {
        config.bus.worker_count = workers;
    }

    tracing::info!("Starting trade orchestrator with {} workers", config.bus.worker_count);
    if dry_run {
        tracing::warn!("DRY RUN mode - scripted providers, sample requests every 5s");
    }

    let services = Orchestrator::scripted_services(&config);
    let orchestrator = Orchestrator::new(config, services).await?;
    orchestrator.start().await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Ctrl-C received");
                break;
            }
            _ = ticker.tick(), if dry_run => {
                let request = Event::new(
                    EventType::AiDecisionRequest,
                    "dry_run",
                    into_payload(json!({ "symbol": "005930", "price": 70000 })),
                );
                if !orchestrator.bus().publish(request).await {
                    tracing::warn!("Sample request was not queued");
                }

                let metrics = orchestrator.bus().metrics();
                tracing::info!(
                    "published={} processed={} failed={} retried={}",
                    metrics.events_published,
                    metrics.events_processed,
                    metrics.events_failed,
                    metrics.events_retried
                );
            }
        }
    }

    orchestrator.shutdown().await?;
    tracing::info!("Shutdown complete");
    Ok(())
}

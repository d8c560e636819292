//! Logrelay Worker - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use logrelay_common::logging::{init_logging, LogConfig, LogLevel};
use tracing::{error, info};

use logrelay_worker::{config::Config, mode, ProcessMode, Supervisor};

/// Consume job log parts from the queue, store them and push them to viewers
#[derive(Debug, Parser)]
#[command(name = "logrelay-worker", version, about)]
struct Cli {
    /// Pipeline to run
    #[arg(long, value_enum, env = "LOGRELAY_PROCESS", default_value_t = ProcessMode::Streaming)]
    process: ProcessMode,

    /// Number of concurrent workers (overrides LOGRELAY_WORKERS)
    #[arg(long)]
    workers: Option<usize>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut builder = LogConfig::builder()
        .log_file_prefix("logrelay-worker")
        .filter_directives("logrelay_worker=debug,sqlx=warn,lapin=info");
    if cli.verbose {
        builder = builder.level(LogLevel::Debug);
    }

    // Environment variables take precedence
    let log_config = builder.build().merge_env()?;
    let _guard = init_logging(&log_config)?;

    info!(mode = %cli.process, "Starting logrelay worker");

    let result = match cli.process {
        ProcessMode::Streaming => run_streaming(cli.workers).await,
        ProcessMode::Aggregate => mode::run_aggregate().context("Aggregation mode"),
    };

    if let Err(e) = &result {
        error!("Worker failed: {:#}", e);
    }
    result
}

async fn run_streaming(workers: Option<usize>) -> Result<()> {
    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(workers) = workers {
        config.worker.workers = workers;
        config.validate().context("Invalid --workers")?;
    }
    info!(
        queue = %config.broker.queue,
        workers = config.worker.workers,
        prefetch = config.broker.prefetch(config.worker.workers),
        "Configuration loaded"
    );

    Supervisor::new(config)
        .run()
        .await
        .context("Streaming pipeline failed")?;

    info!("Worker shut down gracefully");
    Ok(())
}

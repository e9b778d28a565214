//! Bulk Worker - Background Runner Entry Point
//!
//! Drains the bulk work queue. `migrate`, `enqueue` and `reap` are one-shot
//! maintenance commands against the same database.

use anyhow::Context;
use clap::{Parser, Subcommand};
use ferrum_bulk_queue::{plan_units, PostgresWorkQueue, WorkQueue};
use ferrum_bulk_worker::{
    background::run_background,
    config::Config,
    logging, reaper,
    state::{create_pool, WorkerState},
};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "bulk-worker", version, about = "Bulk FHIR import/export worker")]
struct Cli {
    /// Configuration file (defaults to ./bulk-worker.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start runners, reaper and metrics listener (default)
    Run,
    /// Create or upgrade the work queue tables
    Migrate,
    /// Split a surrogate-id range into work units and enqueue them
    Enqueue {
        #[arg(long)]
        resource_type_id: i16,
        #[arg(long)]
        min: i64,
        #[arg(long)]
        max: i64,
        #[arg(long, default_value_t = 10_000)]
        unit_size: i64,
    },
    /// Run one recovery pass over abandoned units
    Reap {
        /// Overrides reaper.lease_timeout_seconds
        #[arg(long)]
        lease_timeout_seconds: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load_from(cli.config.as_deref()).context("Failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Migrate => {
            logging::init_simple_logging();
            let queue = open_queue(&config).await?;
            queue.migrate().await.context("Failed to run migrations")?;
            tracing::info!("Migrations applied");
            Ok(())
        }
        Command::Enqueue {
            resource_type_id,
            min,
            max,
            unit_size,
        } => {
            logging::init_simple_logging();
            anyhow::ensure!(unit_size > 0, "--unit-size must be positive");
            anyhow::ensure!(min <= max, "--min ({min}) must not exceed --max ({max})");
            let queue = open_queue(&config).await?;
            let units = plan_units(resource_type_id, min, max, unit_size);
            let created = queue
                .enqueue(&units)
                .await
                .context("Failed to enqueue work units")?;
            tracing::info!(
                resource_type_id,
                min,
                max,
                units = created.len(),
                "Enqueued work units"
            );
            Ok(())
        }
        Command::Reap {
            lease_timeout_seconds,
        } => {
            logging::init_simple_logging();
            let queue = open_queue(&config).await?;
            let lease_timeout = Duration::from_secs(
                lease_timeout_seconds.unwrap_or(config.reaper.lease_timeout_seconds),
            );
            let requeued = reaper::reap_once(&queue, lease_timeout)
                .await
                .context("Recovery pass failed")?;
            tracing::info!(requeued, "Recovery pass complete");
            Ok(())
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let _telemetry_guard =
        logging::init_logging(&config.logging).context("Failed to initialize logging/telemetry")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = config.logging.deployment_environment,
        "Starting bulk worker"
    );

    let state = WorkerState::new(config)
        .await
        .context("Failed to initialize worker state")?;

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    run_background(state, cancel)
        .await
        .context("Background tasks failed")?;

    tracing::info!("Bulk worker shutdown complete");
    Ok(())
}

async fn open_queue(config: &Config) -> anyhow::Result<PostgresWorkQueue> {
    let pool = create_pool(&config.database)
        .await
        .context("Failed to connect to database")?;
    let queue = PostgresWorkQueue::new(
        pool,
        config.queue.number_of_partitions,
        config.queue.call_budgets(),
    )?;
    Ok(queue)
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler, only SIGINT will stop the worker");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, starting graceful shutdown...");
        }
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received, starting graceful shutdown...");
        }
    }
}

/// Wait for shutdown signal (SIGINT only on non-Unix platforms)
#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown...");
}

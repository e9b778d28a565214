//! Background tasks and runner management
//!
//! Starts the runner tasks, the reaper and the metrics listener, then waits
//! for all of them to wind down after shutdown is requested.

use crate::{
    reaper::{run_reaper, ReaperSettings},
    server,
    state::WorkerState,
    workers::{spawn_runners, ExportProcessor, RunnerContext, UnitProcessor, WorkerRunnerConfig},
    Error, Result,
};
use ferrum_bulk_queue::WorkQueue;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Run every enabled background task until `cancel` fires.
pub async fn run_background(state: WorkerState, cancel: CancellationToken) -> Result<()> {
    let config = state.config.clone();
    let mut handles: Vec<JoinHandle<Result<()>>> = Vec::new();

    if config.metrics.enabled {
        let addr = config.metrics_addr().map_err(Error::Config)?;
        let token = cancel.clone();
        handles.push(tokio::spawn(async move {
            server::serve(addr, token).await.map_err(Error::from)
        }));
    }

    if config.reaper.enabled {
        let queue: Arc<dyn WorkQueue> = state.queue.clone();
        handles.push(tokio::spawn(run_reaper(
            queue,
            ReaperSettings::from_config(&config.reaper),
            cancel.clone(),
        )));
    }

    let processor: Arc<dyn UnitProcessor> =
        Arc::new(ExportProcessor::new(&config.export.output_dir));

    if config.workers.enabled {
        processor.start().await?;

        let ctx = RunnerContext::new(state.queue.clone(), processor.clone())?;
        let identity = config.worker_identity();
        let runner_config = WorkerRunnerConfig::from_config(&config.workers);

        tracing::info!(
            identity = %identity,
            concurrency = config.workers.concurrency,
            number_of_partitions = config.queue.number_of_partitions,
            thread_affinity = config.workers.thread_affinity,
            processor = processor.name(),
            "Starting runners"
        );

        handles.extend(spawn_runners(
            ctx,
            &identity,
            config.workers.concurrency,
            runner_config,
            cancel.clone(),
        ));
    } else {
        tracing::info!("Runners disabled by configuration");
    }

    for result in futures::future::join_all(handles).await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Background task failed"),
            Err(e) => tracing::error!(error = %e, "Background task panicked"),
        }
    }

    if config.workers.enabled {
        processor.stop().await?;
    }

    tracing::info!("Background tasks stopped");
    Ok(())
}

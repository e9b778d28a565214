//! Runner that claims work units from the queue and drives a processor over them

use super::base::{UnitProcessor, UnitProgress};
use crate::{metrics, Error, Result};
use ferrum_bulk_queue::{BulkDataReader, Claim, PartitionAllocator, WorkQueue, WorkUnit};
use std::sync::Arc;
use tokio::{
    task::JoinHandle,
    time::{interval_at, sleep, Duration, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct WorkerRunnerConfig {
    pub thread_affinity: bool,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub reconnect_jitter_ratio: f64,
    pub process_max_attempts: u32,
    pub complete_max_attempts: u32,
}

impl WorkerRunnerConfig {
    pub fn from_config(config: &crate::config::WorkerConfig) -> Self {
        Self {
            thread_affinity: config.thread_affinity,
            poll_interval: Duration::from_secs(config.poll_interval_seconds),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_seconds),
            reconnect_initial: Duration::from_secs(config.reconnect_initial_seconds),
            reconnect_max: Duration::from_secs(config.reconnect_max_seconds),
            reconnect_jitter_ratio: config.reconnect_jitter_ratio,
            process_max_attempts: config.process_max_attempts,
            complete_max_attempts: config.complete_max_attempts,
        }
    }
}

impl Default for WorkerRunnerConfig {
    fn default() -> Self {
        Self::from_config(&crate::config::WorkerConfig::default())
    }
}

/// Queue, reader, allocator and processor shared by every runner task.
#[derive(Clone)]
pub struct RunnerContext {
    pub queue: Arc<dyn WorkQueue>,
    pub reader: Arc<dyn BulkDataReader>,
    pub allocator: Arc<PartitionAllocator>,
    pub processor: Arc<dyn UnitProcessor>,
}

impl RunnerContext {
    /// Context over a store that is both the queue and the payload source.
    pub fn new<S>(store: Arc<S>, processor: Arc<dyn UnitProcessor>) -> Result<Self>
    where
        S: WorkQueue + BulkDataReader + 'static,
    {
        let allocator = PartitionAllocator::new(store.number_of_partitions())?;
        Ok(Self {
            queue: store.clone(),
            reader: store,
            allocator: Arc::new(allocator),
            processor,
        })
    }
}

fn jittered_duration(base: Duration, jitter_ratio: f64) -> Duration {
    if base.is_zero() || jitter_ratio <= 0.0 {
        return base;
    }

    let value = Uuid::new_v4().as_u128() as u64;
    let unit = (value as f64) / (u64::MAX as f64); // [0,1]
    let signed = unit * 2.0 - 1.0; // [-1,1]
    let factor = (1.0 + signed * jitter_ratio).max(0.0);
    base.mul_f64(factor)
}

/// Exponential backoff with jitter, reset after a successful call.
struct Backoff {
    initial: Duration,
    max: Duration,
    jitter_ratio: f64,
    current: Duration,
}

impl Backoff {
    fn new(config: &WorkerRunnerConfig) -> Self {
        Self {
            initial: config.reconnect_initial,
            max: config.reconnect_max,
            jitter_ratio: config.reconnect_jitter_ratio,
            current: config.reconnect_initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = jittered_duration(self.current, self.jitter_ratio);
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Sleep for `duration`. Returns `false` if cancelled first.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(duration) => true,
    }
}

/// Poll the queue until `cancel` fires.
pub async fn run_worker(
    ctx: RunnerContext,
    worker_id: String,
    index: usize,
    config: WorkerRunnerConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let hint = config.thread_affinity.then_some(index as u64);

    tracing::info!(
        worker = %worker_id,
        processor = ctx.processor.name(),
        sticky = hint.is_some(),
        "Runner started"
    );

    let mut backoff = Backoff::new(&config);

    while !cancel.is_cancelled() {
        let start = ctx.allocator.next_partition(hint);

        match ctx.queue.dequeue(start, &worker_id, &cancel).await {
            Ok(Some(unit)) => {
                backoff.reset();
                metrics::UNITS_CLAIMED_TOTAL
                    .with_label_values(&[unit.partition_id.to_string().as_str()])
                    .inc();
                run_unit(&ctx, &worker_id, unit, &config, &cancel).await;
            }
            Ok(None) => {
                metrics::DEQUEUE_EMPTY_TOTAL.inc();
                tracing::trace!(worker = %worker_id, start_partition = start, "No pending units");
                if !pause(config.poll_interval, &cancel).await {
                    break;
                }
            }
            Err(e) => {
                let e = Error::from(e);
                if e.is_cancelled() {
                    break;
                }
                metrics::record_store_error("dequeue", &e);
                let delay = backoff.next_delay();
                tracing::error!(
                    worker = %worker_id,
                    error = %e,
                    transient = e.is_transient(),
                    "Dequeue failed (retrying in {:?})",
                    delay
                );
                if !pause(delay, &cancel).await {
                    break;
                }
            }
        }
    }

    tracing::info!(worker = %worker_id, "Runner stopped");
    Ok(())
}

enum UnitOutcome {
    Finished { failed: bool, resource_count: i64 },
    LeaseLost,
    Interrupted,
}

async fn run_unit(
    ctx: &RunnerContext,
    worker_id: &str,
    unit: WorkUnit,
    config: &WorkerRunnerConfig,
    cancel: &CancellationToken,
) {
    let resource_type = unit.resource_type_id.to_string();
    let claim = unit.claim_by(worker_id);
    let started = Instant::now();
    metrics::UNITS_IN_FLIGHT.inc();

    tracing::info!(
        worker = %worker_id,
        partition_id = unit.partition_id,
        unit_id = unit.unit_id,
        resource_type_id = unit.resource_type_id,
        min_surrogate_id = unit.min_surrogate_id,
        max_surrogate_id = unit.max_surrogate_id,
        redelivery_count = unit.redelivery_count,
        "Claimed work unit"
    );

    match process_with_lease(ctx, &unit, &claim, config, cancel).await {
        UnitOutcome::Finished {
            failed,
            resource_count,
        } => {
            match complete_with_retry(ctx.queue.as_ref(), &claim, failed, resource_count, config, cancel)
                .await
            {
                Ok(true) => {
                    let status = record_unit_finished(&resource_type, failed, resource_count);
                    tracing::info!(
                        worker = %worker_id,
                        partition_id = unit.partition_id,
                        unit_id = unit.unit_id,
                        resource_count,
                        status,
                        "Work unit finished"
                    );
                }
                Ok(false) => {
                    tracing::warn!(
                        worker = %worker_id,
                        partition_id = unit.partition_id,
                        unit_id = unit.unit_id,
                        "Work unit no longer held by this runner, completion skipped"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        worker = %worker_id,
                        partition_id = unit.partition_id,
                        unit_id = unit.unit_id,
                        error = %e,
                        "Failed to complete work unit, leaving it for redelivery"
                    );
                }
            }
        }
        UnitOutcome::LeaseLost => {
            tracing::warn!(
                worker = %worker_id,
                partition_id = unit.partition_id,
                unit_id = unit.unit_id,
                "Lease lost, abandoned work unit"
            );
        }
        UnitOutcome::Interrupted => {
            tracing::info!(
                worker = %worker_id,
                partition_id = unit.partition_id,
                unit_id = unit.unit_id,
                "Shutdown interrupted work unit, leaving it for redelivery"
            );
        }
    }

    metrics::UNITS_IN_FLIGHT.dec();
    metrics::UNIT_DURATION_SECONDS
        .with_label_values(&[resource_type.as_str()])
        .observe(started.elapsed().as_secs_f64());
}

/// Count a recorded completion. Payloads of failed units are not counted as
/// read. Returns the status label.
fn record_unit_finished(resource_type: &str, failed: bool, resource_count: i64) -> &'static str {
    let status = if failed { "failed" } else { "completed" };
    metrics::UNITS_COMPLETED_TOTAL
        .with_label_values(&[resource_type, status])
        .inc();
    if !failed {
        metrics::PAYLOADS_READ_TOTAL
            .with_label_values(&[resource_type])
            .inc_by(resource_count.max(0) as u64);
    }
    status
}

/// Run the processor while a heartbeat task keeps the claim alive.
async fn process_with_lease(
    ctx: &RunnerContext,
    unit: &WorkUnit,
    claim: &Claim,
    config: &WorkerRunnerConfig,
    cancel: &CancellationToken,
) -> UnitOutcome {
    let progress = UnitProgress::new();
    let unit_cancel = cancel.child_token();

    let heartbeat = tokio::spawn(heartbeat_loop(
        ctx.queue.clone(),
        claim.clone(),
        progress.clone(),
        config.heartbeat_interval,
        unit_cancel.clone(),
    ));

    let result = process_attempts(ctx, unit, config, &progress, &unit_cancel).await;

    unit_cancel.cancel();
    let lease_lost = matches!(heartbeat.await, Ok(true));

    if lease_lost {
        return UnitOutcome::LeaseLost;
    }

    match result {
        Ok(()) => UnitOutcome::Finished {
            failed: false,
            resource_count: progress.count(),
        },
        Err(_) if cancel.is_cancelled() => UnitOutcome::Interrupted,
        Err(e) => {
            tracing::error!(
                partition_id = unit.partition_id,
                unit_id = unit.unit_id,
                processor = ctx.processor.name(),
                error = %e,
                "Work unit processing failed"
            );
            UnitOutcome::Finished {
                failed: true,
                resource_count: progress.count(),
            }
        }
    }
}

/// Each attempt re-reads the whole range; the processor overwrites its output.
async fn process_attempts(
    ctx: &RunnerContext,
    unit: &WorkUnit,
    config: &WorkerRunnerConfig,
    progress: &UnitProgress,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut backoff = Backoff::new(config);
    let mut attempt = 1;

    loop {
        progress.reset();
        let payloads = ctx.reader.read_range(
            unit.resource_type_id,
            unit.min_surrogate_id,
            unit.max_surrogate_id,
            cancel.clone(),
        );

        match ctx.processor.process(unit, payloads, progress, cancel).await {
            Ok(()) => return Ok(()),
            Err(e)
                if e.is_transient()
                    && attempt < config.process_max_attempts
                    && !cancel.is_cancelled() =>
            {
                metrics::record_store_error("read_range", &e);
                let delay = backoff.next_delay();
                tracing::warn!(
                    partition_id = unit.partition_id,
                    unit_id = unit.unit_id,
                    attempt,
                    error = %e,
                    "Transient failure while processing work unit (retrying in {:?})",
                    delay
                );
                if !pause(delay, cancel).await {
                    return Err(e);
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Heartbeat every `period` until cancelled. Returns `true` if the lease was
/// lost (reset by the reaper or claimed by someone else), after cancelling
/// the unit's processing.
async fn heartbeat_loop(
    queue: Arc<dyn WorkQueue>,
    claim: Claim,
    progress: UnitProgress,
    period: Duration,
    cancel: CancellationToken,
) -> bool {
    let (partition_id, unit_id) = (claim.partition_id, claim.unit_id);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = ticker.tick() => {}
        }

        match queue.heartbeat_claim(&claim, Some(progress.count()), &cancel).await {
            Ok(true) => {
                metrics::HEARTBEATS_TOTAL.with_label_values(&["ok"]).inc();
                tracing::debug!(partition_id, unit_id, resource_count = progress.count(), "Heartbeat");
            }
            Ok(false) => {
                metrics::HEARTBEATS_TOTAL.with_label_values(&["lost"]).inc();
                cancel.cancel();
                return true;
            }
            Err(e) => {
                let e = Error::from(e);
                if e.is_cancelled() {
                    return false;
                }
                metrics::HEARTBEATS_TOTAL.with_label_values(&["error"]).inc();
                metrics::record_store_error("heartbeat", &e);
                tracing::warn!(partition_id, unit_id, error = %e, "Heartbeat failed");
            }
        }
    }
}

/// Completion runs under its own token; `shutdown` only stops the retries.
async fn complete_with_retry(
    queue: &dyn WorkQueue,
    claim: &Claim,
    failed: bool,
    resource_count: i64,
    config: &WorkerRunnerConfig,
    shutdown: &CancellationToken,
) -> Result<bool> {
    let token = CancellationToken::new();
    let mut backoff = Backoff::new(config);
    let mut attempt = 1;

    loop {
        match queue.complete_claim(claim, failed, Some(resource_count), &token).await {
            Ok(done) => return Ok(done),
            Err(e) => {
                let e = Error::from(e);
                metrics::record_store_error("complete", &e);
                if !e.is_transient() || attempt >= config.complete_max_attempts {
                    return Err(e);
                }
                let delay = backoff.next_delay();
                tracing::warn!(
                    partition_id = claim.partition_id,
                    unit_id = claim.unit_id,
                    attempt,
                    error = %e,
                    "Complete failed (retrying in {:?})",
                    delay
                );
                if !pause(delay, shutdown).await {
                    return Err(e);
                }
                attempt += 1;
            }
        }
    }
}

/// Spawn `concurrency` runner tasks. Task `i` reports as `<identity>#<i>`.
pub fn spawn_runners(
    ctx: RunnerContext,
    identity: &str,
    concurrency: usize,
    config: WorkerRunnerConfig,
    cancel: CancellationToken,
) -> Vec<JoinHandle<Result<()>>> {
    (0..concurrency)
        .map(|index| {
            let ctx = ctx.clone();
            let worker_id = format!("{identity}#{index}");
            let cfg = config.clone();
            let token = cancel.clone();
            tokio::spawn(async move { run_worker(ctx, worker_id, index, cfg, token).await })
        })
        .collect()
}

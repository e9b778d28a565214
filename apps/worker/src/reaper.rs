//! Recovery of abandoned work units
//!
//! A unit whose worker died stays InProgress with a stale heartbeat. The
//! reaper hands such units back to Pending so another worker picks them up.

use crate::{metrics, Error, Result};
use ferrum_bulk_queue::WorkQueue;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct ReaperSettings {
    pub interval: Duration,
    pub lease_timeout: Duration,
}

impl ReaperSettings {
    pub fn from_config(config: &crate::config::ReaperConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_seconds),
            lease_timeout: Duration::from_secs(config.lease_timeout_seconds),
        }
    }
}

/// One recovery pass. Returns how many units went back to Pending.
pub async fn reap_once(queue: &dyn WorkQueue, lease_timeout: Duration) -> Result<u64> {
    let older_than = chrono::Duration::from_std(lease_timeout)
        .map_err(|e| Error::Config(format!("lease timeout out of range: {e}")))?;

    let requeued = queue.requeue_abandoned(older_than).await?;
    if requeued > 0 {
        metrics::UNITS_REQUEUED_TOTAL.inc_by(requeued);
        tracing::warn!(requeued, "Requeued abandoned work units");
    } else {
        tracing::debug!("No abandoned work units");
    }
    Ok(requeued)
}

/// Run `reap_once` every interval until cancelled. Failed passes are logged
/// and retried on the next tick.
pub async fn run_reaper(
    queue: Arc<dyn WorkQueue>,
    settings: ReaperSettings,
    cancel: CancellationToken,
) -> Result<()> {
    tracing::info!(
        interval = ?settings.interval,
        lease_timeout = ?settings.lease_timeout,
        "Reaper started"
    );

    let mut ticker = interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Err(e) = reap_once(queue.as_ref(), settings.lease_timeout).await {
            metrics::record_store_error("requeue_abandoned", &e);
            tracing::error!(error = %e, "Reaper pass failed");
        }
    }

    tracing::info!("Reaper stopped");
    Ok(())
}

//! Unit processor trait and per-unit progress

use crate::Result;
use async_trait::async_trait;
use ferrum_bulk_queue::{PayloadStream, WorkUnit};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Does the actual work for a claimed unit.
///
/// The runner owns the claim: it heartbeats while `process` runs and
/// completes the unit afterwards. A processor may be invoked again for the
/// same unit (retry after a transient failure, or redelivery after a lost
/// lease), so its output must tolerate being rewritten.
#[async_trait]
pub trait UnitProcessor: Send + Sync {
    /// Get processor name for logging
    fn name(&self) -> &str;

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Consume `payloads` for `unit`, recording each handled resource in
    /// `progress`.
    async fn process(
        &self,
        unit: &WorkUnit,
        payloads: PayloadStream,
        progress: &UnitProgress,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Running resource count of the unit being processed, shared with the
/// heartbeat task.
#[derive(Debug, Clone, Default)]
pub struct UnitProgress {
    count: Arc<AtomicI64>,
}

impl UnitProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, resources: i64) {
        self.count.fetch_add(resources, Ordering::Relaxed);
    }

    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Relaxed)
    }

    pub(crate) fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
    }
}

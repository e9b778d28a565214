//! Store-facing traits for the bulk work queue

use crate::{
    models::{Claim, NewWorkUnit, PartitionId, StoredPayload, SurrogateId, WorkUnit},
    Result,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

/// Lazy, finite sequence of payloads for one surrogate-id range.
pub type PayloadStream = BoxStream<'static, Result<StoredPayload>>;

/// Durable table of work units and the claim protocol over it.
///
/// The store is the only point of mutual exclusion between workers: every
/// state transition happens in a single atomic round trip.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Number of partitions dequeue scans wrap around.
    fn number_of_partitions(&self) -> PartitionId;

    /// Insert Pending units. The store assigns `unit_id` and places each unit
    /// in partition `unit_id mod number_of_partitions`.
    ///
    /// # Errors
    /// * `MalformedRange` - if any unit has `min > max`; nothing is inserted
    async fn enqueue(&self, units: &[NewWorkUnit]) -> Result<Vec<WorkUnit>>;

    /// Claim the next Pending unit, scanning from `start_partition` and
    /// wrapping around the partition space.
    ///
    /// # Returns
    /// * `Ok(Some(unit))` - the unit, now InProgress and owned by `worker`
    /// * `Ok(None)` - nothing Pending anywhere; poll again later
    async fn dequeue(
        &self,
        start_partition: PartitionId,
        worker: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<WorkUnit>>;

    /// Refresh the liveness timestamp of an InProgress unit without touching
    /// its status. `None` keeps the previously recorded count.
    ///
    /// Returns `false` if the unit is not InProgress (nothing was written).
    async fn heartbeat(
        &self,
        partition_id: PartitionId,
        unit_id: i64,
        resource_count: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<bool>;

    /// Move an InProgress unit to Completed or Failed.
    ///
    /// Returns `false` without writing when the unit is not InProgress, so a
    /// repeated call never regresses or overwrites a terminal unit.
    async fn complete(
        &self,
        partition_id: PartitionId,
        unit_id: i64,
        failed: bool,
        resource_count: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<bool>;

    /// [`heartbeat`](Self::heartbeat) that only succeeds while `claim` is
    /// still the unit's current delivery.
    ///
    /// Returns `false` once the unit was reset and handed to another worker
    /// (or redelivered to the same one), which a runner treats as lost lease.
    async fn heartbeat_claim(
        &self,
        claim: &Claim,
        resource_count: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<bool>;

    /// [`complete`](Self::complete) that only succeeds while `claim` is still
    /// the unit's current delivery. A stale worker can never overwrite the
    /// live claim of another.
    async fn complete_claim(
        &self,
        claim: &Claim,
        failed: bool,
        resource_count: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<bool>;

    async fn get_unit(&self, partition_id: PartitionId, unit_id: i64) -> Result<Option<WorkUnit>>;

    /// Return InProgress units whose last heartbeat is older than
    /// `older_than` to Pending for redelivery. Returns how many were reset.
    async fn requeue_abandoned(&self, older_than: chrono::Duration) -> Result<u64>;
}

/// Streams raw resource payloads out of the store.
pub trait BulkDataReader: Send + Sync {
    /// Every payload of `resource_type_id` with a surrogate id in
    /// `[min, max]`, ascending.
    ///
    /// Nothing is read until the stream is first polled. The store connection
    /// lives exactly as long as the stream. Calling again with the same bounds
    /// reads the same data.
    fn read_range(
        &self,
        resource_type_id: i16,
        min: SurrogateId,
        max: SurrogateId,
        cancel: CancellationToken,
    ) -> PayloadStream;
}

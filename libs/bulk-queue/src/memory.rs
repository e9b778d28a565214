//! In-process work queue
//!
//! Backs tests and single-process deployments. A single async mutex over the
//! unit table stands in for the store's atomic claim.

use crate::{
    bounded::{bounded, CallBudgets},
    models::{
        Claim, NewWorkUnit, PartitionId, StoredPayload, SurrogateId, WorkUnit, WorkUnitStatus,
    },
    partition::scan_rank,
    traits::{BulkDataReader, PayloadStream, WorkQueue},
    Error, Result,
};
use async_stream::try_stream;
use async_trait::async_trait;
use chrono::Utc;
use futures::Stream;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

type ResourceTable = BTreeMap<(i16, SurrogateId), Vec<u8>>;

struct UnitTable {
    next_unit_id: i64,
    units: BTreeMap<(PartitionId, i64), WorkUnit>,
}

#[derive(Clone)]
pub struct InMemoryWorkQueue {
    number_of_partitions: PartitionId,
    budgets: CallBudgets,
    units: Arc<Mutex<UnitTable>>,
    resources: Arc<RwLock<ResourceTable>>,
}

impl InMemoryWorkQueue {
    pub fn new(number_of_partitions: PartitionId) -> Result<Self> {
        Self::with_budgets(number_of_partitions, CallBudgets::default())
    }

    pub fn with_budgets(number_of_partitions: PartitionId, budgets: CallBudgets) -> Result<Self> {
        if number_of_partitions < 1 {
            return Err(Error::InvalidConfig(format!(
                "number_of_partitions must be at least 1, got {}",
                number_of_partitions
            )));
        }

        Ok(Self {
            number_of_partitions,
            budgets,
            units: Arc::new(Mutex::new(UnitTable {
                next_unit_id: 1,
                units: BTreeMap::new(),
            })),
            resources: Arc::new(RwLock::new(BTreeMap::new())),
        })
    }

    /// Store a raw payload for later range reads. Overwrites an existing
    /// payload at the same position.
    pub async fn put_resource(
        &self,
        resource_type_id: i16,
        surrogate_id: SurrogateId,
        data: Vec<u8>,
    ) {
        self.resources
            .write()
            .await
            .insert((resource_type_id, surrogate_id), data);
    }

    /// Insert a unit at a fixed identity, bypassing id assignment.
    pub async fn insert_unit(
        &self,
        partition_id: PartitionId,
        unit_id: i64,
        unit: NewWorkUnit,
    ) -> Result<WorkUnit> {
        unit.validate()?;
        let mut table = self.units.lock().await;
        table.next_unit_id = table.next_unit_id.max(unit_id + 1);
        let row = pending_unit(partition_id, unit_id, &unit);
        table.units.insert(row.key(), row.clone());
        Ok(row)
    }

    /// Snapshot of every unit, ordered by `(partition_id, unit_id)`.
    pub async fn units(&self) -> Vec<WorkUnit> {
        self.units.lock().await.units.values().cloned().collect()
    }

    async fn touch(
        &self,
        key: (PartitionId, i64),
        claim: Option<&Claim>,
        resource_count: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        bounded(cancel, self.budgets.heartbeat, async {
            let mut table = self.units.lock().await;
            match table.units.get_mut(&key) {
                Some(unit) if is_held(unit, claim) => {
                    unit.heartbeat_at = Some(Utc::now());
                    if resource_count.is_some() {
                        unit.resource_count = resource_count;
                    }
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
        .await
    }

    async fn finish(
        &self,
        key: (PartitionId, i64),
        claim: Option<&Claim>,
        failed: bool,
        resource_count: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        bounded(cancel, self.budgets.complete, async {
            let mut table = self.units.lock().await;
            match table.units.get_mut(&key) {
                Some(unit) if is_held(unit, claim) => {
                    let now = Utc::now();
                    unit.status = WorkUnitStatus::terminal(failed);
                    unit.completed_at = Some(now);
                    unit.heartbeat_at = Some(now);
                    if resource_count.is_some() {
                        unit.resource_count = resource_count;
                    }
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
        .await
    }
}

/// InProgress, and still under `claim` when one is given.
fn is_held(unit: &WorkUnit, claim: Option<&Claim>) -> bool {
    unit.status == WorkUnitStatus::InProgress
        && claim.map_or(true, |c| {
            unit.worker.as_deref() == Some(c.worker.as_str())
                && unit.redelivery_count == c.redelivery_count
        })
}

fn pending_unit(partition_id: PartitionId, unit_id: i64, unit: &NewWorkUnit) -> WorkUnit {
    WorkUnit {
        unit_id,
        partition_id,
        resource_type_id: unit.resource_type_id,
        min_surrogate_id: unit.min_surrogate_id,
        max_surrogate_id: unit.max_surrogate_id,
        status: WorkUnitStatus::Pending,
        worker: None,
        resource_count: None,
        redelivery_count: 0,
        created_at: Utc::now(),
        started_at: None,
        heartbeat_at: None,
        completed_at: None,
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    fn number_of_partitions(&self) -> PartitionId {
        self.number_of_partitions
    }

    async fn enqueue(&self, units: &[NewWorkUnit]) -> Result<Vec<WorkUnit>> {
        for unit in units {
            unit.validate()?;
        }

        let mut table = self.units.lock().await;
        let mut created = Vec::with_capacity(units.len());
        for unit in units {
            let unit_id = table.next_unit_id;
            table.next_unit_id += 1;
            let partition_id = (unit_id % self.number_of_partitions as i64) as PartitionId;
            let row = pending_unit(partition_id, unit_id, unit);
            table.units.insert(row.key(), row.clone());
            created.push(row);
        }

        tracing::debug!(count = created.len(), "Enqueued work units");
        Ok(created)
    }

    async fn dequeue(
        &self,
        start_partition: PartitionId,
        worker: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<WorkUnit>> {
        let n = self.number_of_partitions;
        bounded(cancel, self.budgets.dequeue, async {
            let mut table = self.units.lock().await;
            let key = table
                .units
                .values()
                .filter(|u| u.status == WorkUnitStatus::Pending)
                .min_by_key(|u| (scan_rank(u.partition_id, start_partition, n), u.unit_id))
                .map(WorkUnit::key);

            let Some(key) = key else {
                return Ok(None);
            };

            let now = Utc::now();
            let claimed = table.units.get_mut(&key).map(|unit| {
                unit.status = WorkUnitStatus::InProgress;
                unit.worker = Some(worker.to_string());
                unit.resource_count = None;
                unit.started_at = Some(now);
                unit.heartbeat_at = Some(now);
                unit.clone()
            });
            Ok(claimed)
        })
        .await
    }

    async fn heartbeat(
        &self,
        partition_id: PartitionId,
        unit_id: i64,
        resource_count: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.touch((partition_id, unit_id), None, resource_count, cancel).await
    }

    async fn complete(
        &self,
        partition_id: PartitionId,
        unit_id: i64,
        failed: bool,
        resource_count: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.finish((partition_id, unit_id), None, failed, resource_count, cancel).await
    }

    async fn heartbeat_claim(
        &self,
        claim: &Claim,
        resource_count: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.touch(
            (claim.partition_id, claim.unit_id),
            Some(claim),
            resource_count,
            cancel,
        )
        .await
    }

    async fn complete_claim(
        &self,
        claim: &Claim,
        failed: bool,
        resource_count: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.finish(
            (claim.partition_id, claim.unit_id),
            Some(claim),
            failed,
            resource_count,
            cancel,
        )
        .await
    }

    async fn get_unit(&self, partition_id: PartitionId, unit_id: i64) -> Result<Option<WorkUnit>> {
        Ok(self
            .units
            .lock()
            .await
            .units
            .get(&(partition_id, unit_id))
            .cloned())
    }

    async fn requeue_abandoned(&self, older_than: chrono::Duration) -> Result<u64> {
        let cutoff = Utc::now() - older_than;
        let mut table = self.units.lock().await;
        let mut requeued = 0;
        for unit in table.units.values_mut() {
            let stale = unit.status == WorkUnitStatus::InProgress
                && unit.heartbeat_at.map_or(true, |at| at < cutoff);
            if stale {
                unit.status = WorkUnitStatus::Pending;
                unit.worker = None;
                unit.started_at = None;
                unit.heartbeat_at = None;
                unit.redelivery_count += 1;
                requeued += 1;
            }
        }
        Ok(requeued)
    }
}

impl BulkDataReader for InMemoryWorkQueue {
    fn read_range(
        &self,
        resource_type_id: i16,
        min: SurrogateId,
        max: SurrogateId,
        cancel: CancellationToken,
    ) -> PayloadStream {
        Box::pin(stream_range(
            self.resources.clone(),
            self.budgets.read,
            resource_type_id,
            min,
            max,
            cancel,
        ))
    }
}

fn stream_range(
    resources: Arc<RwLock<ResourceTable>>,
    budget: Duration,
    resource_type_id: i16,
    min: SurrogateId,
    max: SurrogateId,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<StoredPayload>> + Send + 'static {
    try_stream! {
        if min <= max {
            let snapshot: Vec<StoredPayload> = bounded(&cancel, budget, async {
                let table = resources.read().await;
                let payloads: Vec<StoredPayload> = table
                    .range((resource_type_id, min)..=(resource_type_id, max))
                    .map(|(&(_, surrogate_id), data)| StoredPayload {
                        surrogate_id,
                        data: data.clone(),
                    })
                    .collect();
                Ok::<_, Error>(payloads)
            })
            .await?;

            for payload in snapshot {
                if cancel.is_cancelled() {
                    Err::<(), _>(Error::Cancelled)?;
                }
                yield payload;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn unit(resource_type_id: i16, min: i64, max: i64) -> NewWorkUnit {
        NewWorkUnit {
            resource_type_id,
            min_surrogate_id: min,
            max_surrogate_id: max,
        }
    }

    #[tokio::test]
    async fn enqueue_assigns_partition_from_unit_id() {
        let queue = InMemoryWorkQueue::new(4).unwrap();
        let units = queue
            .enqueue(&[unit(1, 0, 9), unit(1, 10, 19), unit(1, 20, 29), unit(1, 30, 39)])
            .await
            .unwrap();

        let keys: Vec<_> = units.iter().map(WorkUnit::key).collect();
        assert_eq!(keys, vec![(1, 1), (2, 2), (3, 3), (0, 4)]);
        assert!(units.iter().all(|u| u.status == WorkUnitStatus::Pending));
    }

    #[tokio::test]
    async fn enqueue_rejects_malformed_range_atomically() {
        let queue = InMemoryWorkQueue::new(4).unwrap();
        let res = queue.enqueue(&[unit(1, 0, 9), unit(1, 20, 10)]).await;
        assert!(matches!(res, Err(Error::MalformedRange { .. })));
        assert!(queue.units().await.is_empty());
    }

    #[tokio::test]
    async fn dequeue_prefers_start_partition_then_wraps() {
        let queue = InMemoryWorkQueue::new(4).unwrap();
        let cancel = CancellationToken::new();
        queue.insert_unit(0, 10, unit(1, 0, 9)).await.unwrap();
        queue.insert_unit(1, 11, unit(1, 10, 19)).await.unwrap();
        queue.insert_unit(3, 12, unit(1, 20, 29)).await.unwrap();

        let first = queue.dequeue(2, "w", &cancel).await.unwrap().unwrap();
        assert_eq!(first.key(), (3, 12));
        let second = queue.dequeue(2, "w", &cancel).await.unwrap().unwrap();
        assert_eq!(second.key(), (0, 10));
        let third = queue.dequeue(2, "w", &cancel).await.unwrap().unwrap();
        assert_eq!(third.key(), (1, 11));
        assert!(queue.dequeue(2, "w", &cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dequeue_within_partition_is_oldest_first() {
        let queue = InMemoryWorkQueue::new(2).unwrap();
        let cancel = CancellationToken::new();
        queue.insert_unit(1, 9, unit(1, 90, 99)).await.unwrap();
        queue.insert_unit(1, 3, unit(1, 30, 39)).await.unwrap();

        let claimed = queue.dequeue(1, "w", &cancel).await.unwrap().unwrap();
        assert_eq!(claimed.unit_id, 3);
    }

    #[tokio::test]
    async fn units_from_larger_partition_count_remain_claimable() {
        let queue = InMemoryWorkQueue::new(4).unwrap();
        let cancel = CancellationToken::new();
        queue.insert_unit(13, 1, unit(1, 0, 9)).await.unwrap();

        let claimed = queue.dequeue(0, "w", &cancel).await.unwrap().unwrap();
        assert_eq!(claimed.key(), (13, 1));
    }

    #[tokio::test]
    async fn cancelled_dequeue_leaves_unit_pending() {
        let queue = InMemoryWorkQueue::new(4).unwrap();
        queue.insert_unit(0, 1, unit(1, 0, 9)).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let res = queue.dequeue(0, "w", &cancel).await;
        assert!(matches!(res, Err(Error::Cancelled)));
        let stored = queue.get_unit(0, 1).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkUnitStatus::Pending);
        assert!(stored.worker.is_none());
    }

    #[tokio::test]
    async fn stale_claim_cannot_touch_a_reclaimed_unit() {
        let queue = InMemoryWorkQueue::new(1).unwrap();
        let cancel = CancellationToken::new();
        queue.insert_unit(0, 1, unit(1, 0, 9)).await.unwrap();

        let first = queue.dequeue(0, "worker-a", &cancel).await.unwrap().unwrap();
        let stale = first.claim_by("worker-a");
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(queue.requeue_abandoned(chrono::Duration::zero()).await.unwrap(), 1);
        let second = queue.dequeue(0, "worker-b", &cancel).await.unwrap().unwrap();
        let live = second.claim_by("worker-b");

        assert!(!queue.heartbeat_claim(&stale, Some(3), &cancel).await.unwrap());
        assert!(!queue.complete_claim(&stale, true, Some(3), &cancel).await.unwrap());
        let stored = queue.get_unit(0, 1).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkUnitStatus::InProgress);
        assert_eq!(stored.worker.as_deref(), Some("worker-b"));
        assert_eq!(stored.resource_count, None);

        assert!(queue.heartbeat_claim(&live, Some(4), &cancel).await.unwrap());
        assert!(queue.complete_claim(&live, false, Some(10), &cancel).await.unwrap());
        let stored = queue.get_unit(0, 1).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkUnitStatus::Completed);
        assert_eq!(stored.resource_count, Some(10));
    }

    #[tokio::test]
    async fn same_worker_redelivery_invalidates_the_old_claim() {
        let queue = InMemoryWorkQueue::new(1).unwrap();
        let cancel = CancellationToken::new();
        queue.insert_unit(0, 1, unit(1, 0, 9)).await.unwrap();

        let first = queue.dequeue(0, "w", &cancel).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        queue.requeue_abandoned(chrono::Duration::zero()).await.unwrap();
        let second = queue.dequeue(0, "w", &cancel).await.unwrap().unwrap();

        assert!(!queue.heartbeat_claim(&first.claim_by("w"), None, &cancel).await.unwrap());
        assert!(queue.heartbeat_claim(&second.claim_by("w"), None, &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn read_range_is_inclusive_ordered_and_typed() {
        let queue = InMemoryWorkQueue::new(1).unwrap();
        for id in [5, 1, 3, 7, 9] {
            queue.put_resource(2, id, vec![id as u8]).await;
        }
        queue.put_resource(4, 3, b"other".to_vec()).await;

        let ids: Vec<i64> = queue
            .read_range(2, 3, 7, CancellationToken::new())
            .map_ok(|p| p.surrogate_id)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(ids, vec![3, 5, 7]);
    }

    #[tokio::test]
    async fn read_range_empty_when_inverted() {
        let queue = InMemoryWorkQueue::new(1).unwrap();
        queue.put_resource(2, 5, vec![1]).await;

        let payloads: Vec<_> = queue
            .read_range(2, 6, 5, CancellationToken::new())
            .try_collect()
            .await
            .unwrap();
        assert!(payloads.is_empty());
    }
}

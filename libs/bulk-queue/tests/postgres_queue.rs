#![allow(unused)]
mod support;

use ferrum_bulk_queue::{
    plan_units, BulkDataReader, Error, NewWorkUnit, PartitionAllocator, WorkQueue, WorkUnitStatus,
};
use futures::{StreamExt, TryStreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use support::with_test_queue;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Claiming
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dequeues_never_share_a_unit() -> anyhow::Result<()> {
    with_test_queue(16, |t| {
        Box::pin(async move {
            t.queue.enqueue(&plan_units(1, 0, 2_999, 25)).await?;
            let allocator = Arc::new(PartitionAllocator::new(16)?);

            let handles: Vec<_> = (0..8)
                .map(|worker| {
                    let queue = t.queue.clone();
                    let allocator = allocator.clone();
                    tokio::spawn(async move {
                        let cancel = CancellationToken::new();
                        let identity = format!("pg-test:1#{}", worker);
                        let mut claimed = Vec::new();
                        loop {
                            let start = allocator.next_partition(None);
                            match queue.dequeue(start, &identity, &cancel).await? {
                                Some(unit) => claimed.push(unit.key()),
                                None => break,
                            }
                        }
                        Ok::<_, Error>(claimed)
                    })
                })
                .collect();

            let mut seen = HashSet::new();
            for handle in handles {
                for key in handle.await?? {
                    assert!(seen.insert(key), "unit {:?} claimed twice", key);
                }
            }
            assert_eq!(seen.len(), 120);
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn single_pending_unit_goes_to_exactly_one_of_two_workers() -> anyhow::Result<()> {
    with_test_queue(16, |t| {
        Box::pin(async move {
            t.insert_unit(3, 5, 1, 0, 99).await?;
            let cancel = CancellationToken::new();

            let (a, b) = tokio::join!(
                t.queue.dequeue(0, "worker-a", &cancel),
                t.queue.dequeue(1, "worker-b", &cancel)
            );
            let results = [a?, b?];
            let claimed: Vec<_> = results.iter().flatten().collect();
            assert_eq!(claimed.len(), 1);
            assert_eq!(claimed[0].key(), (3, 5));
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn dequeue_scans_from_start_partition_and_wraps() -> anyhow::Result<()> {
    with_test_queue(4, |t| {
        Box::pin(async move {
            t.insert_unit(0, 10, 1, 0, 9).await?;
            t.insert_unit(1, 11, 1, 10, 19).await?;
            t.insert_unit(3, 12, 1, 20, 29).await?;
            let cancel = CancellationToken::new();

            let mut order = Vec::new();
            while let Some(unit) = t.queue.dequeue(2, "w", &cancel).await? {
                order.push(unit.key());
            }
            assert_eq!(order, vec![(3, 12), (0, 10), (1, 11)]);
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn enqueue_assigns_ids_and_partitions() -> anyhow::Result<()> {
    with_test_queue(4, |t| {
        Box::pin(async move {
            let created = t.queue.enqueue(&plan_units(2, 1, 40, 10)).await?;
            assert_eq!(created.len(), 4);

            for unit in &created {
                assert_eq!(unit.partition_id as i64, unit.unit_id % 4);
                assert_eq!(unit.status, WorkUnitStatus::Pending);
            }
            let ranges: Vec<_> = created
                .iter()
                .map(|u| (u.min_surrogate_id, u.max_surrogate_id))
                .collect();
            assert_eq!(ranges, vec![(1, 10), (11, 20), (21, 30), (31, 40)]);

            let bad = t
                .queue
                .enqueue(&[NewWorkUnit {
                    resource_type_id: 2,
                    min_surrogate_id: 9,
                    max_surrogate_id: 1,
                }])
                .await;
            assert!(matches!(bad, Err(Error::MalformedRange { .. })));
            Ok(())
        })
    })
    .await
}

// ---------------------------------------------------------------------------
// Heartbeat, completion, recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn heartbeat_then_complete_records_final_count() -> anyhow::Result<()> {
    with_test_queue(16, |t| {
        Box::pin(async move {
            t.insert_unit(2, 7, 1, 100, 199).await?;
            let cancel = CancellationToken::new();

            let claimed = t.queue.dequeue(2, "w", &cancel).await?.expect("unit 7");
            assert_eq!(claimed.key(), (2, 7));

            assert!(t.queue.heartbeat(2, 7, Some(50), &cancel).await?);
            let mid = t.queue.get_unit(2, 7).await?.expect("unit 7");
            assert_eq!(mid.status, WorkUnitStatus::InProgress);
            assert_eq!(mid.resource_count, Some(50));

            assert!(t.queue.complete(2, 7, false, Some(100), &cancel).await?);
            let done = t.queue.get_unit(2, 7).await?.expect("unit 7");
            assert_eq!(done.status, WorkUnitStatus::Completed);
            assert_eq!(done.resource_count, Some(100));

            assert!(!t.queue.complete(2, 7, true, Some(1), &cancel).await?);
            let still = t.queue.get_unit(2, 7).await?.expect("unit 7");
            assert_eq!(still.status, WorkUnitStatus::Completed);
            assert_eq!(still.resource_count, Some(100));
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn abandoned_units_are_redelivered() -> anyhow::Result<()> {
    with_test_queue(4, |t| {
        Box::pin(async move {
            t.insert_unit(0, 1, 1, 0, 9).await?;
            let cancel = CancellationToken::new();
            t.queue.dequeue(0, "crashed", &cancel).await?;

            assert_eq!(t.queue.requeue_abandoned(chrono::Duration::hours(1)).await?, 0);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            assert_eq!(t.queue.requeue_abandoned(chrono::Duration::zero()).await?, 1);

            let unit = t.queue.get_unit(0, 1).await?.expect("unit");
            assert_eq!(unit.status, WorkUnitStatus::Pending);
            assert_eq!(unit.redelivery_count, 1);
            assert!(unit.worker.is_none());
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn stale_claim_cannot_overwrite_a_reclaimed_unit() -> anyhow::Result<()> {
    with_test_queue(4, |t| {
        Box::pin(async move {
            t.insert_unit(0, 1, 1, 0, 9).await?;
            let cancel = CancellationToken::new();

            let first = t.queue.dequeue(0, "worker-a", &cancel).await?.expect("unit");
            let stale = first.claim_by("worker-a");
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            assert_eq!(t.queue.requeue_abandoned(chrono::Duration::zero()).await?, 1);
            let second = t.queue.dequeue(0, "worker-b", &cancel).await?.expect("unit");
            let live = second.claim_by("worker-b");

            assert!(!t.queue.heartbeat_claim(&stale, Some(3), &cancel).await?);
            assert!(!t.queue.complete_claim(&stale, true, Some(3), &cancel).await?);
            let unit = t.queue.get_unit(0, 1).await?.expect("unit");
            assert_eq!(unit.status, WorkUnitStatus::InProgress);
            assert_eq!(unit.worker.as_deref(), Some("worker-b"));

            assert!(t.queue.heartbeat_claim(&live, Some(4), &cancel).await?);
            assert!(t.queue.complete_claim(&live, false, Some(10), &cancel).await?);
            let unit = t.queue.get_unit(0, 1).await?.expect("unit");
            assert_eq!(unit.status, WorkUnitStatus::Completed);
            assert_eq!(unit.resource_count, Some(10));
            Ok(())
        })
    })
    .await
}

// ---------------------------------------------------------------------------
// Range reads
// ---------------------------------------------------------------------------

#[tokio::test]
async fn read_range_yields_exact_set_in_order() -> anyhow::Result<()> {
    with_test_queue(1, |t| {
        Box::pin(async move {
            for id in [40i64, 10, 30, 20, 50] {
                t.put_resource(3, id, format!("r{}", id).as_bytes()).await?;
            }
            t.put_resource(4, 30, b"other").await?;

            let payloads: Vec<_> = t
                .queue
                .read_range(3, 20, 40, CancellationToken::new())
                .try_collect()
                .await?;
            let ids: Vec<_> = payloads.iter().map(|p| p.surrogate_id).collect();
            assert_eq!(ids, vec![20, 30, 40]);
            assert_eq!(payloads[1].data, b"r30".to_vec());

            let again: Vec<_> = t
                .queue
                .read_range(3, 20, 40, CancellationToken::new())
                .try_collect()
                .await?;
            assert_eq!(again, payloads);

            let inverted: Vec<_> = t
                .queue
                .read_range(3, 40, 20, CancellationToken::new())
                .try_collect()
                .await?;
            assert!(inverted.is_empty());
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn abandoned_read_returns_connection_to_pool() -> anyhow::Result<()> {
    with_test_queue(1, |t| {
        Box::pin(async move {
            for id in 0..20i64 {
                t.put_resource(3, id, b"x").await?;
            }

            // More abandoned streams than the pool has connections.
            for _ in 0..20 {
                let mut stream = t.queue.read_range(3, 0, 19, CancellationToken::new());
                stream.next().await.expect("payload")?;
            }

            let cancel = CancellationToken::new();
            let mut stream = t.queue.read_range(3, 0, 19, cancel.clone());
            stream.next().await.expect("payload")?;
            cancel.cancel();
            assert!(matches!(stream.next().await, Some(Err(Error::Cancelled))));
            drop(stream);

            let all: Vec<_> = t
                .queue
                .read_range(3, 0, 19, CancellationToken::new())
                .try_collect()
                .await?;
            assert_eq!(all.len(), 20);
            Ok(())
        })
    })
    .await
}

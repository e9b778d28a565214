//! PostgreSQL work queue
//!
//! Claims use `FOR UPDATE SKIP LOCKED` inside a single `UPDATE`, so concurrent
//! dequeues never block on, or double-claim, the same row.

use crate::{
    bounded::{bounded, CallBudgets},
    models::{
        Claim, NewWorkUnit, PartitionId, StoredPayload, SurrogateId, WorkUnit, WorkUnitStatus,
    },
    traits::{BulkDataReader, PayloadStream, WorkQueue},
    Error, Result,
};
use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use sqlx::PgPool;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct PostgresWorkQueue {
    pool: PgPool,
    number_of_partitions: PartitionId,
    budgets: CallBudgets,
}

impl PostgresWorkQueue {
    pub fn new(
        pool: PgPool,
        number_of_partitions: PartitionId,
        budgets: CallBudgets,
    ) -> Result<Self> {
        if number_of_partitions < 1 {
            return Err(Error::InvalidConfig(format!(
                "number_of_partitions must be at least 1, got {}",
                number_of_partitions
            )));
        }

        Ok(Self {
            pool,
            number_of_partitions,
            budgets,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create or upgrade the work-unit and resource tables.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    // Without a claim, any InProgress row matches.
    async fn touch(
        &self,
        (partition_id, unit_id): (PartitionId, i64),
        claim: Option<&Claim>,
        resource_count: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let now = chrono::Utc::now();

        bounded(cancel, self.budgets.heartbeat, async {
            let result = sqlx::query(
                r#"
                UPDATE bulk_work_units
                SET heartbeat_at = $3,
                    resource_count = COALESCE($4, resource_count)
                WHERE partition_id = $1
                  AND unit_id = $2
                  AND status = 'in_progress'
                  AND ($5::text IS NULL OR (worker = $5 AND redelivery_count = $6))
                "#,
            )
            .bind(partition_id)
            .bind(unit_id)
            .bind(now)
            .bind(resource_count)
            .bind(claim.map(|c| c.worker.as_str()))
            .bind(claim.map(|c| c.redelivery_count))
            .execute(&self.pool)
            .await
            .map_err(Error::from)?;

            Ok::<_, Error>(result.rows_affected() > 0)
        })
        .await
    }

    async fn finish(
        &self,
        (partition_id, unit_id): (PartitionId, i64),
        claim: Option<&Claim>,
        failed: bool,
        resource_count: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let now = chrono::Utc::now();
        let status = WorkUnitStatus::terminal(failed);

        bounded(cancel, self.budgets.complete, async {
            let result = sqlx::query(
                r#"
                UPDATE bulk_work_units
                SET status = $3,
                    completed_at = $4,
                    heartbeat_at = $4,
                    resource_count = COALESCE($5, resource_count)
                WHERE partition_id = $1
                  AND unit_id = $2
                  AND status = 'in_progress'
                  AND ($6::text IS NULL OR (worker = $6 AND redelivery_count = $7))
                "#,
            )
            .bind(partition_id)
            .bind(unit_id)
            .bind(status.as_str())
            .bind(now)
            .bind(resource_count)
            .bind(claim.map(|c| c.worker.as_str()))
            .bind(claim.map(|c| c.redelivery_count))
            .execute(&self.pool)
            .await
            .map_err(Error::from)?;

            Ok::<_, Error>(result.rows_affected() > 0)
        })
        .await
    }
}

#[async_trait]
impl WorkQueue for PostgresWorkQueue {
    fn number_of_partitions(&self) -> PartitionId {
        self.number_of_partitions
    }

    async fn enqueue(&self, units: &[NewWorkUnit]) -> Result<Vec<WorkUnit>> {
        for unit in units {
            unit.validate()?;
        }
        if units.is_empty() {
            return Ok(Vec::new());
        }

        let resource_type_ids: Vec<i16> = units.iter().map(|u| u.resource_type_id).collect();
        let mins: Vec<i64> = units.iter().map(|u| u.min_surrogate_id).collect();
        let maxes: Vec<i64> = units.iter().map(|u| u.max_surrogate_id).collect();

        // nextval in the inner select list runs once per input row.
        let created = sqlx::query_as::<_, WorkUnit>(
            r#"
            INSERT INTO bulk_work_units (
                unit_id, partition_id, resource_type_id,
                min_surrogate_id, max_surrogate_id, status, created_at
            )
            SELECT n.unit_id, (n.unit_id % $1)::smallint, n.rt, n.mn, n.mx, 'pending', now()
            FROM (
                SELECT nextval('bulk_work_unit_ids') AS unit_id, u.rt, u.mn, u.mx
                FROM UNNEST($2::smallint[], $3::bigint[], $4::bigint[])
                     WITH ORDINALITY AS u(rt, mn, mx, ord)
                ORDER BY u.ord
            ) n
            RETURNING unit_id, partition_id, resource_type_id, min_surrogate_id,
                      max_surrogate_id, status, worker, resource_count, redelivery_count,
                      created_at, started_at, heartbeat_at, completed_at
            "#,
        )
        .bind(self.number_of_partitions as i64)
        .bind(&resource_type_ids)
        .bind(&mins)
        .bind(&maxes)
        .fetch_all(&self.pool)
        .await?;

        tracing::debug!(count = created.len(), "Enqueued work units");
        Ok(created)
    }

    async fn dequeue(
        &self,
        start_partition: PartitionId,
        worker: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<WorkUnit>> {
        let now = chrono::Utc::now();

        bounded(cancel, self.budgets.dequeue, async {
            let claimed = sqlx::query_as::<_, WorkUnit>(
                r#"
                UPDATE bulk_work_units
                SET status = 'in_progress',
                    worker = $2,
                    started_at = $3,
                    heartbeat_at = $3,
                    resource_count = NULL
                WHERE (partition_id, unit_id) = (
                    SELECT partition_id, unit_id
                    FROM bulk_work_units
                    WHERE status = 'pending'
                    ORDER BY (((partition_id::int - $1::int) % $4::int) + $4::int) % $4::int,
                             unit_id
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                )
                  AND status = 'pending'
                RETURNING unit_id, partition_id, resource_type_id, min_surrogate_id,
                          max_surrogate_id, status, worker, resource_count, redelivery_count,
                          created_at, started_at, heartbeat_at, completed_at
                "#,
            )
            .bind(start_partition as i32)
            .bind(worker)
            .bind(now)
            .bind(self.number_of_partitions as i32)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::from)?;

            if let Some(unit) = &claimed {
                tracing::debug!(
                    partition_id = unit.partition_id,
                    unit_id = unit.unit_id,
                    worker,
                    "Claimed work unit"
                );
            }
            Ok::<_, Error>(claimed)
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
        let unit = sqlx::query_as::<_, WorkUnit>(
            r#"
            SELECT unit_id, partition_id, resource_type_id, min_surrogate_id,
                   max_surrogate_id, status, worker, resource_count, redelivery_count,
                   created_at, started_at, heartbeat_at, completed_at
            FROM bulk_work_units
            WHERE partition_id = $1 AND unit_id = $2
            "#,
        )
        .bind(partition_id)
        .bind(unit_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(unit)
    }

    async fn requeue_abandoned(&self, older_than: chrono::Duration) -> Result<u64> {
        let cutoff = chrono::Utc::now() - older_than;

        let result = sqlx::query(
            r#"
            UPDATE bulk_work_units
            SET status = 'pending',
                worker = NULL,
                started_at = NULL,
                heartbeat_at = NULL,
                redelivery_count = redelivery_count + 1
            WHERE status = 'in_progress'
              AND (heartbeat_at IS NULL OR heartbeat_at < $1)
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

impl BulkDataReader for PostgresWorkQueue {
    fn read_range(
        &self,
        resource_type_id: i16,
        min: SurrogateId,
        max: SurrogateId,
        cancel: CancellationToken,
    ) -> PayloadStream {
        Box::pin(stream_range(
            self.pool.clone(),
            self.budgets.read,
            resource_type_id,
            min,
            max,
            cancel,
        ))
    }
}

fn stream_range(
    pool: PgPool,
    budget: Duration,
    resource_type_id: i16,
    min: SurrogateId,
    max: SurrogateId,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<StoredPayload>> + Send + 'static {
    try_stream! {
        if min <= max {
            // Held for the life of the stream; dropping the stream returns it
            // to the pool, and an abandoned query is discarded with it.
            let mut conn = bounded(&cancel, budget, async {
                pool.acquire().await.map_err(Error::from)
            })
            .await?;

            let mut rows = sqlx::query_as::<_, StoredPayload>(
                r#"
                SELECT resource_surrogate_id, raw_resource
                FROM bulk_resources
                WHERE resource_type_id = $1
                  AND resource_surrogate_id BETWEEN $2 AND $3
                ORDER BY resource_surrogate_id
                "#,
            )
            .bind(resource_type_id)
            .bind(min)
            .bind(max)
            .fetch(&mut *conn);

            loop {
                let next = bounded(&cancel, budget, async {
                    rows.try_next().await.map_err(Error::from)
                })
                .await?;

                match next {
                    Some(payload) => yield payload,
                    None => break,
                }
            }
        }
    }
}

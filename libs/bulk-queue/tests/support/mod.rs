use anyhow::Context as _;
use ferrum_bulk_queue::{CallBudgets, PostgresWorkQueue};
use futures::FutureExt as _;
use sqlx::{postgres::PgPoolOptions, Connection as _};
use url::Url;
use uuid::Uuid;

pub const TEST_DATABASE_URL_VAR: &str = "FERRUM_BULK_TEST_DATABASE_URL";

pub struct TestQueue {
    pub queue: PostgresWorkQueue,
    schema: String,
    admin_database_url: String,
}

impl TestQueue {
    /// A migrated queue in a fresh schema, or `None` when no test database is
    /// configured.
    pub async fn new(number_of_partitions: i16) -> anyhow::Result<Option<Self>> {
        let Ok(admin_database_url) = std::env::var(TEST_DATABASE_URL_VAR) else {
            eprintln!("{TEST_DATABASE_URL_VAR} not set, skipping PostgreSQL test");
            return Ok(None);
        };

        let schema = format!("test_{}", Uuid::new_v4().simple());
        let mut admin_conn = sqlx::PgConnection::connect(&admin_database_url)
            .await
            .context("connect admin db for schema create")?;
        sqlx::query(&format!(r#"CREATE SCHEMA "{}""#, schema))
            .execute(&mut admin_conn)
            .await
            .context("create test schema")?;

        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(&with_search_path(&admin_database_url, &schema)?)
            .await
            .context("connect test pool")?;

        let queue = PostgresWorkQueue::new(pool, number_of_partitions, CallBudgets::default())?;
        queue.migrate().await.context("run migrations")?;

        Ok(Some(Self {
            queue,
            schema,
            admin_database_url,
        }))
    }

    pub async fn put_resource(
        &self,
        resource_type_id: i16,
        surrogate_id: i64,
        data: &[u8],
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO bulk_resources (resource_type_id, resource_surrogate_id, raw_resource) \
             VALUES ($1, $2, $3)",
        )
        .bind(resource_type_id)
        .bind(surrogate_id)
        .bind(data)
        .execute(self.queue.pool())
        .await?;
        Ok(())
    }

    /// Insert a Pending unit at a fixed identity.
    pub async fn insert_unit(
        &self,
        partition_id: i16,
        unit_id: i64,
        resource_type_id: i16,
        min: i64,
        max: i64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO bulk_work_units \
             (unit_id, partition_id, resource_type_id, min_surrogate_id, max_surrogate_id) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(unit_id)
        .bind(partition_id)
        .bind(resource_type_id)
        .bind(min)
        .bind(max)
        .execute(self.queue.pool())
        .await?;
        Ok(())
    }

    pub async fn cleanup(self) -> anyhow::Result<()> {
        self.queue.pool().close().await;

        let mut admin_conn = sqlx::PgConnection::connect(&self.admin_database_url)
            .await
            .context("connect admin db for schema drop")?;
        sqlx::query(&format!(r#"DROP SCHEMA "{}" CASCADE"#, self.schema))
            .execute(&mut admin_conn)
            .await
            .context("drop test schema")?;

        Ok(())
    }
}

/// Run `f` against a fresh queue and drop its schema afterwards, even on panic.
pub async fn with_test_queue<F>(number_of_partitions: i16, f: F) -> anyhow::Result<()>
where
    F: for<'a> FnOnce(
        &'a TestQueue,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + 'a>,
    >,
{
    let Some(test_queue) = TestQueue::new(number_of_partitions).await? else {
        return Ok(());
    };

    let result = std::panic::AssertUnwindSafe(f(&test_queue))
        .catch_unwind()
        .await;
    if let Err(e) = test_queue.cleanup().await {
        eprintln!("test schema cleanup failed: {e:?}");
    }

    match result {
        Ok(r) => r,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

fn with_search_path(database_url: &str, schema: &str) -> anyhow::Result<String> {
    let mut url = Url::parse(database_url).context("parse database URL")?;
    url.query_pairs_mut()
        .append_pair("options", &format!("-c search_path={}", schema));
    Ok(url.to_string())
}

//! Shared worker state: configuration and the work queue over its pool

use crate::{
    config::{Config, DatabaseConfig},
    Error, Result,
};
use ferrum_bulk_queue::PostgresWorkQueue;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::sync::Arc;
use std::time::Duration;

/// Lightweight state for worker processes
#[derive(Clone)]
pub struct WorkerState {
    pub config: Arc<Config>,
    pub queue: Arc<PostgresWorkQueue>,
}

impl WorkerState {
    pub async fn new(config: Config) -> Result<Self> {
        let pool = create_pool(&config.database).await?;

        let queue = PostgresWorkQueue::new(
            pool,
            config.queue.number_of_partitions,
            config.queue.call_budgets(),
        )?;

        if config.database.run_migrations {
            tracing::info!("Running work queue migrations...");
            queue.migrate().await?;
        }

        Ok(Self {
            config: Arc::new(config),
            queue: Arc::new(queue),
        })
    }
}

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    tracing::info!(
        url = %mask_password(&config.url),
        pool_min_size = config.pool_min_size,
        pool_max_size = config.pool_max_size,
        "Creating PostgreSQL connection pool"
    );

    let connect_options: PgConnectOptions = config
        .url
        .parse()
        .map_err(|e| Error::Config(format!("invalid database.url: {e}")))?;
    let connect_options = connect_options.options([(
        "statement_timeout",
        format!("{}s", config.statement_timeout_seconds),
    )]);

    let pool = PgPoolOptions::new()
        .max_connections(config.pool_max_size)
        .min_connections(config.pool_min_size.min(config.pool_max_size))
        .acquire_timeout(Duration::from_secs(config.pool_timeout_seconds))
        .connect_with(connect_options)
        .await?;

    tracing::debug!("PostgreSQL connection pool created");
    Ok(pool)
}

/// Hide the password of a connection URL for logging.
pub fn mask_password(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let Some((credentials, host)) = rest.rsplit_once('@') else {
        return url.to_string();
    };
    match credentials.split_once(':') {
        Some((user, _)) => format!("{scheme}://{user}:****@{host}"),
        None => url.to_string(),
    }
}

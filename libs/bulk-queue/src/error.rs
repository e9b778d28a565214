//! Error types for the bulk work queue

use std::time::Duration;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Work queue errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Store operation exceeded its budget of {0:?}")]
    Timeout(Duration),

    #[error("Store operation cancelled")]
    Cancelled,

    #[error("Malformed range for resource type {resource_type_id}: {min} > {max}")]
    MalformedRange {
        resource_type_id: i16,
        min: i64,
        max: i64,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid work unit status: {0}")]
    InvalidStatus(String),
}

impl Error {
    /// Whether the caller should retry the operation with backoff.
    ///
    /// Covers store unavailability (pool exhaustion, dropped connections, I/O)
    /// and exceeded call budgets. Constraint violations and programming errors
    /// are not transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Database(e) => is_transient_database_error(e),
            _ => false,
        }
    }
}

/// Connection-level failures that say nothing about the statement itself.
pub fn is_transient_database_error(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
    )
}

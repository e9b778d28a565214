//! Error types for the bulk worker

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Work queue error: {0}")]
    Queue(#[from] ferrum_bulk_queue::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Processing failed for unit {partition_id}/{unit_id}: {message}")]
    Processing {
        partition_id: i16,
        unit_id: i64,
        message: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Worth retrying with backoff: store unavailability or an exceeded budget.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Queue(e) => e.is_transient(),
            Error::Database(e) => ferrum_bulk_queue::is_transient_database_error(e),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Queue(ferrum_bulk_queue::Error::Cancelled))
    }
}

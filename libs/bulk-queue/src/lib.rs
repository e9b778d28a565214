//! Bulk Work Queue
//!
//! Coordination engine behind bulk FHIR import/export: a durable, partitioned
//! table of work units that many workers claim from concurrently.
//!
//! - [`PartitionAllocator`] spreads workers over partitions (sticky or round-robin)
//! - [`WorkQueue`] claims, heartbeats and completes units atomically at the store
//! - [`BulkDataReader`] streams the raw payloads covered by a unit's range
//!
//! Delivery is at-least-once: a unit whose worker stops heartbeating is handed
//! out again by [`WorkQueue::requeue_abandoned`].
//!
//! # Example
//!
//! ```rust,no_run
//! use ferrum_bulk_queue::{InMemoryWorkQueue, PartitionAllocator, WorkQueue};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> ferrum_bulk_queue::Result<()> {
//! let queue = InMemoryWorkQueue::new(16)?;
//! let allocator = PartitionAllocator::new(16)?;
//! let cancel = CancellationToken::new();
//!
//! let start = allocator.next_partition(None);
//! if let Some(unit) = queue.dequeue(start, "host:42", &cancel).await? {
//!     let claim = unit.claim_by("host:42");
//!     queue.heartbeat_claim(&claim, Some(10), &cancel).await?;
//!     queue.complete_claim(&claim, false, Some(10), &cancel).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod bounded;
pub mod error;
pub mod memory;
pub mod models;
pub mod partition;
pub mod postgres;
pub mod traits;

pub use bounded::{bounded, CallBudgets};
pub use error::{is_transient_database_error, Error, Result};
pub use memory::InMemoryWorkQueue;
pub use models::{
    plan_units, Claim, NewWorkUnit, PartitionId, StoredPayload, SurrogateId, WorkUnit,
    WorkUnitStatus,
};
pub use partition::{PartitionAllocator, DEFAULT_NUMBER_OF_PARTITIONS};
pub use postgres::PostgresWorkQueue;
pub use traits::{BulkDataReader, PayloadStream, WorkQueue};

//! Partition assignment for polling workers
//!
//! Spreads dequeue contention across the sharded queue. Sticky workers pass a
//! hint and always start their scan at the same partition; everyone else is
//! fanned out round-robin from a cursor owned by the allocator.

use crate::{models::PartitionId, Error, Result};
use std::sync::{Mutex, PoisonError};

/// Default number of partitions for a freshly created queue.
pub const DEFAULT_NUMBER_OF_PARTITIONS: PartitionId = 16;

#[derive(Debug)]
pub struct PartitionAllocator {
    number_of_partitions: PartitionId,
    cursor: Mutex<PartitionId>,
}

impl PartitionAllocator {
    pub fn new(number_of_partitions: PartitionId) -> Result<Self> {
        if number_of_partitions < 1 {
            return Err(Error::InvalidConfig(format!(
                "number_of_partitions must be at least 1, got {}",
                number_of_partitions
            )));
        }

        Ok(Self {
            number_of_partitions,
            // Parked on the last partition so the first round-robin call yields 0.
            cursor: Mutex::new(number_of_partitions - 1),
        })
    }

    pub fn number_of_partitions(&self) -> PartitionId {
        self.number_of_partitions
    }

    /// Pick the partition a worker should start its dequeue scan at.
    ///
    /// With a hint this is `hint mod number_of_partitions` and takes no lock.
    /// Without one the shared cursor advances by one, wrapping to 0.
    pub fn next_partition(&self, hint: Option<u64>) -> PartitionId {
        match hint {
            Some(hint) => (hint % self.number_of_partitions as u64) as PartitionId,
            None => {
                let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
                *cursor = (*cursor + 1) % self.number_of_partitions;
                *cursor
            }
        }
    }
}

impl Default for PartitionAllocator {
    fn default() -> Self {
        Self {
            number_of_partitions: DEFAULT_NUMBER_OF_PARTITIONS,
            cursor: Mutex::new(DEFAULT_NUMBER_OF_PARTITIONS - 1),
        }
    }
}

/// Scan position of `partition` when the scan starts at `start`.
///
/// Partitions at or above `number_of_partitions` (enqueued under an older,
/// larger count) fold back into range so they are still reached.
pub fn scan_rank(
    partition: PartitionId,
    start: PartitionId,
    number_of_partitions: PartitionId,
) -> i32 {
    let n = number_of_partitions.max(1) as i32;
    (partition as i32 - start as i32).rem_euclid(n)
}

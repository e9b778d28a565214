//! Work unit domain models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Shard of the work-queue namespace, `0..number_of_partitions`.
pub type PartitionId = i16;

/// Position key delimiting row ranges within a resource type.
pub type SurrogateId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkUnitStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl WorkUnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkUnitStatus::Pending => "pending",
            WorkUnitStatus::InProgress => "in_progress",
            WorkUnitStatus::Completed => "completed",
            WorkUnitStatus::Failed => "failed",
        }
    }

    pub(crate) fn terminal(failed: bool) -> Self {
        if failed {
            WorkUnitStatus::Failed
        } else {
            WorkUnitStatus::Completed
        }
    }
}

impl std::fmt::Display for WorkUnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Conversion from DB string to WorkUnitStatus
impl TryFrom<String> for WorkUnitStatus {
    type Error = crate::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "pending" => Ok(WorkUnitStatus::Pending),
            "in_progress" => Ok(WorkUnitStatus::InProgress),
            "completed" => Ok(WorkUnitStatus::Completed),
            "failed" => Ok(WorkUnitStatus::Failed),
            _ => Err(crate::Error::InvalidStatus(value)),
        }
    }
}

/// A claimable range of source rows.
///
/// Never deleted by the queue; terminal units stay behind as an audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkUnit {
    pub unit_id: i64,
    pub partition_id: PartitionId,
    pub resource_type_id: i16,
    pub min_surrogate_id: SurrogateId,
    pub max_surrogate_id: SurrogateId,
    #[sqlx(try_from = "String")]
    pub status: WorkUnitStatus,
    pub worker: Option<String>,
    pub resource_count: Option<i64>,
    pub redelivery_count: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkUnit {
    /// `(partition_id, unit_id)`, the identity a claim is reported under.
    pub fn key(&self) -> (PartitionId, i64) {
        (self.partition_id, self.unit_id)
    }

    /// The claim `worker` holds on this unit, as of this snapshot.
    pub fn claim_by(&self, worker: &str) -> Claim {
        Claim {
            partition_id: self.partition_id,
            unit_id: self.unit_id,
            worker: worker.to_string(),
            redelivery_count: self.redelivery_count,
        }
    }
}

/// One delivery of a unit to one worker.
///
/// Every redelivery bumps `redelivery_count`, so a claim taken before the
/// reaper reset the unit no longer matches, even if the same worker id
/// picks the unit up again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub partition_id: PartitionId,
    pub unit_id: i64,
    pub worker: String,
    pub redelivery_count: i32,
}

/// A unit as handed to the enqueue side, before the store assigns identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWorkUnit {
    pub resource_type_id: i16,
    pub min_surrogate_id: SurrogateId,
    pub max_surrogate_id: SurrogateId,
}

impl NewWorkUnit {
    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.min_surrogate_id > self.max_surrogate_id {
            return Err(crate::Error::MalformedRange {
                resource_type_id: self.resource_type_id,
                min: self.min_surrogate_id,
                max: self.max_surrogate_id,
            });
        }
        Ok(())
    }
}

/// Split `[min, max]` into consecutive, non-overlapping units of at most
/// `unit_size` surrogate ids.
pub fn plan_units(
    resource_type_id: i16,
    min: SurrogateId,
    max: SurrogateId,
    unit_size: i64,
) -> Vec<NewWorkUnit> {
    if min > max || unit_size <= 0 {
        return Vec::new();
    }

    let mut units = Vec::new();
    let mut start = min;
    loop {
        let end = start.saturating_add(unit_size - 1).min(max);
        units.push(NewWorkUnit {
            resource_type_id,
            min_surrogate_id: start,
            max_surrogate_id: end,
        });
        if end == max {
            break;
        }
        start = end + 1;
    }
    units
}

/// One stored resource payload, opaque to the queue.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StoredPayload {
    #[sqlx(rename = "resource_surrogate_id")]
    pub surrogate_id: SurrogateId,
    #[sqlx(rename = "raw_resource")]
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_db_text() {
        for status in [
            WorkUnitStatus::Pending,
            WorkUnitStatus::InProgress,
            WorkUnitStatus::Completed,
            WorkUnitStatus::Failed,
        ] {
            let parsed = WorkUnitStatus::try_from(status.as_str().to_string()).unwrap();
            assert_eq!(parsed, status);
        }
        assert!(WorkUnitStatus::try_from("running".to_string()).is_err());
    }

    #[test]
    fn claim_captures_delivery() {
        let unit = WorkUnit {
            unit_id: 12,
            partition_id: 3,
            resource_type_id: 1,
            min_surrogate_id: 0,
            max_surrogate_id: 9,
            status: WorkUnitStatus::InProgress,
            worker: Some("host:1#0".to_string()),
            resource_count: None,
            redelivery_count: 2,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            heartbeat_at: Some(Utc::now()),
            completed_at: None,
        };

        let claim = unit.claim_by("host:1#0");
        assert_eq!((claim.partition_id, claim.unit_id), unit.key());
        assert_eq!(claim.worker, "host:1#0");
        assert_eq!(claim.redelivery_count, 2);
    }

    #[test]
    fn plan_units_covers_range_without_overlap() {
        let units = plan_units(7, 100, 349, 100);
        assert_eq!(units.len(), 3);
        assert_eq!(
            (units[0].min_surrogate_id, units[0].max_surrogate_id),
            (100, 199)
        );
        assert_eq!(
            (units[1].min_surrogate_id, units[1].max_surrogate_id),
            (200, 299)
        );
        assert_eq!(
            (units[2].min_surrogate_id, units[2].max_surrogate_id),
            (300, 349)
        );
        assert!(units.iter().all(|u| u.resource_type_id == 7));
    }

    #[test]
    fn plan_units_single_id_and_empty() {
        assert_eq!(plan_units(1, 5, 5, 10).len(), 1);
        assert!(plan_units(1, 6, 5, 10).is_empty());
        assert!(plan_units(1, 0, 5, 0).is_empty());
    }

    #[test]
    fn plan_units_does_not_overflow_at_upper_bound() {
        let units = plan_units(1, i64::MAX - 5, i64::MAX, 4);
        assert_eq!(units.len(), 2);
        assert_eq!(units[1].max_surrogate_id, i64::MAX);
    }

    #[test]
    fn malformed_range_is_rejected() {
        let unit = NewWorkUnit {
            resource_type_id: 3,
            min_surrogate_id: 10,
            max_surrogate_id: 9,
        };
        assert!(matches!(
            unit.validate(),
            Err(crate::Error::MalformedRange { min: 10, max: 9, .. })
        ));
    }
}

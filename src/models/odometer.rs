//! Persisted replication counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// The single odometer row.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, Default, PartialEq, Eq)]
pub struct OdometerReading {
    /// Number of replicas currently held.
    pub count: i64,

    /// Total bytes currently held across groups.
    pub storesize: i64,

    /// Cumulative bytes sent to the store.
    pub uploaded: i64,

    /// Cumulative bytes read back from the store.
    pub downloaded: i64,

    /// Last time any counter changed.
    pub modified: Option<DateTime<Utc>>,
}

/// A signed adjustment applied to the odometer in one locked step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OdometerDelta {
    pub count: i64,
    pub storesize: i64,
    pub uploaded: i64,
    pub downloaded: i64,
}

impl OdometerDelta {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

impl OdometerReading {
    /// Apply `delta`, stamping `now` as the modification time.
    pub fn apply(&self, delta: &OdometerDelta, now: DateTime<Utc>) -> Self {
        Self {
            count: self.count + delta.count,
            storesize: self.storesize + delta.storesize,
            uploaded: self.uploaded + delta.uploaded,
            downloaded: self.downloaded + delta.downloaded,
            modified: Some(now),
        }
    }
}

//! Worker heartbeat rows (liveness observability).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form details stored next to a heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatDetails {
    pub is_leader: bool,
    /// Config snapshot of the reporting instance.
    pub config: serde_json::Value,
    /// Counter snapshot, if the instance keeps stats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<serde_json::Value>,
}

/// Upserted by every instance, leader or not, once per heartbeat interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub instance_id: String,
    pub seen_at: DateTime<Utc>,
    pub details: HeartbeatDetails,
}

impl WorkerHeartbeat {
    /// Has this instance been silent for longer than `stale_after`?
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        now - self.seen_at > stale_after
    }
}

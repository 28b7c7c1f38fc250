use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::DeliveryStatus;

// -- Health --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub store_ok: bool,
    pub timestamp: DateTime<Utc>,
}

// -- Phantom messages --

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PhantomQuery {
    /// Humantime duration such as `1h` or `30m`.
    #[serde(rename = "timeRange")]
    pub time_range: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhantomStats {
    pub total_phantoms: usize,
    pub time_range: String,
    pub cutoff_time: DateTime<Utc>,
    pub check_timestamp: DateTime<Utc>,
}

/// Counts of phantom entries by missing side effect. One entry may count
/// towards several categories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhantomCategories {
    pub db_not_saved: usize,
    pub cache_not_saved: usize,
    pub notification_not_sent: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhantomReport {
    pub statistics: PhantomStats,
    pub categories: PhantomCategories,
    pub phantom_messages: Vec<DeliveryStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixTriggered {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixSummary {
    pub scanned: usize,
    pub repaired: usize,
    pub still_pending: usize,
    pub skipped: usize,
}

// -- Worker pools --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub worker_count: usize,
    pub jobs_queued: usize,
    pub queue_capacity: usize,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerStatus {
    pub enabled: bool,
    pub check_interval: String,
    pub grace: String,
    pub lookback: String,
    pub running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub last_summary: Option<FixSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolsResponse {
    pub delivery_workers: PoolStatus,
    pub phantom_detector: ReconcilerStatus,
}

// -- Rooms --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheCleared {
    pub room_id: Uuid,
    pub cleared: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomClosed {
    pub room_id: Uuid,
    pub disconnected: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KickQuery {
    /// Also ban the user from rejoining.
    #[serde(default)]
    pub ban: bool,
    /// Humantime ban length such as `2h`; a ban without one is permanent.
    pub duration: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserKicked {
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub banned: bool,
    pub ban_expires_at: Option<DateTime<Utc>>,
    /// Connections dropped on this instance; other instances drop theirs
    /// when the kick reaches them.
    pub disconnected: usize,
}

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a resource's extraction: a one-time chunked backfill, then
/// forward-only incremental pulls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    NotStarted,
    Backfilling,
    Steady,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::NotStarted => "not_started",
            SyncState::Backfilling => "backfilling",
            SyncState::Steady => "steady",
        }
    }
}

impl FromStr for SyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(SyncState::NotStarted),
            "backfilling" => Ok(SyncState::Backfilling),
            "steady" => Ok(SyncState::Steady),
            other => Err(format!("unknown sync state: {other}")),
        }
    }
}

/// Per (shop, resource) persisted position.
///
/// `watermark` is the single forward position: during a backfill it is the
/// end of the last committed chunk, in steady state the incremental
/// watermark. It never moves backward. `backfill_start` pins the chunk grid
/// for the whole backfill so a resumed run re-plans identical boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceCursor {
    pub id: Uuid,
    pub shop: String,
    pub resource: String,
    pub state: SyncState,
    pub watermark: Option<DateTime<Utc>>,
    pub backfill_start: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

//! Freshness badge derived from sync-state recency.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::model::SyncState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncHealth {
    Healthy,
    Stale,
    Down,
    Unknown,
}

impl SyncHealth {
    pub const HEALTHY_WITHIN_HOURS: i64 = 26;
    pub const STALE_WITHIN_HOURS: i64 = 72;

    pub fn from_state(state: Option<&SyncState>, now: DateTime<Utc>) -> Self {
        let Some(last_success) = state.and_then(|s| s.last_success_at) else {
            return Self::Unknown;
        };
        let age = now - last_success;
        if age <= Duration::hours(Self::HEALTHY_WITHIN_HOURS) {
            Self::Healthy
        } else if age <= Duration::hours(Self::STALE_WITHIN_HOURS) {
            Self::Stale
        } else {
            Self::Down
        }
    }
}

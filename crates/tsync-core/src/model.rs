//! Persisted records and run bookkeeping types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::enrichment::Enrichment;

/// Identity of one OCDS release version: the open-contracting id plus its
/// publication date.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReleaseKey {
    pub ocid: String,
    pub release_date: DateTime<Utc>,
}

impl ReleaseKey {
    pub fn new(ocid: impl Into<String>, release_date: DateTime<Utc>) -> Self {
        Self {
            ocid: ocid.into(),
            release_date,
        }
    }
}

impl fmt::Display for ReleaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.ocid, self.release_date.to_rfc3339())
    }
}

/// Normalized projection of a feed release, ready to be upserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseDraft {
    pub key: ReleaseKey,
    pub tender_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub buyer_name: Option<String>,
    pub main_category: Option<String>,
    pub status: Option<String>,
    pub close_date: Option<DateTime<Utc>>,
    pub tender_number: Option<String>,
    pub raw: serde_json::Value,
}

/// Release as persisted, projection plus merged enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub id: Uuid,
    pub key: ReleaseKey,
    pub slug: String,
    pub tender_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub buyer_name: Option<String>,
    pub main_category: Option<String>,
    pub status: Option<String>,
    pub close_date: Option<DateTime<Utc>>,
    pub tender_number: Option<String>,
    pub enrichment: Enrichment,
    pub quality_score: i32,
    pub enriched_at: Option<DateTime<Utc>>,
    pub raw: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReleaseRecord {
    /// A release counts as categorized once the enrichment provider has
    /// supplied its detailed category.
    pub fn is_categorized(&self) -> bool {
        self.enrichment.detailed_category.is_some()
    }
}

/// What the store already knows about a key, used to decide whether a release
/// still needs an enrichment lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExistingRelease {
    pub id: Uuid,
    pub categorized: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub id: Uuid,
    pub slug: String,
    pub inserted: bool,
}

/// Stored release selected for re-enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillCandidate {
    pub key: ReleaseKey,
    pub title: Option<String>,
    pub tender_id: Option<String>,
    pub tender_number: Option<String>,
    pub raw: serde_json::Value,
}

/// Inclusive `[from, to]` date-time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl DateWindow {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        if from <= to {
            Self { from, to }
        } else {
            Self { from: to, to: from }
        }
    }

    /// Window ending at `now` and reaching back `days` days.
    pub fn lookback(now: DateTime<Utc>, days: i64) -> Self {
        Self::new(now - Duration::days(days.max(0)), now)
    }

    /// Midnight UTC of `now`'s day through `now`.
    pub fn today(now: DateTime<Utc>) -> Self {
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|naive| naive.and_utc())
            .unwrap_or(now);
        Self::new(midnight, now)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from <= at && at <= self.to
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}..{}",
            self.from.format("%Y-%m-%dT%H:%M:%SZ"),
            self.to.format("%Y-%m-%dT%H:%M:%SZ")
        )
    }
}

/// Per-feed progress record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub feed: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Processed-through boundary; seeds the next window.
    pub cursor: Option<DateTime<Utc>>,
}

impl SyncState {
    pub fn empty(feed: impl Into<String>) -> Self {
        Self {
            feed: feed.into(),
            last_run_at: None,
            last_success_at: None,
            cursor: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown job status {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    Sync,
    SyncDurable,
    EnrichToday,
    Backfill,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "SYNC",
            Self::SyncDurable => "SYNC_DURABLE",
            Self::EnrichToday => "ENRICH_TODAY",
            Self::Backfill => "BACKFILL",
        }
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SYNC" => Ok(Self::Sync),
            "SYNC_DURABLE" => Ok(Self::SyncDurable),
            "ENRICH_TODAY" => Ok(Self::EnrichToday),
            "BACKFILL" => Ok(Self::Backfill),
            other => Err(format!("unknown job type {other}")),
        }
    }
}

/// Append-only record of one invocation. Created RUNNING, finalized once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLog {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Resume from the cursor, enrich a sampled share of new releases.
    #[default]
    Daily,
    /// Explicit or long lookback window, independent of the cursor.
    Backfill,
    /// Like daily, but the enrichment cap covers every uncategorized row in the window.
    Comprehensive,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Backfill => "backfill",
            Self::Comprehensive => "comprehensive",
        }
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Self::Daily),
            "backfill" => Ok(Self::Backfill),
            "comprehensive" => Ok(Self::Comprehensive),
            other => Err(format!("unknown sync mode {other}")),
        }
    }
}

/// Enrichment coverage for one publication day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentProgress {
    pub period: NaiveDate,
    pub total: i64,
    pub missing: i64,
}

impl EnrichmentProgress {
    pub fn coverage_percent(&self) -> f64 {
        if self.total <= 0 {
            return 0.0;
        }
        ((self.total - self.missing) as f64 / self.total as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn window_normalizes_reversed_bounds() {
        let a = Utc.with_ymd_and_hms(2025, 3, 2, 0, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let window = DateWindow::new(a, b);
        assert_eq!(window.from, b);
        assert_eq!(window.to, a);
        assert!(window.contains(a));
        assert!(window.contains(b));
    }

    #[test]
    fn today_starts_at_midnight() {
        let now = Utc.with_ymd_and_hms(2025, 3, 2, 15, 30, 0).unwrap();
        let window = DateWindow::today(now);
        assert_eq!(window.from, Utc.with_ymd_and_hms(2025, 3, 2, 0, 0, 0).unwrap());
        assert_eq!(window.to, now);
    }

    #[test]
    fn statuses_round_trip_through_their_column_text() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Success,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<JobStatus>().is_err());
        assert_eq!(" Comprehensive ".parse::<SyncMode>().unwrap(), SyncMode::Comprehensive);
    }

    #[test]
    fn coverage_handles_empty_periods() {
        let day = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let empty = EnrichmentProgress { period: day, total: 0, missing: 0 };
        assert_eq!(empty.coverage_percent(), 0.0);
        let half = EnrichmentProgress { period: day, total: 10, missing: 5 };
        assert_eq!(half.coverage_percent(), 50.0);
    }
}

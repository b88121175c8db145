//! Persistence port for releases, sync state, job logs, flags, locks and
//! durable-run checkpoints.
//!
//! Every method checks a connection out for the duration of its own
//! statements only. Callers never hold a handle across a network call.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tsync_core::slug::{base_slug, suffixed_slug};
use tsync_core::{
    BackfillCandidate, DateWindow, Enrichment, EnrichmentProgress, ExistingRelease, JobLog,
    JobStatus, JobType, ReleaseDraft, ReleaseKey, ReleaseRecord, SyncState, UpsertOutcome,
};
use uuid::Uuid;

pub mod memory;
pub mod postgres;

/// Flag an operator sets to ask a running backfill to stop.
pub const BACKFILL_CANCEL_FLAG: &str = "backfill.cancel_requested";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateFilter {
    /// Any tracked enrichment field missing.
    Incomplete,
    /// No detailed category yet.
    Uncategorized,
}

/// One enrichment result queued for a micro-batch write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentWrite {
    pub key: ReleaseKey,
    pub tender_number: Option<String>,
    pub enrichment: Enrichment,
}

#[async_trait]
pub trait ReleaseStore: Send + Sync {
    async fn existing_releases(
        &self,
        keys: &[ReleaseKey],
    ) -> Result<HashMap<ReleaseKey, ExistingRelease>>;

    async fn find_release(&self, key: &ReleaseKey) -> Result<Option<ReleaseRecord>>;

    /// Idempotent upsert by `(ocid, release_date)`. Projection fields follow
    /// the latest payload; enrichment merges additively; the slug is fixed at
    /// first insert.
    async fn upsert_release(
        &self,
        draft: &ReleaseDraft,
        enrichment: Option<&Enrichment>,
    ) -> Result<UpsertOutcome>;

    /// Additive merge into an existing row. `Ok(false)` when the key is unknown.
    async fn merge_enrichment(&self, write: &EnrichmentWrite) -> Result<bool>;

    /// Writes a micro-batch in one transaction; returns rows updated.
    async fn merge_enrichment_batch(&self, writes: &[EnrichmentWrite]) -> Result<usize>;

    async fn count_uncategorized(&self, window: &DateWindow) -> Result<u64>;

    async fn select_candidates(
        &self,
        window: &DateWindow,
        filter: CandidateFilter,
        limit: usize,
    ) -> Result<Vec<BackfillCandidate>>;

    async fn enrichment_progress(&self, window: &DateWindow) -> Result<Vec<EnrichmentProgress>>;

    async fn sync_state(&self, feed: &str) -> Result<Option<SyncState>>;

    async fn record_run_started(&self, feed: &str, at: DateTime<Utc>) -> Result<()>;

    /// Stamps `last_success_at`; the cursor only ever moves forward.
    async fn record_run_succeeded(
        &self,
        feed: &str,
        cursor: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn create_job(&self, job_type: JobType, metadata: &serde_json::Value) -> Result<JobLog>;

    /// Finalizes a RUNNING job. `Ok(false)` if it was already finalized.
    async fn finalize_job(
        &self,
        id: Uuid,
        status: JobStatus,
        note: &str,
        metadata: &serde_json::Value,
    ) -> Result<bool>;

    async fn recent_jobs(&self, limit: usize) -> Result<Vec<JobLog>>;

    async fn flag(&self, key: &str) -> Result<bool>;

    async fn set_flag(&self, key: &str, value: bool) -> Result<()>;

    /// Takes the named lock unless another holder owns an unexpired one.
    async fn try_acquire_lock(&self, name: &str, holder: Uuid, ttl: Duration) -> Result<bool>;

    async fn release_lock(&self, name: &str, holder: Uuid) -> Result<()>;

    async fn load_checkpoint(&self, run_id: Uuid, step: &str) -> Result<Option<serde_json::Value>>;

    /// First write wins; a replayed step never overwrites its checkpoint.
    async fn save_checkpoint(&self, run_id: Uuid, step: &str, output: &serde_json::Value)
        -> Result<()>;
}

/// Build the row for a first insert.
pub(crate) fn new_record(
    draft: &ReleaseDraft,
    enrichment: Option<&Enrichment>,
    slug: String,
    now: DateTime<Utc>,
) -> ReleaseRecord {
    let merged = enrichment.cloned().unwrap_or_default();
    ReleaseRecord {
        id: Uuid::new_v4(),
        key: draft.key.clone(),
        slug,
        tender_id: draft.tender_id.clone(),
        title: draft.title.clone(),
        description: draft.description.clone(),
        buyer_name: draft.buyer_name.clone(),
        main_category: draft.main_category.clone(),
        status: draft.status.clone(),
        close_date: draft.close_date,
        tender_number: draft.tender_number.clone(),
        quality_score: merged.quality_score(),
        enriched_at: enrichment.map(|_| now),
        enrichment: merged,
        raw: draft.raw.clone(),
        created_at: now,
        updated_at: now,
    }
}

/// Fold a re-synced draft into an existing row.
pub(crate) fn apply_draft(
    record: &mut ReleaseRecord,
    draft: &ReleaseDraft,
    enrichment: Option<&Enrichment>,
    now: DateTime<Utc>,
) {
    record.tender_id = draft.tender_id.clone();
    record.title = draft.title.clone();
    record.description = draft.description.clone();
    record.buyer_name = draft.buyer_name.clone();
    record.main_category = draft.main_category.clone();
    record.status = draft.status.clone();
    record.close_date = draft.close_date;
    if draft.tender_number.is_some() {
        record.tender_number = draft.tender_number.clone();
    }
    record.raw = draft.raw.clone();
    if let Some(enrichment) = enrichment {
        apply_enrichment(record, None, enrichment, now);
    }
    record.updated_at = now;
}

pub(crate) fn apply_enrichment(
    record: &mut ReleaseRecord,
    tender_number: Option<&str>,
    enrichment: &Enrichment,
    now: DateTime<Utc>,
) {
    if let Some(number) = tender_number {
        record.tender_number = Some(number.to_string());
    }
    record.enrichment.merge_from(enrichment);
    record.quality_score = record.enrichment.quality_score();
    record.enriched_at = Some(now);
    record.updated_at = now;
}

/// Slug for a new row: the title slug, or its deterministic suffixed form
/// when the base is taken or the caller already hit a collision.
pub(crate) fn choose_slug(draft: &ReleaseDraft, base_taken: bool, force_suffix: bool) -> String {
    let base = base_slug(draft.title.as_deref(), &draft.key);
    if base_taken || force_suffix {
        suffixed_slug(&base, &draft.key)
    } else {
        base
    }
}

pub(crate) fn matches_filter(record: &ReleaseRecord, filter: CandidateFilter) -> bool {
    match filter {
        CandidateFilter::Incomplete => record.enrichment.is_incomplete(),
        CandidateFilter::Uncategorized => !record.is_categorized(),
    }
}

pub(crate) fn candidate_from(record: &ReleaseRecord) -> BackfillCandidate {
    BackfillCandidate {
        key: record.key.clone(),
        title: record.title.clone(),
        tender_id: record.tender_id.clone(),
        tender_number: record.tender_number.clone(),
        raw: record.raw.clone(),
    }
}

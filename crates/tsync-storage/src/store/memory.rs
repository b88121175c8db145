//! In-memory [`ReleaseStore`] for tests and local demos.
//!
//! Mirrors the Postgres semantics (additive merge, slug collision suffixing,
//! forward-only cursor, finalize-once job logs) without a database. It also
//! counts checked-out handles so callers can assert that no handle is held
//! while they are off doing network I/O.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tsync_core::{
    BackfillCandidate, DateWindow, Enrichment, EnrichmentProgress, ExistingRelease, JobLog,
    JobStatus, JobType, ReleaseDraft, ReleaseKey, ReleaseRecord, SyncState, UpsertOutcome,
};
use uuid::Uuid;

use super::{
    apply_draft, apply_enrichment, candidate_from, choose_slug, matches_filter, new_record,
    CandidateFilter, EnrichmentWrite, ReleaseStore,
};

#[derive(Debug, Default)]
struct MemoryState {
    releases: BTreeMap<ReleaseKey, ReleaseRecord>,
    slugs: HashMap<String, ReleaseKey>,
    sync_states: HashMap<String, SyncState>,
    jobs: Vec<JobLog>,
    flags: HashMap<String, bool>,
    locks: HashMap<String, (Uuid, Instant)>,
    checkpoints: HashMap<(Uuid, String), serde_json::Value>,
    /// Remaining `existing_releases` answers before the store "goes down".
    existing_reads_left: Option<usize>,
}

#[derive(Debug, Default, Clone)]
pub struct MemoryReleaseStore {
    state: Arc<Mutex<MemoryState>>,
    handles: Arc<AtomicUsize>,
}

/// Stand-in for a pooled connection; released on drop.
struct Handle<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for Handle<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryReleaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles currently checked out by in-flight store calls.
    pub fn checked_out(&self) -> usize {
        self.handles.load(Ordering::SeqCst)
    }

    /// Fails `existing_releases` once it has answered `reads` more times.
    pub fn fail_existing_reads_after(&self, reads: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.existing_reads_left = Some(reads);
        }
    }

    pub fn release_count(&self) -> usize {
        self.state.lock().map(|s| s.releases.len()).unwrap_or(0)
    }

    pub fn all_releases(&self) -> Vec<ReleaseRecord> {
        self.state
            .lock()
            .map(|s| s.releases.values().cloned().collect())
            .unwrap_or_default()
    }

    fn checkout(&self) -> Handle<'_> {
        self.handles.fetch_add(1, Ordering::SeqCst);
        Handle {
            counter: &self.handles,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory store mutex poisoned"))
    }
}

fn in_window(record: &ReleaseRecord, window: &DateWindow) -> bool {
    window.contains(record.key.release_date)
}

#[async_trait]
impl ReleaseStore for MemoryReleaseStore {
    async fn existing_releases(
        &self,
        keys: &[ReleaseKey],
    ) -> Result<HashMap<ReleaseKey, ExistingRelease>> {
        let _handle = self.checkout();
        let mut state = self.lock()?;
        if let Some(left) = state.existing_reads_left.as_mut() {
            if *left == 0 {
                bail!("memory store is unavailable");
            }
            *left -= 1;
        }
        Ok(keys
            .iter()
            .filter_map(|key| {
                state.releases.get(key).map(|record| {
                    (
                        key.clone(),
                        ExistingRelease {
                            id: record.id,
                            categorized: record.is_categorized(),
                        },
                    )
                })
            })
            .collect())
    }

    async fn find_release(&self, key: &ReleaseKey) -> Result<Option<ReleaseRecord>> {
        let _handle = self.checkout();
        Ok(self.lock()?.releases.get(key).cloned())
    }

    async fn upsert_release(
        &self,
        draft: &ReleaseDraft,
        enrichment: Option<&Enrichment>,
    ) -> Result<UpsertOutcome> {
        let _handle = self.checkout();
        let now = Utc::now();
        let mut state = self.lock()?;

        if let Some(record) = state.releases.get_mut(&draft.key) {
            apply_draft(record, draft, enrichment, now);
            return Ok(UpsertOutcome {
                id: record.id,
                slug: record.slug.clone(),
                inserted: false,
            });
        }

        let base = choose_slug(draft, false, false);
        let base_taken = state.slugs.get(&base).is_some_and(|owner| owner != &draft.key);
        let slug = if base_taken {
            choose_slug(draft, true, false)
        } else {
            base
        };
        if state.slugs.get(&slug).is_some_and(|owner| owner != &draft.key) {
            bail!("slug {slug} already taken for {}", draft.key);
        }

        let record = new_record(draft, enrichment, slug.clone(), now);
        let id = record.id;
        state.slugs.insert(slug.clone(), draft.key.clone());
        state.releases.insert(draft.key.clone(), record);
        Ok(UpsertOutcome {
            id,
            slug,
            inserted: true,
        })
    }

    async fn merge_enrichment(&self, write: &EnrichmentWrite) -> Result<bool> {
        let _handle = self.checkout();
        let mut state = self.lock()?;
        let Some(record) = state.releases.get_mut(&write.key) else {
            return Ok(false);
        };
        apply_enrichment(record, write.tender_number.as_deref(), &write.enrichment, Utc::now());
        Ok(true)
    }

    async fn merge_enrichment_batch(&self, writes: &[EnrichmentWrite]) -> Result<usize> {
        let _handle = self.checkout();
        let now = Utc::now();
        let mut state = self.lock()?;
        let mut updated = 0;
        for write in writes {
            if let Some(record) = state.releases.get_mut(&write.key) {
                apply_enrichment(record, write.tender_number.as_deref(), &write.enrichment, now);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn count_uncategorized(&self, window: &DateWindow) -> Result<u64> {
        let _handle = self.checkout();
        let state = self.lock()?;
        Ok(state
            .releases
            .values()
            .filter(|r| in_window(r, window) && !r.is_categorized())
            .count() as u64)
    }

    async fn select_candidates(
        &self,
        window: &DateWindow,
        filter: CandidateFilter,
        limit: usize,
    ) -> Result<Vec<BackfillCandidate>> {
        let _handle = self.checkout();
        let state = self.lock()?;
        // newest first, like the SQL ORDER BY release_date DESC
        Ok(state
            .releases
            .values()
            .rev()
            .filter(|r| in_window(r, window) && matches_filter(r, filter))
            .take(limit)
            .map(candidate_from)
            .collect())
    }

    async fn enrichment_progress(&self, window: &DateWindow) -> Result<Vec<EnrichmentProgress>> {
        let _handle = self.checkout();
        let state = self.lock()?;
        let mut by_day: BTreeMap<chrono::NaiveDate, (i64, i64)> = BTreeMap::new();
        for record in state.releases.values().filter(|r| in_window(r, window)) {
            let entry = by_day.entry(record.key.release_date.date_naive()).or_default();
            entry.0 += 1;
            if !record.is_categorized() {
                entry.1 += 1;
            }
        }
        Ok(by_day
            .into_iter()
            .map(|(period, (total, missing))| EnrichmentProgress {
                period,
                total,
                missing,
            })
            .collect())
    }

    async fn sync_state(&self, feed: &str) -> Result<Option<SyncState>> {
        let _handle = self.checkout();
        Ok(self.lock()?.sync_states.get(feed).cloned())
    }

    async fn record_run_started(&self, feed: &str, at: DateTime<Utc>) -> Result<()> {
        let _handle = self.checkout();
        let mut state = self.lock()?;
        state
            .sync_states
            .entry(feed.to_string())
            .or_insert_with(|| SyncState::empty(feed))
            .last_run_at = Some(at);
        Ok(())
    }

    async fn record_run_succeeded(
        &self,
        feed: &str,
        cursor: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let _handle = self.checkout();
        let mut state = self.lock()?;
        let entry = state
            .sync_states
            .entry(feed.to_string())
            .or_insert_with(|| SyncState::empty(feed));
        entry.last_success_at = Some(at);
        entry.cursor = match (entry.cursor, cursor) {
            (Some(current), Some(next)) => Some(current.max(next)),
            (current, next) => next.or(current),
        };
        Ok(())
    }

    async fn create_job(&self, job_type: JobType, metadata: &serde_json::Value) -> Result<JobLog> {
        let _handle = self.checkout();
        let job = JobLog {
            id: Uuid::new_v4(),
            job_type,
            status: JobStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            note: None,
            metadata: metadata.clone(),
        };
        self.lock()?.jobs.push(job.clone());
        Ok(job)
    }

    async fn finalize_job(
        &self,
        id: Uuid,
        status: JobStatus,
        note: &str,
        metadata: &serde_json::Value,
    ) -> Result<bool> {
        let _handle = self.checkout();
        if !status.is_terminal() {
            bail!("cannot finalize job {id} with non-terminal status {}", status.as_str());
        }
        let mut state = self.lock()?;
        let Some(job) = state
            .jobs
            .iter_mut()
            .find(|job| job.id == id && job.finished_at.is_none())
        else {
            return Ok(false);
        };
        job.status = status;
        job.note = Some(note.to_string());
        job.metadata = metadata.clone();
        job.finished_at = Some(Utc::now());
        Ok(true)
    }

    async fn recent_jobs(&self, limit: usize) -> Result<Vec<JobLog>> {
        let _handle = self.checkout();
        let state = self.lock()?;
        Ok(state.jobs.iter().rev().take(limit).cloned().collect())
    }

    async fn flag(&self, key: &str) -> Result<bool> {
        let _handle = self.checkout();
        Ok(self.lock()?.flags.get(key).copied().unwrap_or(false))
    }

    async fn set_flag(&self, key: &str, value: bool) -> Result<()> {
        let _handle = self.checkout();
        self.lock()?.flags.insert(key.to_string(), value);
        Ok(())
    }

    async fn try_acquire_lock(&self, name: &str, holder: Uuid, ttl: Duration) -> Result<bool> {
        let _handle = self.checkout();
        let mut state = self.lock()?;
        let now = Instant::now();
        if let Some((current, expires_at)) = state.locks.get(name) {
            if *current != holder && *expires_at > now {
                return Ok(false);
            }
        }
        state.locks.insert(name.to_string(), (holder, now + ttl));
        Ok(true)
    }

    async fn release_lock(&self, name: &str, holder: Uuid) -> Result<()> {
        let _handle = self.checkout();
        let mut state = self.lock()?;
        if state.locks.get(name).is_some_and(|(current, _)| *current == holder) {
            state.locks.remove(name);
        }
        Ok(())
    }

    async fn load_checkpoint(&self, run_id: Uuid, step: &str) -> Result<Option<serde_json::Value>> {
        let _handle = self.checkout();
        Ok(self
            .lock()?
            .checkpoints
            .get(&(run_id, step.to_string()))
            .cloned())
    }

    async fn save_checkpoint(
        &self,
        run_id: Uuid,
        step: &str,
        output: &serde_json::Value,
    ) -> Result<()> {
        let _handle = self.checkout();
        self.lock()?
            .checkpoints
            .entry((run_id, step.to_string()))
            .or_insert_with(|| output.clone());
        Ok(())
    }
}

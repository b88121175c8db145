//! Ordered stages of one sync, shared by the bounded and durable runners.
//!
//! Each stage is a small method on [`SyncPlan`]; runners only decide how the
//! stages are sequenced, retried and checkpointed. Store calls and lookups
//! never overlap: a stage that needs the store finishes with it before any
//! network call starts.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tsync_adapters::{project_release, LookupOutcome, ReleasePage, ReleaseSource, TenderLookup};
use tsync_core::{
    DateWindow, Enrichment, ReleaseDraft, ReleaseKey, SyncMode, UpsertOutcome, OCDS_FEED,
};
use tsync_storage::{FetchError, ReleaseStore};
use uuid::Uuid;

use crate::config::PlanSettings;
use crate::jobs::JobReport;

/// Operator input for one sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    #[serde(default)]
    pub mode: SyncMode,
    /// Explicit window; overrides cursor and lookback.
    #[serde(default)]
    pub range: Option<DateWindow>,
    #[serde(default)]
    pub cap_override: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedWindow {
    pub window: DateWindow,
    pub explicit: bool,
    /// Cursor as stored when the run started.
    pub prior_cursor: Option<DateTime<Utc>>,
}

/// Tracks the newest release date seen and whether dates arrived in
/// non-decreasing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    latest: Option<DateTime<Utc>>,
    ordered: bool,
}

impl Default for Watermark {
    fn default() -> Self {
        Self {
            latest: None,
            ordered: true,
        }
    }
}

impl Watermark {
    pub fn observe(&mut self, at: DateTime<Utc>) {
        if self.latest.is_some_and(|latest| at < latest) {
            self.ordered = false;
        }
        self.latest = self.latest.max(Some(at));
    }

    /// Date every earlier release is known to be processed through, if any.
    pub fn safe_point(&self) -> Option<DateTime<Utc>> {
        if self.ordered {
            self.latest
        } else {
            None
        }
    }
}

/// Cursor to record at the end of a run.
///
/// A fully attempted window moves the cursor to its end. An early stop may
/// move it to the watermark. Neither happens when the window starts past the
/// stored cursor, since that would skip the gap in between.
pub fn next_cursor(
    resolved: &ResolvedWindow,
    completed: bool,
    watermark: &Watermark,
) -> Option<DateTime<Utc>> {
    let contiguous = resolved
        .prior_cursor
        .map_or(true, |cursor| resolved.window.from <= cursor);
    if !contiguous {
        return None;
    }
    let candidate = if completed {
        Some(resolved.window.to)
    } else {
        watermark.safe_point()
    };
    candidate.filter(|next| resolved.prior_cursor.map_or(true, |cursor| *next > cursor))
}

/// `max(ceil(new_share * estimated_total), base)`; the sample is the first
/// page and the total is extrapolated over the page limit when more pages
/// follow.
pub fn enrichment_cap(
    new_in_sample: usize,
    sample_len: usize,
    has_more: bool,
    max_pages: u32,
    base: usize,
) -> usize {
    if sample_len == 0 {
        return base;
    }
    let estimated_total = if has_more {
        sample_len.saturating_mul(max_pages as usize)
    } else {
        sample_len
    };
    let share = new_in_sample.min(sample_len) as f64 / sample_len as f64;
    let extrapolated = (share * estimated_total as f64).ceil() as usize;
    extrapolated.max(base)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentBudget {
    pub cap: usize,
    pub used: usize,
}

impl EnrichmentBudget {
    pub fn new(cap: usize) -> Self {
        Self { cap, used: 0 }
    }

    pub fn try_take(&mut self) -> bool {
        if self.used < self.cap {
            self.used += 1;
            true
        } else {
            false
        }
    }
}

/// Counters and outcome of one sync run; also the job-log metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub run_id: Uuid,
    pub mode: SyncMode,
    pub window: Option<DateWindow>,
    pub pages_fetched: u32,
    pub releases_seen: usize,
    pub skipped: usize,
    pub inserted: usize,
    pub updated: usize,
    pub enrichment_cap: usize,
    pub enrich_attempted: usize,
    pub enriched: usize,
    pub not_found: usize,
    pub lookup_unavailable: usize,
    pub failed: usize,
    pub stopped_early: bool,
    pub stop_reason: Option<String>,
    pub cursor: Option<DateTime<Utc>>,
}

impl SyncSummary {
    pub fn new(run_id: Uuid, mode: SyncMode) -> Self {
        Self {
            run_id,
            mode,
            ..Self::default()
        }
    }

    pub fn record_lookup(&mut self, outcome: &LookupOutcome) {
        self.enrich_attempted += 1;
        match outcome {
            LookupOutcome::Found(_) => self.enriched += 1,
            LookupOutcome::NotFound => self.not_found += 1,
            LookupOutcome::Unavailable(_) => self.lookup_unavailable += 1,
        }
    }

    pub fn record_upsert(&mut self, outcome: &UpsertOutcome) {
        if outcome.inserted {
            self.inserted += 1;
        } else {
            self.updated += 1;
        }
    }

    pub fn stop(&mut self, reason: impl Into<String>) {
        self.stopped_early = true;
        self.stop_reason = Some(reason.into());
    }
}

impl JobReport for SyncSummary {
    fn note(&self) -> String {
        let mut note = format!(
            "{} sync: {} releases over {} pages ({} new, {} updated, {} skipped, {} failed); enriched {}/{} (cap {})",
            self.mode.as_str(),
            self.releases_seen,
            self.pages_fetched,
            self.inserted,
            self.updated,
            self.skipped,
            self.failed,
            self.enriched,
            self.enrich_attempted,
            self.enrichment_cap,
        );
        if let Some(reason) = &self.stop_reason {
            note.push_str(&format!("; stopped early: {reason}"));
        }
        match self.cursor {
            Some(cursor) => note.push_str(&format!("; cursor at {}", cursor.to_rfc3339())),
            None => note.push_str("; cursor unchanged"),
        }
        note
    }
}

/// Feed page projected onto drafts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectedPage {
    pub drafts: Vec<ReleaseDraft>,
    pub skipped: usize,
}

pub fn project(page: &ReleasePage) -> ProjectedPage {
    let mut out = ProjectedPage::default();
    for raw in &page.releases {
        match project_release(raw) {
            Some(draft) => out.drafts.push(draft),
            None => out.skipped += 1,
        }
    }
    out
}

/// Pair each draft with the enrichment found for its key, in feed order.
pub fn merge_results(
    drafts: Vec<ReleaseDraft>,
    results: &HashMap<ReleaseKey, Enrichment>,
) -> Vec<(ReleaseDraft, Option<Enrichment>)> {
    drafts
        .into_iter()
        .map(|draft| {
            let enrichment = results.get(&draft.key).cloned();
            (draft, enrichment)
        })
        .collect()
}

pub struct SyncPlan {
    store: Arc<dyn ReleaseStore>,
    source: Arc<dyn ReleaseSource>,
    lookup: Arc<dyn TenderLookup>,
    settings: PlanSettings,
}

impl SyncPlan {
    pub fn new(
        store: Arc<dyn ReleaseStore>,
        source: Arc<dyn ReleaseSource>,
        lookup: Arc<dyn TenderLookup>,
        settings: PlanSettings,
    ) -> Self {
        Self {
            store,
            source,
            lookup,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn ReleaseStore> {
        &self.store
    }

    pub fn settings(&self) -> &PlanSettings {
        &self.settings
    }

    pub async fn resolve_window(
        &self,
        request: &SyncRequest,
        now: DateTime<Utc>,
    ) -> Result<ResolvedWindow> {
        let prior_cursor = self
            .store
            .sync_state(OCDS_FEED)
            .await
            .context("loading sync cursor")?
            .and_then(|state| state.cursor);

        if let Some(range) = request.range {
            return Ok(ResolvedWindow {
                window: range,
                explicit: true,
                prior_cursor,
            });
        }
        let window = match request.mode {
            SyncMode::Backfill => DateWindow::lookback(now, self.settings.backfill_lookback_days),
            SyncMode::Daily | SyncMode::Comprehensive => match prior_cursor {
                Some(cursor) if cursor < now => DateWindow::new(cursor, now),
                _ => DateWindow::lookback(now, self.settings.default_lookback_days),
            },
        };
        Ok(ResolvedWindow {
            window,
            explicit: false,
            prior_cursor,
        })
    }

    pub async fn health_check(&self, cancel: &CancellationToken) -> Result<(), FetchError> {
        self.source.probe(cancel).await
    }

    pub async fn fetch_first_page(
        &self,
        window: DateWindow,
        cancel: &CancellationToken,
    ) -> Result<ReleasePage, FetchError> {
        self.source
            .fetch_first_page(window, self.settings.page_size, cancel)
            .await
    }

    pub async fn fetch_page(
        &self,
        window: DateWindow,
        page: u32,
        page_size: u32,
        cancel: &CancellationToken,
    ) -> Result<ReleasePage, FetchError> {
        let query = tsync_adapters::PageQuery {
            window,
            page,
            page_size,
        };
        self.source.fetch_page(&query, cancel).await
    }

    pub async fn plan_enrichment_cap(
        &self,
        request: &SyncRequest,
        window: &DateWindow,
        first_page: &ReleasePage,
        first_drafts: &[ReleaseDraft],
    ) -> Result<usize> {
        if let Some(cap) = request.cap_override {
            return Ok(cap);
        }
        let base = self.settings.enrich_base_cap;
        if request.mode == SyncMode::Comprehensive {
            let uncategorized = self
                .store
                .count_uncategorized(window)
                .await
                .context("counting uncategorized releases")?;
            let wanted = usize::try_from(uncategorized)
                .unwrap_or(usize::MAX)
                .saturating_add(self.settings.comprehensive_buffer);
            return Ok(wanted.max(base));
        }

        let keys: Vec<ReleaseKey> = first_drafts.iter().map(|d| d.key.clone()).collect();
        let existing = self
            .store
            .existing_releases(&keys)
            .await
            .context("sampling first page against the store")?;
        let new_in_sample = keys.iter().filter(|k| !existing.contains_key(*k)).count();
        let cap = enrichment_cap(
            new_in_sample,
            first_drafts.len(),
            first_page.has_more,
            self.settings.max_pages,
            base,
        );
        debug!(new_in_sample, sample = first_drafts.len(), cap, "planned enrichment cap");
        Ok(cap)
    }

    /// Keys worth a lookup: releases with a tender number that are new to
    /// the store or stored without a category.
    pub async fn enrichment_targets(&self, drafts: &[ReleaseDraft]) -> Result<Vec<ReleaseKey>> {
        let keys: Vec<ReleaseKey> = drafts.iter().map(|d| d.key.clone()).collect();
        let existing = self
            .store
            .existing_releases(&keys)
            .await
            .context("loading stored state of page releases")?;
        Ok(drafts
            .iter()
            .filter(|draft| draft.tender_number.is_some())
            .filter(|draft| existing.get(&draft.key).map_or(true, |e| !e.categorized))
            .map(|draft| draft.key.clone())
            .collect())
    }

    pub async fn enrich(&self, draft: &ReleaseDraft, cancel: &CancellationToken) -> LookupOutcome {
        match draft.tender_number.as_deref() {
            Some(code) => self.lookup.lookup(code, cancel).await,
            None => LookupOutcome::NotFound,
        }
    }

    pub async fn persist(
        &self,
        draft: &ReleaseDraft,
        enrichment: Option<&Enrichment>,
    ) -> Result<UpsertOutcome> {
        self.store.upsert_release(draft, enrichment).await
    }

    /// Conditionally enrich then upsert every draft of one page, in feed
    /// order. Per-release failures are counted, not propagated.
    pub async fn process_page(
        &self,
        drafts: &[ReleaseDraft],
        budget: &mut EnrichmentBudget,
        summary: &mut SyncSummary,
        watermark: &mut Watermark,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let targets = self.enrichment_targets(drafts).await?;
        for draft in drafts {
            summary.releases_seen += 1;
            let enrichment = if targets.contains(&draft.key) && budget.try_take() {
                let outcome = self.enrich(draft, cancel).await;
                summary.record_lookup(&outcome);
                outcome.into_enrichment()
            } else {
                None
            };

            match self.persist(draft, enrichment.as_ref()).await {
                Ok(outcome) => summary.record_upsert(&outcome),
                Err(err) => {
                    summary.failed += 1;
                    warn!(ocid = %draft.key.ocid, error = %err, "failed to persist release");
                }
            }
            watermark.observe(draft.key.release_date);
        }
        Ok(())
    }

    pub async fn record_started(&self, at: DateTime<Utc>) -> Result<()> {
        self.store
            .record_run_started(OCDS_FEED, at)
            .await
            .context("recording run start")
    }

    pub async fn advance_cursor(
        &self,
        cursor: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.store
            .record_run_succeeded(OCDS_FEED, cursor, at)
            .await
            .context("advancing sync cursor")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn cap_extrapolates_the_first_page() {
        // 40 of 100 new, 50 pages expected: 2000 new releases
        assert_eq!(enrichment_cap(40, 100, true, 50, 50), 2000);
        // single page, few new: the base wins
        assert_eq!(enrichment_cap(3, 20, false, 50, 50), 50);
        assert_eq!(enrichment_cap(0, 0, true, 50, 7), 7);
        assert_eq!(enrichment_cap(1, 3, false, 50, 0), 1);
    }

    #[test]
    fn budget_stops_at_cap() {
        let mut budget = EnrichmentBudget::new(2);
        assert!(budget.try_take());
        assert!(budget.try_take());
        assert!(!budget.try_take());
        assert_eq!(budget.used, 2);
    }

    #[test]
    fn watermark_requires_ordered_dates() {
        let mut mark = Watermark::default();
        assert_eq!(mark.safe_point(), None);
        mark.observe(at(1, 8));
        mark.observe(at(1, 8));
        mark.observe(at(2, 9));
        assert_eq!(mark.safe_point(), Some(at(2, 9)));
        mark.observe(at(1, 23));
        assert_eq!(mark.safe_point(), None);
    }

    #[test]
    fn completed_window_moves_cursor_to_its_end() {
        let resolved = ResolvedWindow {
            window: DateWindow::new(at(1, 0), at(3, 0)),
            explicit: false,
            prior_cursor: Some(at(1, 0)),
        };
        assert_eq!(next_cursor(&resolved, true, &Watermark::default()), Some(at(3, 0)));
    }

    #[test]
    fn early_stop_uses_watermark_only_when_ordered() {
        let resolved = ResolvedWindow {
            window: DateWindow::new(at(1, 0), at(3, 0)),
            explicit: false,
            prior_cursor: Some(at(1, 0)),
        };
        let mut mark = Watermark::default();
        mark.observe(at(1, 5));
        mark.observe(at(2, 5));
        assert_eq!(next_cursor(&resolved, false, &mark), Some(at(2, 5)));

        mark.observe(at(1, 6));
        assert_eq!(next_cursor(&resolved, false, &mark), None);
    }

    #[test]
    fn cursor_never_jumps_a_gap_or_moves_back() {
        let gap = ResolvedWindow {
            window: DateWindow::new(at(10, 0), at(12, 0)),
            explicit: true,
            prior_cursor: Some(at(3, 0)),
        };
        assert_eq!(next_cursor(&gap, true, &Watermark::default()), None);

        let behind = ResolvedWindow {
            window: DateWindow::new(at(1, 0) - Duration::days(5), at(2, 0)),
            explicit: true,
            prior_cursor: Some(at(5, 0)),
        };
        assert_eq!(next_cursor(&behind, true, &Watermark::default()), None);

        let first_run = ResolvedWindow {
            window: DateWindow::new(at(10, 0), at(12, 0)),
            explicit: false,
            prior_cursor: None,
        };
        assert_eq!(next_cursor(&first_run, true, &Watermark::default()), Some(at(12, 0)));
    }

    #[test]
    fn summary_note_mentions_early_stop_and_cursor() {
        let mut summary = SyncSummary::new(Uuid::nil(), SyncMode::Daily);
        summary.releases_seen = 3;
        summary.stop("deadline reached");
        let note = summary.note();
        assert!(note.starts_with("daily sync: 3 releases"), "{note}");
        assert!(note.contains("stopped early: deadline reached"), "{note}");
        assert!(note.ends_with("cursor unchanged"), "{note}");
    }
}

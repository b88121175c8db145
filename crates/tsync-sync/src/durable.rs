//! Step-checkpointed runner. Every stage is a named step whose output is
//! persisted under `(run_id, step)`; a resumed run replays finished steps
//! from their checkpoints and retries the rest.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use tsync_adapters::{LookupOutcome, ReleasePage};
use tsync_core::{Enrichment, ReleaseDraft, ReleaseKey};
use tsync_storage::ReleaseStore;
use uuid::Uuid;

use crate::config::StepSettings;
use crate::jobs::{PipelineLock, SYNC_LOCK};
use crate::plan::{
    merge_results, next_cursor, project, ResolvedWindow, SyncPlan, SyncRequest, SyncSummary,
    Watermark,
};

#[derive(Debug, Error)]
pub enum StepError {
    #[error("step {step} failed after {attempts} attempts")]
    Exhausted { step: String, attempts: usize },
    #[error("checkpoint of step {step} is unreadable: {message}")]
    Checkpoint { step: String, message: String },
    #[error("step {step} cancelled")]
    Cancelled { step: String },
}

/// Runs named steps for one durable run.
pub struct StepContext<'a> {
    store: &'a dyn ReleaseStore,
    run_id: Uuid,
    settings: StepSettings,
    cancel: &'a CancellationToken,
    lock: Option<&'a PipelineLock>,
}

impl<'a> StepContext<'a> {
    pub fn new(
        store: &'a dyn ReleaseStore,
        run_id: Uuid,
        settings: StepSettings,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            store,
            run_id,
            settings,
            cancel,
            lock: None,
        }
    }

    /// Renew `lock` before every executed step.
    pub fn with_lock(mut self, lock: &'a PipelineLock) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Saved output of `step`, if it already ran.
    pub async fn replay<T: DeserializeOwned>(&self, step: &str) -> Result<Option<T>> {
        let Some(saved) = self.store.load_checkpoint(self.run_id, step).await? else {
            return Ok(None);
        };
        debug!(step, "replaying checkpoint");
        serde_json::from_value(saved)
            .map(Some)
            .map_err(|err| {
                StepError::Checkpoint {
                    step: step.to_string(),
                    message: err.to_string(),
                }
                .into()
            })
    }

    /// Replays `step` or runs `work` with up to `max_attempts` tries,
    /// checkpointing the first successful output.
    pub async fn run<T, F, Fut>(&self, step: &str, work: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(output) = self.replay(step).await? {
            return Ok(output);
        }
        let output = self.attempt(step, work).await?;
        let value = serde_json::to_value(&output)
            .with_context(|| format!("serializing output of step {step}"))?;
        self.store.save_checkpoint(self.run_id, step, &value).await?;
        Ok(output)
    }

    /// Runs `work` with the same retries as [`run`](Self::run) but saves no
    /// checkpoint, so a resumed run executes it again.
    pub async fn run_unsaved<T, F, Fut>(&self, step: &str, work: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.attempt(step, work).await
    }

    async fn attempt<T, F, Fut>(&self, step: &str, mut work: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(lock) = self.lock {
            lock.renew().await?;
        }
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match work().await {
                Ok(output) => {
                    debug!(step, attempt, "step completed");
                    return Ok(output);
                }
                Err(err) if self.cancel.is_cancelled() => {
                    return Err(err.context(StepError::Cancelled {
                        step: step.to_string(),
                    }));
                }
                Err(err) if attempt < max_attempts => {
                    warn!(step, attempt, error = %format!("{err:#}"), "step failed, retrying");
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = tokio::time::sleep(self.settings.retry_delay) => {}
                    }
                }
                Err(err) => {
                    return Err(err.context(StepError::Exhausted {
                        step: step.to_string(),
                        attempts: attempt,
                    }));
                }
            }
        }
    }
}

/// Checkpointed result of one enrichment step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "enrichment", rename_all = "snake_case")]
enum EnrichStep {
    Found(Enrichment),
    NotFound,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct PersistCounts {
    inserted: usize,
    updated: usize,
    failed: usize,
}

pub struct DurableRunner {
    plan: Arc<SyncPlan>,
    settings: StepSettings,
    lock_ttl: Duration,
}

impl DurableRunner {
    pub fn new(plan: Arc<SyncPlan>, settings: StepSettings, lock_ttl: Duration) -> Self {
        Self {
            plan,
            settings,
            lock_ttl,
        }
    }

    /// Start a new run under `run_id`; keep the id to resume it later.
    pub async fn start(
        &self,
        run_id: Uuid,
        request: &SyncRequest,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary> {
        self.execute(run_id, Some(request), cancel).await
    }

    /// Continue a failed or interrupted run from its checkpoints.
    pub async fn resume(&self, run_id: Uuid, cancel: &CancellationToken) -> Result<SyncSummary> {
        self.execute(run_id, None, cancel).await
    }

    async fn execute(
        &self,
        run_id: Uuid,
        request: Option<&SyncRequest>,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary> {
        let lock =
            PipelineLock::acquire(self.plan.store().clone(), SYNC_LOCK, run_id, self.lock_ttl)
                .await?;
        let span = info_span!("durable_sync", %run_id, resumed = request.is_none());
        let result = self
            .steps(run_id, request, &lock, cancel)
            .instrument(span)
            .await;
        lock.release().await;
        result
    }

    async fn steps(
        &self,
        run_id: Uuid,
        request: Option<&SyncRequest>,
        lock: &PipelineLock,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary> {
        let plan = &*self.plan;
        let ctx =
            StepContext::new(plan.store().as_ref(), run_id, self.settings, cancel).with_lock(lock);

        let request: SyncRequest = match request {
            Some(request) => ctx.run("request", || async move { Ok(request.clone()) }).await?,
            None => ctx
                .replay("request")
                .await?
                .ok_or_else(|| anyhow!("no durable run {run_id} to resume"))?,
        };
        let request = &request;
        let mut summary = SyncSummary::new(run_id, request.mode);

        let started_at: DateTime<Utc> = ctx
            .run("record-start", || async move {
                let now = Utc::now();
                plan.record_started(now).await.map(|_| now)
            })
            .await?;

        // classifies an outage before any page is requested
        ctx.run("health-check", || async move {
            plan.health_check(cancel).await.map_err(anyhow::Error::from)
        })
        .await?;

        let resolved: ResolvedWindow = ctx
            .run("resolve-window", || async move {
                plan.resolve_window(request, started_at).await
            })
            .await?;
        let window = resolved.window;
        summary.window = Some(window);

        let first: ReleasePage = ctx
            .run("fetch-page-1", || async move {
                plan.fetch_first_page(window, cancel)
                    .await
                    .map_err(anyhow::Error::from)
            })
            .await?;
        let page_size = first.page_size;
        let max_pages = plan.settings().max_pages;
        let mut pages = vec![first];
        while pages.last().is_some_and(|p| p.has_more) && (pages.len() as u32) < max_pages {
            let number = pages.len() as u32 + 1;
            let page: ReleasePage = ctx
                .run(&format!("fetch-page-{number}"), || async move {
                    plan.fetch_page(window, number, page_size, cancel)
                        .await
                        .map_err(anyhow::Error::from)
                })
                .await?;
            pages.push(page);
        }
        let truncated = pages.last().is_some_and(|p| p.has_more);
        if truncated {
            summary.stop(format!("page limit {max_pages} reached"));
        }
        summary.pages_fetched = pages.len() as u32;

        let first_projected = project(&pages[0]);
        let first_drafts = &first_projected.drafts;
        let first_page = &pages[0];
        summary.enrichment_cap = ctx
            .run("plan-cap", || async move {
                plan.plan_enrichment_cap(request, &window, first_page, first_drafts)
                    .await
            })
            .await?;

        let mut drafts: Vec<ReleaseDraft> = Vec::new();
        for page in &pages {
            let projected = project(page);
            summary.skipped += projected.skipped;
            drafts.extend(projected.drafts);
        }
        let all_drafts = &drafts;
        let mut targets: Vec<ReleaseKey> = ctx
            .run("select-targets", || async move {
                plan.enrichment_targets(all_drafts).await
            })
            .await?;
        targets.truncate(summary.enrichment_cap);

        let by_key: HashMap<&ReleaseKey, &ReleaseDraft> =
            drafts.iter().map(|d| (&d.key, d)).collect();
        let mut results: HashMap<ReleaseKey, Enrichment> = HashMap::new();
        let mut outstanding = 0usize;
        for key in &targets {
            let Some(draft) = by_key.get(key).copied() else {
                continue;
            };
            let step = format!("enrich-{key}");
            let outcome = ctx
                .run(&step, || async move {
                    match plan.enrich(draft, cancel).await {
                        LookupOutcome::Found(hit) => Ok(EnrichStep::Found(hit.enrichment)),
                        LookupOutcome::NotFound => Ok(EnrichStep::NotFound),
                        LookupOutcome::Unavailable(reason) => {
                            Err(anyhow!("enrichment provider unavailable: {reason}"))
                        }
                    }
                })
                .await;
            match outcome {
                Ok(EnrichStep::Found(enrichment)) => {
                    summary.enrich_attempted += 1;
                    summary.enriched += 1;
                    results.insert(key.clone(), enrichment);
                }
                Ok(EnrichStep::NotFound) => summary.record_lookup(&LookupOutcome::NotFound),
                // left without a checkpoint so a resume tries it again
                Err(err) => {
                    warn!(%key, error = %format!("{err:#}"), "enrichment step gave up");
                    summary.record_lookup(&LookupOutcome::Unavailable(err.to_string()));
                    outstanding += 1;
                }
            }
        }

        // merge and persist stay unsaved while any enrichment step lacks a checkpoint
        let results = &results;
        let merge = || async move {
            Ok::<_, anyhow::Error>(merge_results(all_drafts.clone(), results))
        };
        let merged: Vec<(ReleaseDraft, Option<Enrichment>)> = if outstanding == 0 {
            ctx.run("merge", merge).await?
        } else {
            warn!(outstanding, "enrichment steps outstanding, merge and persist left unsaved");
            ctx.run_unsaved("merge", merge).await?
        };

        let merged_ref = &merged;
        let persist = || async move {
            let mut counts = PersistCounts::default();
            for (draft, enrichment) in merged_ref {
                match plan.persist(draft, enrichment.as_ref()).await {
                    Ok(outcome) if outcome.inserted => counts.inserted += 1,
                    Ok(_) => counts.updated += 1,
                    Err(err) => {
                        counts.failed += 1;
                        warn!(ocid = %draft.key.ocid, error = %err, "failed to persist release");
                    }
                }
            }
            Ok::<_, anyhow::Error>(counts)
        };
        let counts: PersistCounts = if outstanding == 0 {
            ctx.run("persist-batch", persist).await?
        } else {
            ctx.run_unsaved("persist-batch", persist).await?
        };
        summary.inserted = counts.inserted;
        summary.updated = counts.updated;
        summary.failed = counts.failed;
        summary.releases_seen = merged.len();

        let mut watermark = Watermark::default();
        for (draft, _) in &merged {
            watermark.observe(draft.key.release_date);
        }
        let cursor = next_cursor(&resolved, !truncated, &watermark);
        summary.cursor = ctx
            .run("advance-cursor", || async move {
                plan.advance_cursor(cursor, Utc::now()).await.map(|_| cursor)
            })
            .await?;

        info!(
            pages = summary.pages_fetched,
            releases = summary.releases_seen,
            enriched = summary.enriched,
            "durable sync finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tsync_core::{DateWindow, SyncMode, OCDS_FEED};
    use tsync_adapters::TenderLookup;
    use tsync_storage::MemoryReleaseStore;

    use crate::config::PlanSettings;
    use crate::jobs::{classify, FailureKind};
    use crate::testing::{
        categorized, release, DownLookup, PageScript, RecordingLookup, ScriptedSource,
    };

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0).unwrap()
    }

    fn request() -> SyncRequest {
        SyncRequest {
            mode: SyncMode::Daily,
            range: Some(DateWindow::new(at(1, 0), at(3, 0))),
            cap_override: None,
        }
    }

    fn fast_steps() -> StepSettings {
        StepSettings {
            max_attempts: 2,
            retry_delay: Duration::from_millis(1),
        }
    }

    fn runner(
        store: &MemoryReleaseStore,
        source: Arc<ScriptedSource>,
        lookup: Arc<dyn TenderLookup>,
    ) -> DurableRunner {
        runner_with_ttl(store, source, lookup, Duration::from_secs(600))
    }

    fn runner_with_ttl(
        store: &MemoryReleaseStore,
        source: Arc<ScriptedSource>,
        lookup: Arc<dyn TenderLookup>,
        lock_ttl: Duration,
    ) -> DurableRunner {
        let plan = SyncPlan::new(
            Arc::new(store.clone()),
            source,
            lookup,
            PlanSettings {
                page_size: 2,
                max_pages: 10,
                enrich_base_cap: 10,
                ..PlanSettings::default()
            },
        );
        DurableRunner::new(Arc::new(plan), fast_steps(), lock_ttl)
    }

    fn lamps() -> PageScript {
        PageScript::Releases(vec![release("ocds-3", "2025-03-02T10:00:00Z", "Lamps")])
    }

    /// Takes `delay` per lookup, then checks whether a stranger could take
    /// the sync lock.
    struct SlowLookup {
        store: MemoryReleaseStore,
        delay: Duration,
        stolen: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TenderLookup for SlowLookup {
        async fn lookup(&self, _code: &str, _cancel: &CancellationToken) -> LookupOutcome {
            tokio::time::sleep(self.delay).await;
            if self
                .store
                .try_acquire_lock(SYNC_LOCK, Uuid::new_v4(), Duration::from_secs(1))
                .await
                .unwrap()
            {
                self.stolen.fetch_add(1, Ordering::SeqCst);
            }
            LookupOutcome::NotFound
        }
    }

    fn pages(second: PageScript) -> Vec<PageScript> {
        vec![
            PageScript::Releases(vec![
                release("ocds-1", "2025-03-01T08:00:00Z", "RFQ/101/2025 Office chairs"),
                release("ocds-2", "2025-03-01T09:00:00Z", "Desks"),
            ]),
            second,
        ]
    }

    #[tokio::test]
    async fn completes_all_steps_and_checkpoints_them() {
        let store = MemoryReleaseStore::new();
        let lookup = Arc::new(RecordingLookup::new(
            &store,
            vec![("RFQ/101/2025", categorized("Furniture"))],
        ));
        let source = ScriptedSource::new(pages(PageScript::Releases(vec![release(
            "ocds-3",
            "2025-03-02T10:00:00Z",
            "Lamps",
        )])));
        let summary = runner(&store, source, lookup.clone())
            .start(Uuid::new_v4(), &request(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.pages_fetched, 2);
        assert_eq!(summary.inserted, 3);
        assert_eq!(summary.enriched, 1);
        assert_eq!(summary.cursor, Some(at(3, 0)));
        assert_eq!(lookup.held_handles(), 0);

        for step in ["request", "health-check", "fetch-page-2", "merge", "persist-batch", "advance-cursor"] {
            assert!(
                store.load_checkpoint(summary.run_id, step).await.unwrap().is_some(),
                "missing checkpoint {step}"
            );
        }
        let record = store
            .find_release(&ReleaseKey::new("ocds-1", at(1, 8)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.enrichment.detailed_category.as_deref(), Some("Furniture"));
    }

    #[tokio::test]
    async fn failed_run_resumes_from_checkpoints() {
        let store = MemoryReleaseStore::new();
        let lookup = Arc::new(RecordingLookup::new(&store, Vec::new()));
        let run_id = Uuid::new_v4();
        let err = runner(&store, ScriptedSource::new(pages(PageScript::Down)), lookup.clone())
            .start(run_id, &request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(classify(&err), FailureKind::UpstreamUnavailable);
        assert!(err.downcast_ref::<StepError>().is_some());
        assert_eq!(store.release_count(), 0);

        let healed = ScriptedSource::new(pages(PageScript::Releases(vec![release(
            "ocds-3",
            "2025-03-02T10:00:00Z",
            "Lamps",
        )])));
        let summary = runner(&store, healed.clone(), lookup)
            .resume(run_id, &CancellationToken::new())
            .await
            .unwrap();

        // page one came from its checkpoint
        assert_eq!(healed.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(summary.run_id, run_id);
        assert_eq!(store.release_count(), 3);
        let state = store.sync_state(OCDS_FEED).await.unwrap().unwrap();
        assert_eq!(state.cursor, Some(at(3, 0)));
    }

    #[tokio::test]
    async fn unhealthy_feed_fails_before_fetching() {
        let store = MemoryReleaseStore::new();
        let lookup = Arc::new(RecordingLookup::new(&store, Vec::new()));
        let source = ScriptedSource::down();
        let err = runner(&store, source.clone(), lookup)
            .start(Uuid::new_v4(), &request(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(classify(&err), FailureKind::UpstreamUnavailable);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resume_of_unknown_run_is_an_error() {
        let store = MemoryReleaseStore::new();
        let lookup = Arc::new(RecordingLookup::new(&store, Vec::new()));
        let err = runner(&store, ScriptedSource::new(Vec::new()), lookup)
            .resume(Uuid::new_v4(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no durable run"));
    }

    #[tokio::test]
    async fn steps_retry_then_replay() {
        let store = MemoryReleaseStore::new();
        let cancel = CancellationToken::new();
        let ctx = StepContext::new(&store, Uuid::new_v4(), fast_steps(), &cancel);
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        let value: u32 = ctx
            .run("flaky", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(anyhow!("transient"))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let replayed: u32 = ctx
            .run("flaky", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(99)
            })
            .await
            .unwrap();
        assert_eq!(replayed, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let err = ctx
            .run::<u32, _, _>("broken", || async move { Err(anyhow!("always")) })
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StepError>(),
            Some(StepError::Exhausted { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn resume_persists_enrichment_that_was_unavailable_at_first() {
        let store = MemoryReleaseStore::new();
        let run_id = Uuid::new_v4();
        let key = ReleaseKey::new("ocds-1", at(1, 8));

        let first = runner(&store, ScriptedSource::new(pages(lamps())), Arc::new(DownLookup))
            .start(run_id, &request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.lookup_unavailable, 3);
        assert_eq!(store.release_count(), 3);
        for step in ["merge", "persist-batch"] {
            assert!(store.load_checkpoint(run_id, step).await.unwrap().is_none());
        }
        let record = store.find_release(&key).await.unwrap().unwrap();
        assert_eq!(record.enrichment.detailed_category, None);

        let lookup = Arc::new(RecordingLookup::new(
            &store,
            vec![("RFQ/101/2025", categorized("Furniture"))],
        ));
        let resumed = runner(&store, ScriptedSource::new(Vec::new()), lookup.clone())
            .resume(run_id, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(resumed.enriched, 1);
        assert_eq!(resumed.lookup_unavailable, 0);
        assert_eq!(lookup.calls().len(), 3);
        assert!(store.load_checkpoint(run_id, "persist-batch").await.unwrap().is_some());
        let record = store.find_release(&key).await.unwrap().unwrap();
        assert_eq!(record.enrichment.detailed_category.as_deref(), Some("Furniture"));
        assert_eq!(store.release_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn long_run_keeps_the_lock_past_its_first_ttl() {
        let store = MemoryReleaseStore::new();
        let lookup = Arc::new(SlowLookup {
            store: store.clone(),
            delay: Duration::from_secs(6),
            stolen: AtomicUsize::new(0),
        });
        let started = tokio::time::Instant::now();
        let summary = runner_with_ttl(
            &store,
            ScriptedSource::new(pages(lamps())),
            lookup.clone(),
            Duration::from_secs(10),
        )
        .start(Uuid::new_v4(), &request(), &CancellationToken::new())
        .await
        .unwrap();

        assert_eq!(summary.not_found, 3);
        assert!(started.elapsed() >= Duration::from_secs(18));
        assert_eq!(lookup.stolen.load(Ordering::SeqCst), 0);
        // released at the end
        assert!(store
            .try_acquire_lock(SYNC_LOCK, Uuid::new_v4(), Duration::from_secs(1))
            .await
            .unwrap());
    }
}

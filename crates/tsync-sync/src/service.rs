//! Operator-facing entry points. Every trigger runs inside a job-log entry;
//! the read surfaces never write.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tsync_adapters::{
    EnrichmentClient, PacedLookup, ReleaseFetcher, ReleaseSource, TenderLookup,
};
use tsync_core::{DateWindow, EnrichmentProgress, JobLog, JobType, SyncHealth, SyncState, OCDS_FEED};
use tsync_storage::{HttpFetcher, HttpTransport, PgReleaseStore, ReleaseStore, ReqwestTransport};
use uuid::Uuid;

use crate::backfill::{request_cancel, BackfillController, BackfillReport, BackfillRequest};
use crate::batch::{BatchProcessor, BatchReport};
use crate::bounded::BoundedRunner;
use crate::config::{RunnerKind, SyncConfig};
use crate::durable::DurableRunner;
use crate::jobs::record_job;
use crate::plan::{SyncPlan, SyncRequest, SyncSummary};

/// Lock TTL of a durable run. Renewed before every executed step, so it
/// only bounds a single step.
const DURABLE_LOCK_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub state: Option<SyncState>,
    pub health: SyncHealth,
    pub checked_at: DateTime<Utc>,
}

pub struct SyncService {
    store: Arc<dyn ReleaseStore>,
    lookup: Arc<dyn TenderLookup>,
    plan: Arc<SyncPlan>,
    config: SyncConfig,
    shutdown: CancellationToken,
}

impl SyncService {
    pub fn new(
        store: Arc<dyn ReleaseStore>,
        source: Arc<dyn ReleaseSource>,
        lookup: Arc<dyn TenderLookup>,
        config: SyncConfig,
    ) -> Self {
        let plan = SyncPlan::new(
            store.clone(),
            source,
            lookup.clone(),
            config.plan_settings(),
        );
        Self {
            store,
            lookup,
            plan: Arc::new(plan),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Production wiring: Postgres store, reqwest transport, paced lookups.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let store = PgReleaseStore::connect(&config.database_url, config.db_max_connections)
            .await
            .context("connecting release store")?;
        let transport: Arc<dyn HttpTransport> =
            Arc::new(ReqwestTransport::new(Some(&config.user_agent))?);

        let source = ReleaseFetcher::new(
            HttpFetcher::new(transport.clone(), config.fetch_retry_policy()),
            config.ocds_api_url.clone(),
        );
        let client = EnrichmentClient::new(
            transport,
            config.enrichment_api_url.clone(),
            config.lookup_settings(),
        );
        let lookup = PacedLookup::new(Arc::new(client), config.lookup_delay());

        Ok(Self::new(
            Arc::new(store),
            Arc::new(source),
            Arc::new(lookup),
            config,
        ))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ReleaseStore> {
        &self.store
    }

    /// Cancelled on process shutdown; in-flight runs stop at their next check.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// run-sync-now, on the configured runner.
    pub async fn run_sync(&self, request: &SyncRequest) -> Result<SyncSummary> {
        match self.config.runner {
            RunnerKind::Bounded => self.run_bounded(request).await,
            RunnerKind::Durable => self.run_durable(request).await,
        }
    }

    pub async fn run_bounded(&self, request: &SyncRequest) -> Result<SyncSummary> {
        let runner = BoundedRunner::new(self.plan.clone(), self.config.bounded_settings());
        record_job(
            &self.store,
            JobType::Sync,
            json!({ "request": request }),
            runner.run(request, &self.shutdown),
        )
        .await
    }

    pub async fn run_durable(&self, request: &SyncRequest) -> Result<SyncSummary> {
        let run_id = Uuid::new_v4();
        record_job(
            &self.store,
            JobType::SyncDurable,
            json!({ "request": request, "run_id": run_id }),
            self.durable_runner().start(run_id, request, &self.shutdown),
        )
        .await
    }

    pub async fn resume_durable(&self, run_id: Uuid) -> Result<SyncSummary> {
        record_job(
            &self.store,
            JobType::SyncDurable,
            json!({ "run_id": run_id, "resumed": true }),
            self.durable_runner().resume(run_id, &self.shutdown),
        )
        .await
    }

    fn durable_runner(&self) -> DurableRunner {
        DurableRunner::new(
            self.plan.clone(),
            self.config.step_settings(),
            DURABLE_LOCK_TTL,
        )
    }

    pub async fn enrich_today(&self, cap_override: Option<usize>) -> Result<BatchReport> {
        let processor = BatchProcessor::new(
            self.store.clone(),
            self.lookup.clone(),
            self.config.batch_settings(),
        );
        record_job(
            &self.store,
            JobType::EnrichToday,
            json!({ "cap_override": cap_override }),
            processor.enrich_today(cap_override, Utc::now(), &self.shutdown),
        )
        .await
    }

    pub async fn run_backfill(&self, request: &BackfillRequest) -> Result<BackfillReport> {
        let controller = BackfillController::new(
            self.store.clone(),
            self.lookup.clone(),
            self.config.backfill_settings(),
        );
        record_job(
            &self.store,
            JobType::Backfill,
            json!({ "request": request }),
            controller.run(request, &self.shutdown),
        )
        .await
    }

    /// Sets the cancel flag; the running backfill resets it when it stops.
    pub async fn cancel_backfill(&self) -> Result<()> {
        request_cancel(self.store.as_ref()).await?;
        info!("backfill cancel requested");
        Ok(())
    }

    pub async fn sync_status(&self) -> Result<SyncStatus> {
        let state = self
            .store
            .sync_state(OCDS_FEED)
            .await
            .context("loading sync state")?;
        let now = Utc::now();
        Ok(SyncStatus {
            health: SyncHealth::from_state(state.as_ref(), now),
            state,
            checked_at: now,
        })
    }

    pub async fn recent_jobs(&self, limit: usize) -> Result<Vec<JobLog>> {
        self.store
            .recent_jobs(limit.clamp(1, 200))
            .await
            .context("loading job log")
    }

    /// Per-day totals against releases still missing enrichment.
    pub async fn enrichment_progress(&self, days: i64) -> Result<Vec<EnrichmentProgress>> {
        let window = DateWindow::lookback(Utc::now(), days.clamp(1, 366));
        self.store
            .enrichment_progress(&window)
            .await
            .context("loading enrichment progress")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsync_core::{JobStatus, SyncMode};
    use tsync_storage::{MemoryReleaseStore, BACKFILL_CANCEL_FLAG};

    use crate::jobs::{APPLICATION_PREFIX, UNAVAILABLE_PREFIX};
    use crate::testing::{release, PageScript, RecordingLookup, ScriptedSource};

    fn config(runner: RunnerKind) -> SyncConfig {
        let mut config = SyncConfig::from_env();
        config.runner = runner;
        config.page_size = 10;
        config.step_attempts = 1;
        config.step_retry_delay_ms = 1;
        config.write_batch_pause_ms = 0;
        config
    }

    fn todays_release(ocid: &str, title: &str) -> serde_json::Value {
        release(ocid, &Utc::now().to_rfc3339(), title)
    }

    fn service(
        store: &MemoryReleaseStore,
        source: Arc<ScriptedSource>,
        runner: RunnerKind,
    ) -> SyncService {
        let lookup = Arc::new(RecordingLookup::new(store, Vec::new()));
        SyncService::new(Arc::new(store.clone()), source, lookup, config(runner))
    }

    #[tokio::test]
    async fn successful_sync_is_logged_and_marks_the_feed_healthy() {
        let store = MemoryReleaseStore::new();
        let source = ScriptedSource::new(vec![PageScript::Releases(vec![todays_release(
            "ocds-1",
            "RFQ/1/2025 Paper",
        )])]);
        let service = service(&store, source, RunnerKind::Bounded);

        let summary = service.run_sync(&SyncRequest::default()).await.unwrap();
        assert_eq!(summary.inserted, 1);

        let jobs = service.recent_jobs(10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_type, JobType::Sync);
        assert_eq!(jobs[0].status, JobStatus::Success);

        let status = service.sync_status().await.unwrap();
        assert_eq!(status.health, SyncHealth::Healthy);

        let progress = service.enrichment_progress(7).await.unwrap();
        assert_eq!(progress.iter().map(|p| p.total).sum::<i64>(), 1);
        assert_eq!(progress.iter().map(|p| p.missing).sum::<i64>(), 1);
    }

    #[tokio::test]
    async fn outage_is_logged_as_upstream_unavailable() {
        let store = MemoryReleaseStore::new();
        let service = service(&store, ScriptedSource::down(), RunnerKind::Durable);

        let request = SyncRequest {
            mode: SyncMode::Daily,
            ..SyncRequest::default()
        };
        assert!(service.run_sync(&request).await.is_err());

        let jobs = service.recent_jobs(10).await.unwrap();
        assert_eq!(jobs[0].job_type, JobType::SyncDurable);
        assert_eq!(jobs[0].status, JobStatus::Failed);
        let note = jobs[0].note.as_deref().unwrap();
        assert!(note.starts_with(UNAVAILABLE_PREFIX), "{note}");
        assert!(!note.starts_with(APPLICATION_PREFIX));
        assert_eq!(service.sync_status().await.unwrap().health, SyncHealth::Unknown);
    }

    #[tokio::test]
    async fn cancel_then_backfill_reports_cancelled() {
        let store = MemoryReleaseStore::new();
        let service = service(&store, ScriptedSource::new(Vec::new()), RunnerKind::Bounded);
        let draft = tsync_adapters::project_release(&todays_release("ocds-9", "RFQ/9/2025 Ink"))
            .unwrap();
        store.upsert_release(&draft, None).await.unwrap();

        service.cancel_backfill().await.unwrap();
        assert!(store.flag(BACKFILL_CANCEL_FLAG).await.unwrap());

        let report = service.run_backfill(&BackfillRequest::default()).await.unwrap();
        assert!(report.cancelled);
        assert!(!store.flag(BACKFILL_CANCEL_FLAG).await.unwrap());

        let jobs = service.recent_jobs(10).await.unwrap();
        assert_eq!(jobs[0].job_type, JobType::Backfill);
        assert!(jobs[0].note.as_deref().unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn enrich_today_is_logged() {
        let store = MemoryReleaseStore::new();
        let service = service(&store, ScriptedSource::new(Vec::new()), RunnerKind::Bounded);

        let report = service.enrich_today(Some(5)).await.unwrap();
        assert_eq!(report.cap, 5);
        assert_eq!(report.selected, 0);
        let jobs = service.recent_jobs(10).await.unwrap();
        assert_eq!(jobs[0].job_type, JobType::EnrichToday);
        assert_eq!(jobs[0].status, JobStatus::Success);
    }
}

//! Single-invocation runner with a hard wall-clock deadline.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::BoundedSettings;
use crate::jobs::{PipelineLock, SYNC_LOCK};
use crate::plan::{
    next_cursor, project, EnrichmentBudget, SyncPlan, SyncRequest, SyncSummary, Watermark,
};

/// Slack on top of the deadline before an abandoned lock can be stolen.
const LOCK_GRACE: Duration = Duration::from_secs(60);

pub struct BoundedRunner {
    plan: Arc<SyncPlan>,
    settings: BoundedSettings,
}

impl BoundedRunner {
    pub fn new(plan: Arc<SyncPlan>, settings: BoundedSettings) -> Self {
        Self { plan, settings }
    }

    pub async fn run(
        &self,
        request: &SyncRequest,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary> {
        let run_id = Uuid::new_v4();
        let lock = PipelineLock::acquire(
            self.plan.store().clone(),
            SYNC_LOCK,
            run_id,
            self.settings.deadline + LOCK_GRACE,
        )
        .await?;
        let span = info_span!("bounded_sync", %run_id, mode = request.mode.as_str());
        let result = self.run_locked(run_id, request, cancel).instrument(span).await;
        lock.release().await;
        result
    }

    async fn run_locked(
        &self,
        run_id: Uuid,
        request: &SyncRequest,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary> {
        let started = Instant::now();
        let now = Utc::now();
        let settings = *self.plan.settings();
        let mut summary = SyncSummary::new(run_id, request.mode);

        self.plan.record_started(now).await?;
        let resolved = self.plan.resolve_window(request, now).await?;
        let window = resolved.window;
        summary.window = Some(window);
        info!(%window, explicit = resolved.explicit, "sync window resolved");

        // a failed first page aborts the run; nothing was written yet
        let first = self
            .plan
            .fetch_first_page(window, cancel)
            .await
            .with_context(|| format!("fetching first page of {window}"))?;
        summary.pages_fetched = 1;
        let page_size = first.page_size;
        let projected = project(&first);
        summary.skipped += projected.skipped;

        summary.enrichment_cap = self
            .plan
            .plan_enrichment_cap(request, &window, &first, &projected.drafts)
            .await?;
        let mut budget = EnrichmentBudget::new(summary.enrichment_cap);
        let mut watermark = Watermark::default();
        self.plan
            .process_page(&projected.drafts, &mut budget, &mut summary, &mut watermark, cancel)
            .await?;

        let mut has_more = first.has_more;
        let mut page = 1u32;
        'batches: while has_more {
            if started.elapsed() >= self.settings.deadline {
                summary.stop(format!("deadline reached after {page} pages"));
                break;
            }
            if cancel.is_cancelled() {
                summary.stop("cancelled");
                break;
            }
            for _ in 0..settings.pages_per_batch {
                if page >= settings.max_pages {
                    summary.stop(format!("page limit {} reached", settings.max_pages));
                    break 'batches;
                }
                page += 1;
                let next = match self.plan.fetch_page(window, page, page_size, cancel).await {
                    Ok(next) => next,
                    Err(err) => {
                        warn!(page, error = %err, "page fetch failed, stopping early");
                        summary.stop(format!("page {page} failed: {err}"));
                        break 'batches;
                    }
                };
                summary.pages_fetched += 1;
                let projected = project(&next);
                summary.skipped += projected.skipped;
                if let Err(err) = self
                    .plan
                    .process_page(&projected.drafts, &mut budget, &mut summary, &mut watermark, cancel)
                    .await
                {
                    warn!(page, error = %format!("{err:#}"), "page processing failed, stopping early");
                    summary.stop(format!("page {page} failed: {err}"));
                    break 'batches;
                }
                has_more = next.has_more;
                if !has_more {
                    break;
                }
            }
        }

        let cursor = next_cursor(&resolved, !summary.stopped_early, &watermark);
        self.plan.advance_cursor(cursor, Utc::now()).await?;
        summary.cursor = cursor;
        info!(
            pages = summary.pages_fetched,
            releases = summary.releases_seen,
            enriched = summary.enriched,
            stopped_early = summary.stopped_early,
            "bounded sync finished"
        );
        Ok(summary)
    }
}

//! Bulk re-enrichment of stored releases with missing enrichment fields.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use tsync_adapters::{LookupOutcome, TenderLookup};
use tsync_core::{derive_tender_number_from_raw, BackfillCandidate, DateWindow};
use tsync_storage::{CandidateFilter, EnrichmentWrite, ReleaseStore, BACKFILL_CANCEL_FLAG};

use crate::config::BackfillSettings;
use crate::jobs::JobReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillRequest {
    /// Defaults to the configured lookback ending now.
    #[serde(default)]
    pub window: Option<DateWindow>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

impl Default for BackfillRequest {
    fn default() -> Self {
        Self {
            window: None,
            limit: default_limit(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackfillReport {
    pub window: Option<DateWindow>,
    pub selected: usize,
    pub processed: usize,
    pub enriched: usize,
    pub not_found: usize,
    pub unavailable: usize,
    pub no_tender_number: usize,
    pub failed: usize,
    /// Operator asked to stop.
    pub cancelled: bool,
    /// Time budget ran out.
    pub stopped_early: bool,
    pub elapsed_ms: u64,
}

impl JobReport for BackfillReport {
    fn note(&self) -> String {
        let outcome = if self.cancelled {
            "cancelled"
        } else if self.stopped_early {
            "stopped early (time budget)"
        } else {
            "completed"
        };
        format!(
            "backfill {outcome}: processed {}/{} candidates, enriched {}, not found {}, unavailable {}, no tender number {}, failed {}",
            self.processed,
            self.selected,
            self.enriched,
            self.not_found,
            self.unavailable,
            self.no_tender_number,
            self.failed,
        )
    }
}

pub struct BackfillController {
    store: Arc<dyn ReleaseStore>,
    lookup: Arc<dyn TenderLookup>,
    settings: BackfillSettings,
}

impl BackfillController {
    pub fn new(
        store: Arc<dyn ReleaseStore>,
        lookup: Arc<dyn TenderLookup>,
        settings: BackfillSettings,
    ) -> Self {
        Self {
            store,
            lookup,
            settings,
        }
    }

    pub async fn run(
        &self,
        request: &BackfillRequest,
        cancel: &CancellationToken,
    ) -> Result<BackfillReport> {
        let window = request
            .window
            .unwrap_or_else(|| DateWindow::lookback(Utc::now(), self.settings.lookback_days));
        let span = info_span!("backfill", from = %window.from, to = %window.to, limit = request.limit);
        self.run_window(window, request.limit, cancel)
            .instrument(span)
            .await
    }

    async fn run_window(
        &self,
        window: DateWindow,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<BackfillReport> {
        let started = Instant::now();
        let candidates = self
            .store
            .select_candidates(&window, CandidateFilter::Incomplete, limit)
            .await
            .context("selecting backfill candidates")?;
        let mut report = BackfillReport {
            window: Some(window),
            selected: candidates.len(),
            ..BackfillReport::default()
        };
        let poll_every = self.settings.cancel_poll_interval.max(1);

        for (index, candidate) in candidates.iter().enumerate() {
            if started.elapsed() >= self.settings.budget {
                report.stopped_early = true;
                break;
            }
            if index % poll_every == 0 && self.take_cancel_request().await? {
                report.cancelled = true;
                break;
            }
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            report.processed += 1;
            self.backfill_one(candidate, &mut report, cancel).await;
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            processed = report.processed,
            enriched = report.enriched,
            cancelled = report.cancelled,
            stopped_early = report.stopped_early,
            "backfill finished"
        );
        Ok(report)
    }

    async fn backfill_one(
        &self,
        candidate: &BackfillCandidate,
        report: &mut BackfillReport,
        cancel: &CancellationToken,
    ) {
        let code = derive_tender_number_from_raw(&candidate.raw)
            .or_else(|| candidate.tender_number.clone());
        let Some(code) = code else {
            report.no_tender_number += 1;
            return;
        };

        match self.lookup.lookup(&code, cancel).await {
            LookupOutcome::Found(hit) => {
                let write = EnrichmentWrite {
                    key: candidate.key.clone(),
                    tender_number: Some(code.clone()),
                    enrichment: hit.enrichment,
                };
                match self.store.merge_enrichment(&write).await {
                    Ok(true) => report.enriched += 1,
                    Ok(false) => {
                        report.failed += 1;
                        warn!(ocid = %candidate.key.ocid, "release vanished before merge");
                    }
                    Err(err) => {
                        report.failed += 1;
                        warn!(ocid = %candidate.key.ocid, error = %err, "failed to merge enrichment");
                    }
                }
            }
            LookupOutcome::NotFound => report.not_found += 1,
            LookupOutcome::Unavailable(reason) => {
                debug!(tender_number = %code, %reason, "lookup unavailable");
                report.unavailable += 1;
            }
        }
    }

    /// Consumes a pending cancel request; the flag is reset before returning.
    async fn take_cancel_request(&self) -> Result<bool> {
        if !self
            .store
            .flag(BACKFILL_CANCEL_FLAG)
            .await
            .context("polling backfill cancel flag")?
        {
            return Ok(false);
        }
        self.store
            .set_flag(BACKFILL_CANCEL_FLAG, false)
            .await
            .context("resetting backfill cancel flag")?;
        info!("backfill cancel request honored");
        Ok(true)
    }
}

/// Ask a running backfill to stop at its next poll.
pub async fn request_cancel(store: &dyn ReleaseStore) -> Result<()> {
    store
        .set_flag(BACKFILL_CANCEL_FLAG, true)
        .await
        .context("setting backfill cancel flag")
}

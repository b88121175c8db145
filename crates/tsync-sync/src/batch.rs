//! Enrichment in three disjoint phases: one bounded select, lookups with no
//! store handle checked out, then paced micro-batch writes.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};
use tsync_adapters::{LookupOutcome, TenderLookup};
use tsync_core::{derive_tender_number_from_raw, DateWindow};
use tsync_storage::{CandidateFilter, EnrichmentWrite, ReleaseStore};

use crate::config::BatchSettings;
use crate::jobs::JobReport;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub window: Option<DateWindow>,
    pub cap: usize,
    pub selected: usize,
    pub found: usize,
    pub not_found: usize,
    pub unavailable: usize,
    pub no_tender_number: usize,
    pub written: usize,
    pub batches: usize,
    pub cancelled: bool,
}

impl JobReport for BatchReport {
    fn note(&self) -> String {
        format!(
            "enriched {} of {} uncategorized releases (cap {}) in {} write batches; {} not found, {} unavailable, {} without tender number",
            self.written,
            self.selected,
            self.cap,
            self.batches,
            self.not_found,
            self.unavailable,
            self.no_tender_number,
        )
    }
}

pub struct BatchProcessor {
    store: Arc<dyn ReleaseStore>,
    lookup: Arc<dyn TenderLookup>,
    settings: BatchSettings,
}

impl BatchProcessor {
    pub fn new(
        store: Arc<dyn ReleaseStore>,
        lookup: Arc<dyn TenderLookup>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            store,
            lookup,
            settings,
        }
    }

    /// Enrich today's uncategorized releases.
    pub async fn enrich_today(
        &self,
        cap_override: Option<usize>,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let cap = cap_override.unwrap_or(self.settings.default_cap);
        self.enrich_window(DateWindow::today(now), cap, cancel).await
    }

    pub async fn enrich_window(
        &self,
        window: DateWindow,
        cap: usize,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let span = info_span!("enrich_batch", from = %window.from, to = %window.to, cap);
        async move {
            let mut report = BatchReport {
                window: Some(window),
                cap,
                ..BatchReport::default()
            };

            let candidates = self
                .store
                .select_candidates(&window, CandidateFilter::Uncategorized, cap)
                .await
                .context("selecting enrichment candidates")?;
            report.selected = candidates.len();

            let mut writes = Vec::new();
            for candidate in &candidates {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break;
                }
                let Some(code) = derive_tender_number_from_raw(&candidate.raw)
                    .or_else(|| candidate.tender_number.clone())
                else {
                    report.no_tender_number += 1;
                    continue;
                };
                match self.lookup.lookup(&code, cancel).await {
                    LookupOutcome::Found(hit) => {
                        report.found += 1;
                        writes.push(EnrichmentWrite {
                            key: candidate.key.clone(),
                            tender_number: Some(code),
                            enrichment: hit.enrichment,
                        });
                    }
                    LookupOutcome::NotFound => report.not_found += 1,
                    LookupOutcome::Unavailable(_) => report.unavailable += 1,
                }
            }

            let size = self.settings.write_batch_size.max(1);
            for (index, chunk) in writes.chunks(size).enumerate() {
                if index > 0 {
                    tokio::time::sleep(self.settings.pause).await;
                }
                report.written += self
                    .store
                    .merge_enrichment_batch(chunk)
                    .await
                    .with_context(|| format!("writing enrichment batch {}", index + 1))?;
                report.batches += 1;
            }

            info!(
                selected = report.selected,
                written = report.written,
                batches = report.batches,
                "enrichment batch finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }
}

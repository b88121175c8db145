//! Fakes for runner tests: a scripted feed and a recording lookup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tsync_adapters::{
    EnrichmentHit, LookupOutcome, PageQuery, ReleasePage, ReleaseSource, TenderLookup,
};
use tsync_core::Enrichment;
use tsync_storage::{FetchError, MemoryReleaseStore, ReleaseStore, BACKFILL_CANCEL_FLAG};

pub(crate) fn release(ocid: &str, date: &str, title: &str) -> Value {
    json!({
        "ocid": ocid,
        "date": date,
        "tender": {"id": format!("T-{ocid}"), "title": title},
        "buyer": {"name": "Dept of Public Works"}
    })
}

pub(crate) fn unavailable() -> FetchError {
    FetchError::Unavailable {
        url: "https://feed.test/releases".into(),
        attempts: 4,
        last_error: "http status 503".into(),
    }
}

#[derive(Clone)]
pub(crate) enum PageScript {
    Releases(Vec<Value>),
    Down,
}

/// Serves page `n` from `pages[n - 1]`; `has_more` is true while later
/// pages exist.
pub(crate) struct ScriptedSource {
    pages: Vec<PageScript>,
    probe_down: bool,
    pub(crate) fetches: AtomicUsize,
}

impl ScriptedSource {
    pub(crate) fn new(pages: Vec<PageScript>) -> Arc<Self> {
        Arc::new(Self {
            pages,
            probe_down: false,
            fetches: AtomicUsize::new(0),
        })
    }

    pub(crate) fn down() -> Arc<Self> {
        Arc::new(Self {
            pages: vec![PageScript::Down],
            probe_down: true,
            fetches: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ReleaseSource for ScriptedSource {
    async fn fetch_page(
        &self,
        query: &PageQuery,
        _cancel: &CancellationToken,
    ) -> Result<ReleasePage, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let index = query.page.saturating_sub(1) as usize;
        match self.pages.get(index) {
            Some(PageScript::Releases(releases)) => Ok(ReleasePage {
                page: query.page,
                page_size: query.page_size,
                releases: releases.clone(),
                has_more: index + 1 < self.pages.len(),
            }),
            Some(PageScript::Down) => Err(unavailable()),
            None => Ok(ReleasePage {
                page: query.page,
                page_size: query.page_size,
                releases: Vec::new(),
                has_more: false,
            }),
        }
    }

    async fn probe(&self, _cancel: &CancellationToken) -> Result<(), FetchError> {
        if self.probe_down {
            Err(unavailable())
        } else {
            Ok(())
        }
    }
}

/// Answers from a fixed table and asserts that no store handle is checked
/// out while a lookup runs.
pub(crate) struct RecordingLookup {
    hits: HashMap<String, Enrichment>,
    store: MemoryReleaseStore,
    calls: Mutex<Vec<String>>,
    held_handles: AtomicUsize,
    /// Set the backfill cancel flag on this call number (1-based).
    cancel_on_call: Option<usize>,
}

impl RecordingLookup {
    pub(crate) fn new(store: &MemoryReleaseStore, hits: Vec<(&str, Enrichment)>) -> Self {
        Self {
            hits: hits.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            store: store.clone(),
            calls: Mutex::new(Vec::new()),
            held_handles: AtomicUsize::new(0),
            cancel_on_call: None,
        }
    }

    pub(crate) fn cancelling_on(mut self, call: usize) -> Self {
        self.cancel_on_call = Some(call);
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Lookups that observed a checked-out store handle.
    pub(crate) fn held_handles(&self) -> usize {
        self.held_handles.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TenderLookup for RecordingLookup {
    async fn lookup(&self, code: &str, _cancel: &CancellationToken) -> LookupOutcome {
        if self.store.checked_out() != 0 {
            self.held_handles.fetch_add(1, Ordering::SeqCst);
        }
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(code.to_string());
            calls.len()
        };
        if self.cancel_on_call == Some(call) {
            self.store.set_flag(BACKFILL_CANCEL_FLAG, true).await.unwrap();
        }
        match self.hits.get(code) {
            Some(enrichment) => LookupOutcome::Found(Box::new(EnrichmentHit {
                reference: code.to_string(),
                enrichment: enrichment.clone(),
                warnings: Vec::new(),
            })),
            None => LookupOutcome::NotFound,
        }
    }
}

/// Provider outage: every lookup is unavailable.
pub(crate) struct DownLookup;

#[async_trait]
impl TenderLookup for DownLookup {
    async fn lookup(&self, _code: &str, _cancel: &CancellationToken) -> LookupOutcome {
        LookupOutcome::Unavailable("http status 503".into())
    }
}

pub(crate) fn categorized(category: &str) -> Enrichment {
    Enrichment {
        detailed_category: Some(category.to_string()),
        contact_email: Some("a@b.com".to_string()),
        province: Some("Gauteng".to_string()),
        ..Enrichment::default()
    }
}

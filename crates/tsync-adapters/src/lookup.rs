//! Enrichment lookups against the secondary provider's table-query endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};
use tsync_core::{Briefing, Enrichment, TenderDocument};
use tsync_storage::{BackoffPolicy, FetchError, HttpFetcher, HttpTransport, RetryPolicy, TimeoutPolicy};

use crate::lenient;
use crate::province::{normalize_province, ProvinceMatch};
use crate::validate::{
    check_email, check_phone, extract_meeting_id, extract_passcode, split_briefing,
    ValidationWarning,
};

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentHit {
    /// Reference code exactly as the provider spells it.
    pub reference: String,
    pub enrichment: Enrichment,
    pub warnings: Vec<ValidationWarning>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    Found(Box<EnrichmentHit>),
    /// No row whose reference equals the code.
    NotFound,
    /// Retries exhausted or cancelled. Callers treat it like `NotFound`.
    Unavailable(String),
}

impl LookupOutcome {
    pub fn into_enrichment(self) -> Option<Enrichment> {
        match self {
            Self::Found(hit) => Some(hit.enrichment),
            Self::NotFound | Self::Unavailable(_) => None,
        }
    }
}

#[async_trait]
pub trait TenderLookup: Send + Sync {
    /// Never fails: every failure degrades to `NotFound` or `Unavailable`.
    async fn lookup(&self, code: &str, cancel: &CancellationToken) -> LookupOutcome;
}

#[derive(Debug, Clone, Copy)]
pub struct LookupSettings {
    pub retries: usize,
    pub retry_delay: Duration,
    pub timeout: Duration,
    /// Rows requested per search.
    pub page_length: u32,
}

impl Default for LookupSettings {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_delay: Duration::from_secs(2),
            timeout: Duration::from_secs(30),
            page_length: 10,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TableResponse {
    #[serde(deserialize_with = "lenient::list")]
    data: Option<Vec<TenderRow>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TenderRow {
    #[serde(rename = "tender_No", alias = "tenderNo", alias = "reference", deserialize_with = "lenient::text")]
    reference: Option<String>,
    #[serde(rename = "organ_of_State", alias = "organOfState", deserialize_with = "lenient::text")]
    organ_of_state: Option<String>,
    #[serde(rename = "organ_of_State_Type", alias = "organOfStateType", deserialize_with = "lenient::text")]
    organ_of_state_type: Option<String>,
    #[serde(alias = "Province", deserialize_with = "lenient::text")]
    province: Option<String>,
    #[serde(rename = "delivery", alias = "deliveryLocation", deserialize_with = "lenient::text")]
    delivery_location: Option<String>,
    #[serde(rename = "conditions", alias = "specialConditions", deserialize_with = "lenient::text")]
    special_conditions: Option<String>,
    #[serde(rename = "category", alias = "detailedCategory", deserialize_with = "lenient::text")]
    detailed_category: Option<String>,
    #[serde(rename = "contactPerson", deserialize_with = "lenient::text")]
    contact_person: Option<String>,
    #[serde(alias = "contactEmail", deserialize_with = "lenient::text")]
    email: Option<String>,
    #[serde(rename = "telephone", alias = "contactPhone", deserialize_with = "lenient::text")]
    telephone: Option<String>,
    #[serde(rename = "briefingSession", deserialize_with = "lenient::flag")]
    briefing_session: Option<bool>,
    #[serde(rename = "briefingCompulsory", alias = "compulsory_briefing_session", deserialize_with = "lenient::flag")]
    briefing_compulsory: Option<bool>,
    #[serde(rename = "briefingDate", deserialize_with = "lenient::text")]
    briefing_date: Option<String>,
    #[serde(rename = "briefingVenue", deserialize_with = "lenient::text")]
    briefing_venue: Option<String>,
    #[serde(rename = "estimatedValueMin", deserialize_with = "lenient::amount")]
    estimated_value_min: Option<f64>,
    #[serde(rename = "estimatedValueMax", deserialize_with = "lenient::amount")]
    estimated_value_max: Option<f64>,
    #[serde(rename = "supportDocument", alias = "documents", deserialize_with = "lenient::list")]
    documents: Option<Vec<DocumentRow>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DocumentRow {
    #[serde(rename = "supportDocumentID", deserialize_with = "lenient::text")]
    id: Option<String>,
    #[serde(rename = "fileName", deserialize_with = "lenient::text")]
    file_name: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    extension: Option<String>,
    #[serde(rename = "dateModified", deserialize_with = "lenient::text")]
    modified_at: Option<String>,
}

fn same_reference(candidate: &str, code: &str) -> bool {
    let squash = |s: &str| s.split_whitespace().collect::<String>();
    squash(candidate).eq_ignore_ascii_case(&squash(code))
}

/// Map a matched row onto an [`Enrichment`], collecting soft warnings.
fn map_row(row: TenderRow) -> (Enrichment, Vec<ValidationWarning>) {
    let mut warnings = Vec::new();

    let province = row.province.as_deref().and_then(normalize_province).map(|m| {
        if let ProvinceMatch::Unrecognized(raw) = &m {
            warnings.push(ValidationWarning::Province(raw.clone()));
        }
        m.into_value()
    });
    if let Some(warning) = row.email.as_deref().and_then(check_email) {
        warnings.push(warning);
    }
    if let Some(warning) = row.telephone.as_deref().and_then(check_phone) {
        warnings.push(warning);
    }

    let (date, time) = match row.briefing_date.as_deref().map(split_briefing) {
        Some((date, time, warning)) => {
            warnings.extend(warning);
            (date, time)
        }
        None => (None, None),
    };
    let venue = row.briefing_venue;
    let briefing = Briefing {
        required: row.briefing_session,
        compulsory: row.briefing_compulsory,
        date,
        time,
        meeting_id: venue.as_deref().and_then(extract_meeting_id),
        passcode: venue.as_deref().and_then(extract_passcode),
        venue,
    };

    let documents = row.documents.map(|docs| {
        docs.into_iter()
            .filter_map(|doc| {
                Some(TenderDocument {
                    name: doc.file_name?,
                    id: doc.id,
                    extension: doc.extension,
                    modified_at: doc.modified_at,
                })
            })
            .collect::<Vec<_>>()
    });

    let enrichment = Enrichment {
        province,
        delivery_location: row.delivery_location,
        special_conditions: row.special_conditions,
        contact_person: row.contact_person,
        contact_email: row.email,
        contact_phone: row.telephone,
        briefing,
        detailed_category: row.detailed_category,
        organ_of_state: row.organ_of_state,
        organ_of_state_type: row.organ_of_state_type,
        estimated_value_min: row.estimated_value_min,
        estimated_value_max: row.estimated_value_max,
        documents,
    };
    (enrichment, warnings)
}

pub struct EnrichmentClient {
    http: HttpFetcher,
    base_url: String,
    page_length: u32,
    draw: AtomicU64,
}

impl EnrichmentClient {
    /// Retries use a fixed delay rather than the feed's exponential backoff.
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        base_url: impl Into<String>,
        settings: LookupSettings,
    ) -> Self {
        let policy = RetryPolicy {
            backoff: BackoffPolicy::fixed(settings.retries, settings.retry_delay),
            timeout: TimeoutPolicy {
                initial: settings.timeout,
                retry: settings.timeout,
            },
        };
        Self {
            http: HttpFetcher::new(transport, policy),
            base_url: base_url.into(),
            page_length: settings.page_length.max(1),
            draw: AtomicU64::new(0),
        }
    }

    fn params(&self, code: &str) -> Vec<(String, String)> {
        let draw = self.draw.fetch_add(1, Ordering::Relaxed) + 1;
        vec![
            ("draw".to_string(), draw.to_string()),
            ("start".to_string(), "0".to_string()),
            ("length".to_string(), self.page_length.to_string()),
            ("status".to_string(), "1".to_string()),
            ("search[value]".to_string(), code.to_string()),
        ]
    }
}

#[async_trait]
impl TenderLookup for EnrichmentClient {
    async fn lookup(&self, code: &str, cancel: &CancellationToken) -> LookupOutcome {
        let span = info_span!("enrichment_lookup", tender_number = code);
        async {
            let params = self.params(code);
            let response: TableResponse = match self.http.get_json(&self.base_url, &params, cancel).await {
                Ok(response) => response,
                Err(FetchError::Cancelled { .. }) => {
                    return LookupOutcome::Unavailable("lookup cancelled".to_string());
                }
                Err(err) => {
                    warn!(error = %err, "enrichment lookup failed");
                    return LookupOutcome::Unavailable(err.to_string());
                }
            };

            let data = response.data.unwrap_or_default();
            let rows = data.len();
            let Some(row) = data
                .into_iter()
                .find(|row| row.reference.as_deref().is_some_and(|r| same_reference(r, code)))
            else {
                debug!(rows, "no exact reference match");
                return LookupOutcome::NotFound;
            };

            let reference = row.reference.clone().unwrap_or_else(|| code.to_string());
            let (enrichment, warnings) = map_row(row);
            for warning in &warnings {
                warn!(%warning, "enrichment validation warning");
            }
            LookupOutcome::Found(Box::new(EnrichmentHit {
                reference,
                enrichment,
                warnings,
            }))
        }
        .instrument(span)
        .await
    }
}

/// Sleeps a fixed delay after every answered lookup, independent of retry
/// backoff inside the wrapped client. A `NotFound` counts as answered: the
/// provider served the search, so it is paced like a match. Only
/// `Unavailable` returns without the delay, since the client already waited
/// out its retries.
pub struct PacedLookup {
    inner: Arc<dyn TenderLookup>,
    delay: Duration,
}

impl PacedLookup {
    pub fn new(inner: Arc<dyn TenderLookup>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl TenderLookup for PacedLookup {
    async fn lookup(&self, code: &str, cancel: &CancellationToken) -> LookupOutcome {
        let outcome = self.inner.lookup(code, cancel).await;
        if !matches!(outcome, LookupOutcome::Unavailable(_)) && !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        outcome
    }
}

//! Paginated OCDS release feed client.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tsync_core::{derive_tender_number, DateWindow, ReleaseDraft, ReleaseKey};
use tsync_storage::{FetchError, HttpFetcher};

use crate::lenient;

/// Smallest page size the first-page fallback will try.
pub const MIN_PAGE_SIZE: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageQuery {
    pub window: DateWindow,
    /// 1-based.
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleasePage {
    pub page: u32,
    pub page_size: u32,
    /// Raw release objects in feed order.
    pub releases: Vec<Value>,
    pub has_more: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ReleasePackage {
    releases: Vec<Value>,
    links: Option<PackageLinks>,
    #[serde(rename = "hasMore", alias = "has_more")]
    has_more: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PackageLinks {
    #[serde(deserialize_with = "lenient::text")]
    next: Option<String>,
}

impl ReleasePackage {
    fn into_page(self, query: &PageQuery) -> ReleasePage {
        let has_more = match (self.has_more, self.links.and_then(|l| l.next)) {
            (Some(explicit), _) => explicit,
            (None, Some(_)) => true,
            (None, None) => self.releases.len() >= query.page_size as usize,
        };
        ReleasePage {
            page: query.page,
            page_size: query.page_size,
            // an empty page ends pagination whatever the feed claims
            has_more: has_more && !self.releases.is_empty(),
            releases: self.releases,
        }
    }
}

#[async_trait]
pub trait ReleaseSource: Send + Sync {
    async fn fetch_page(
        &self,
        query: &PageQuery,
        cancel: &CancellationToken,
    ) -> Result<ReleasePage, FetchError>;

    /// First page of a window. When it fails outright, retries with halved
    /// page sizes down to [`MIN_PAGE_SIZE`]; the returned page carries the
    /// size that worked so later pages can keep using it.
    async fn fetch_first_page(
        &self,
        window: DateWindow,
        page_size: u32,
        cancel: &CancellationToken,
    ) -> Result<ReleasePage, FetchError> {
        let mut size = page_size.max(1);
        loop {
            let query = PageQuery {
                window,
                page: 1,
                page_size: size,
            };
            match self.fetch_page(&query, cancel).await {
                Ok(page) => return Ok(page),
                Err(err @ FetchError::Cancelled { .. }) => return Err(err),
                Err(err) => {
                    let next = size / 2;
                    if next < MIN_PAGE_SIZE {
                        return Err(err);
                    }
                    warn!(page_size = size, next_page_size = next, error = %err, "first page failed, shrinking page size");
                    size = next;
                }
            }
        }
    }

    /// Cheap reachability check: one single-release page for today.
    async fn probe(&self, cancel: &CancellationToken) -> Result<(), FetchError> {
        let query = PageQuery {
            window: DateWindow::today(Utc::now()),
            page: 1,
            page_size: 1,
        };
        self.fetch_page(&query, cancel).await.map(|_| ())
    }
}

pub struct ReleaseFetcher {
    http: HttpFetcher,
    base_url: String,
}

impl ReleaseFetcher {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    fn params(query: &PageQuery) -> Vec<(String, String)> {
        vec![
            ("PageNumber".to_string(), query.page.to_string()),
            ("PageSize".to_string(), query.page_size.to_string()),
            (
                "dateFrom".to_string(),
                query.window.from.date_naive().format("%Y-%m-%d").to_string(),
            ),
            (
                "dateTo".to_string(),
                query.window.to.date_naive().format("%Y-%m-%d").to_string(),
            ),
        ]
    }
}

#[async_trait]
impl ReleaseSource for ReleaseFetcher {
    async fn fetch_page(
        &self,
        query: &PageQuery,
        cancel: &CancellationToken,
    ) -> Result<ReleasePage, FetchError> {
        let package: ReleasePackage = self
            .http
            .get_json(&self.base_url, &Self::params(query), cancel)
            .await?;
        let page = package.into_page(query);
        debug!(
            page = page.page,
            releases = page.releases.len(),
            has_more = page.has_more,
            "fetched release page"
        );
        Ok(page)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OcdsRelease {
    #[serde(deserialize_with = "lenient::text")]
    ocid: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    date: Option<String>,
    #[serde(deserialize_with = "lenient::object")]
    tender: Option<OcdsTender>,
    #[serde(deserialize_with = "lenient::object")]
    buyer: Option<OcdsParty>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OcdsTender {
    #[serde(deserialize_with = "lenient::text")]
    id: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    title: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    description: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    status: Option<String>,
    #[serde(rename = "mainProcurementCategory", deserialize_with = "lenient::text")]
    main_procurement_category: Option<String>,
    #[serde(deserialize_with = "lenient::text")]
    category: Option<String>,
    #[serde(rename = "tenderPeriod", deserialize_with = "lenient::object")]
    tender_period: Option<OcdsPeriod>,
    #[serde(rename = "procuringEntity", deserialize_with = "lenient::object")]
    procuring_entity: Option<OcdsParty>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OcdsPeriod {
    #[serde(rename = "endDate", deserialize_with = "lenient::text")]
    end_date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OcdsParty {
    #[serde(deserialize_with = "lenient::text")]
    name: Option<String>,
}

/// Feed timestamps come as RFC 3339, zone-less date-times or bare dates; the
/// latter two are read as UTC.
pub fn parse_feed_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Project a raw feed release onto a draft. `None` when the release lacks
/// an ocid or a parseable date, since it has no identity then.
pub fn project_release(raw: &Value) -> Option<ReleaseDraft> {
    let release: OcdsRelease = match serde_json::from_value(raw.clone()) {
        Ok(release) => release,
        Err(err) => {
            warn!(error = %err, "release is not an object");
            return None;
        }
    };
    let ocid = release.ocid?;
    let release_date = release.date.as_deref().and_then(parse_feed_date)?;
    let tender = release.tender.unwrap_or_default();
    let buyer_name = release
        .buyer
        .and_then(|b| b.name)
        .or_else(|| tender.procuring_entity.and_then(|p| p.name));
    let tender_number = derive_tender_number(tender.title.as_deref(), tender.id.as_deref());

    Some(ReleaseDraft {
        key: ReleaseKey::new(ocid, release_date),
        tender_id: tender.id,
        title: tender.title,
        description: tender.description,
        buyer_name,
        main_category: tender.main_procurement_category.or(tender.category),
        status: tender.status,
        close_date: tender
            .tender_period
            .and_then(|p| p.end_date)
            .as_deref()
            .and_then(parse_feed_date),
        tender_number,
        raw: raw.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn window() -> DateWindow {
        DateWindow::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 3, 12, 0, 0).unwrap(),
        )
    }

    #[test]
    fn wrongly_shaped_nested_objects_keep_the_release() {
        let raw = json!({
            "ocid": "ocds-9t57fa-2002",
            "date": "2025-03-02",
            "tender": "RFQ/77/2025 see attached",
            "buyer": {"name": "City of Tshwane"}
        });
        let draft = project_release(&raw).expect("ocid and date are intact");
        assert_eq!(draft.key.ocid, "ocds-9t57fa-2002");
        assert_eq!(draft.title, None);
        assert_eq!(draft.tender_number, None);
        assert_eq!(draft.buyer_name.as_deref(), Some("City of Tshwane"));

        let raw = json!({
            "ocid": "ocds-9t57fa-2003",
            "date": "2025-03-02T09:00:00Z",
            "buyer": ["Dept of Health"],
            "tender": {
                "title": "Fencing RFB-2025-031",
                "tenderPeriod": "2025-03-30",
                "procuringEntity": {"name": "Dept of Health"}
            }
        });
        let draft = project_release(&raw).expect("ocid and date are intact");
        assert_eq!(draft.tender_number.as_deref(), Some("RFB-2025-031"));
        assert_eq!(draft.close_date, None);
        assert_eq!(draft.buyer_name.as_deref(), Some("Dept of Health"));
    }

    #[test]
    fn projects_tolerantly() {
        let raw = json!({
            "ocid": "ocds-9t57fa-1001",
            "date": "2025-03-02T08:15:00Z",
            "buyer": {"name": "Dept of Health"},
            "tender": {
                "id": 1001,
                "title": "RFQ/410/2025 Supply of Chairs",
                "mainProcurementCategory": "goods",
                "status": "active",
                "tenderPeriod": {"endDate": "2025-03-20T11:00:00"},
                "value": "not-an-object"
            }
        });

        let draft = project_release(&raw).expect("release has identity");
        assert_eq!(draft.key.ocid, "ocds-9t57fa-1001");
        assert_eq!(draft.tender_id.as_deref(), Some("1001"));
        assert_eq!(draft.tender_number.as_deref(), Some("RFQ/410/2025"));
        assert_eq!(draft.buyer_name.as_deref(), Some("Dept of Health"));
        assert_eq!(
            draft.close_date,
            Some(Utc.with_ymd_and_hms(2025, 3, 20, 11, 0, 0).unwrap())
        );
        assert_eq!(draft.raw, raw);
    }

    #[test]
    fn releases_without_identity_are_skipped() {
        assert!(project_release(&json!({"date": "2025-03-02"})).is_none());
        assert!(project_release(&json!({"ocid": "x", "date": "yesterday"})).is_none());
        assert!(project_release(&json!("just a string")).is_none());
    }

    #[test]
    fn has_more_prefers_explicit_indicators() {
        let query = PageQuery { window: window(), page: 2, page_size: 2 };

        let explicit: ReleasePackage =
            serde_json::from_value(json!({"releases": [{}, {}], "hasMore": false})).unwrap();
        assert!(!explicit.into_page(&query).has_more);

        let linked: ReleasePackage =
            serde_json::from_value(json!({"releases": [{}], "links": {"next": "https://feed/p3"}}))
                .unwrap();
        assert!(linked.into_page(&query).has_more);

        let full: ReleasePackage = serde_json::from_value(json!({"releases": [{}, {}]})).unwrap();
        assert!(full.into_page(&query).has_more);

        let short: ReleasePackage = serde_json::from_value(json!({"releases": [{}]})).unwrap();
        assert!(!short.into_page(&query).has_more);
    }

    /// Fails every page whose size is above `max_ok`.
    struct PickySource {
        max_ok: u32,
        sizes: Mutex<VecDeque<u32>>,
    }

    #[async_trait]
    impl ReleaseSource for PickySource {
        async fn fetch_page(
            &self,
            query: &PageQuery,
            _cancel: &CancellationToken,
        ) -> Result<ReleasePage, FetchError> {
            self.sizes.lock().unwrap().push_back(query.page_size);
            if query.page_size > self.max_ok {
                return Err(FetchError::Unavailable {
                    url: "https://feed.test".into(),
                    attempts: 1,
                    last_error: "http status 500".into(),
                });
            }
            Ok(ReleasePage {
                page: query.page,
                page_size: query.page_size,
                releases: vec![json!({})],
                has_more: false,
            })
        }
    }

    #[tokio::test]
    async fn first_page_shrinks_page_size_until_it_succeeds() {
        let source = PickySource { max_ok: 30, sizes: Mutex::new(VecDeque::new()) };
        let page = source
            .fetch_first_page(window(), 100, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(page.page_size, 25);
        assert_eq!(
            source.sizes.lock().unwrap().iter().copied().collect::<Vec<_>>(),
            vec![100, 50, 25]
        );
    }

    #[tokio::test]
    async fn first_page_gives_up_below_minimum() {
        let source = PickySource { max_ok: 0, sizes: Mutex::new(VecDeque::new()) };
        let err = source
            .fetch_first_page(window(), 40, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_upstream_unavailable());
        assert_eq!(
            source.sizes.lock().unwrap().iter().copied().collect::<Vec<_>>(),
            vec![40, 20, 10]
        );
    }

    #[test]
    fn query_params_use_inclusive_dates() {
        let params = ReleaseFetcher::params(&PageQuery { window: window(), page: 3, page_size: 50 });
        assert!(params.contains(&("PageNumber".into(), "3".into())));
        assert!(params.contains(&("dateFrom".into(), "2025-03-01".into())));
        assert!(params.contains(&("dateTo".into(), "2025-03-03".into())));
    }
}

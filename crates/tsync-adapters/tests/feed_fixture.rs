// Drives the release fetcher end to end over a recorded feed page.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use tsync_adapters::{project_release, PageQuery, ReleaseFetcher, ReleaseSource};
use tsync_core::DateWindow;
use tsync_storage::{HttpFetcher, HttpRequest, HttpResponse, HttpTransport, RetryPolicy, TransportError};

struct FixtureTransport {
    body: Vec<u8>,
    seen: Mutex<Vec<HttpRequest>>,
}

#[async_trait]
impl HttpTransport for FixtureTransport {
    async fn get(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.seen.lock().unwrap().push(request.clone());
        Ok(HttpResponse {
            status: 200,
            body: self.body.clone(),
        })
    }
}

fn fixture() -> Vec<u8> {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/ocds_page.json");
    std::fs::read(path).unwrap()
}

#[tokio::test]
async fn recorded_page_projects_to_drafts() {
    let transport = Arc::new(FixtureTransport {
        body: fixture(),
        seen: Mutex::new(Vec::new()),
    });
    let fetcher = ReleaseFetcher::new(
        HttpFetcher::new(transport.clone(), RetryPolicy::default()),
        "https://feed.test/api/OCDSReleases",
    );
    let query = PageQuery {
        window: DateWindow::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 2, 0, 0, 0).unwrap(),
        ),
        page: 1,
        page_size: 4,
    };

    let page = fetcher
        .fetch_page(&query, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(page.releases.len(), 4);
    assert!(page.has_more, "links.next signals another page");

    let drafts: Vec<_> = page.releases.iter().filter_map(project_release).collect();
    assert_eq!(drafts.len(), 3, "the dateless release is skipped");

    let numbers: Vec<_> = drafts.iter().map(|d| d.tender_number.as_deref()).collect();
    assert_eq!(
        numbers,
        [Some("RFQ/410/2025"), Some("RFB-2025-014"), Some("4471")]
    );
    assert_eq!(
        drafts[0].buyer_name.as_deref(),
        Some("Department of Public Works and Infrastructure")
    );
    assert_eq!(drafts[1].buyer_name.as_deref(), Some("City of Tshwane"));
    assert_eq!(drafts[1].main_category.as_deref(), Some("services"));
    assert_eq!(
        drafts[0].close_date,
        Some(Utc.with_ymd_and_hms(2025, 3, 21, 11, 0, 0).unwrap())
    );
    assert_eq!(
        drafts[2].key.release_date,
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
    );

    let seen = transport.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen[0]
        .query
        .contains(&("dateFrom".to_string(), "2025-03-01".to_string())));
}

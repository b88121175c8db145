//! HTTP fetch utilities and persistence for the tender sync pipeline.

pub mod http;
pub mod store;

pub use http::{
    classify_status, BackoffKind, BackoffPolicy, FetchError, HttpFetcher, HttpRequest,
    HttpResponse, HttpTransport, ReqwestTransport, RetryDisposition, RetryPolicy, TimeoutPolicy,
    TransportError,
};
pub use store::memory::MemoryReleaseStore;
pub use store::postgres::PgReleaseStore;
pub use store::{CandidateFilter, EnrichmentWrite, ReleaseStore, BACKFILL_CANCEL_FLAG};

pub const CRATE_NAME: &str = "tsync-storage";

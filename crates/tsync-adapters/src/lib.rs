//! Clients for the two upstream sources: the paginated OCDS release feed and
//! the table-query enrichment provider.

mod lenient;
pub mod lookup;
pub mod ocds;
pub mod province;
pub mod validate;

pub use lookup::{
    EnrichmentClient, EnrichmentHit, LookupOutcome, LookupSettings, PacedLookup, TenderLookup,
};
pub use ocds::{
    parse_feed_date, project_release, PageQuery, ReleaseFetcher, ReleasePage, ReleaseSource,
    MIN_PAGE_SIZE,
};
pub use province::{normalize_province, ProvinceMatch, PROVINCES};
pub use validate::ValidationWarning;

pub const CRATE_NAME: &str = "tsync-adapters";

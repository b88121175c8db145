//! Core domain model for the OCDS tender sync pipeline.
//!
//! Everything in this crate is pure: records, windows, the tender-number
//! heuristics, the additive enrichment merge and slug generation.

pub mod enrichment;
pub mod health;
pub mod model;
pub mod slug;
pub mod tender_number;

pub use enrichment::{Briefing, Enrichment, TenderDocument};
pub use health::SyncHealth;
pub use model::{
    BackfillCandidate, DateWindow, EnrichmentProgress, ExistingRelease, JobLog, JobStatus, JobType,
    ReleaseDraft, ReleaseKey, ReleaseRecord, SyncMode, SyncState, UpsertOutcome,
};
pub use tender_number::{derive_tender_number, derive_tender_number_from_raw};

pub const CRATE_NAME: &str = "tsync-core";

/// Sync-state key of the primary OCDS feed.
pub const OCDS_FEED: &str = "ocds-releases";

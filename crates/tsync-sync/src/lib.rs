//! Tender sync orchestration: one shared sync plan run by a bounded or a
//! durable runner, plus backfill and batch enrichment.

pub mod backfill;
pub mod batch;
pub mod bounded;
pub mod config;
pub mod durable;
pub mod jobs;
pub mod plan;
pub mod scheduler;
pub mod service;

#[cfg(test)]
mod testing;

pub use backfill::{BackfillController, BackfillReport, BackfillRequest};
pub use batch::{BatchProcessor, BatchReport};
pub use bounded::BoundedRunner;
pub use config::{RunnerKind, SyncConfig};
pub use durable::{DurableRunner, StepContext, StepError};
pub use jobs::{classify, failure_note, FailureKind, APPLICATION_PREFIX, UNAVAILABLE_PREFIX};
pub use plan::{SyncPlan, SyncRequest, SyncSummary};
pub use scheduler::maybe_build_scheduler;
pub use service::{SyncService, SyncStatus};

pub const CRATE_NAME: &str = "tsync-sync";

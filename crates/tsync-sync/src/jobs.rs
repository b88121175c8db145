//! Job-log bookkeeping, failure classification and the pipeline lock.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use tsync_core::{JobStatus, JobType};
use tsync_storage::{FetchError, ReleaseStore};
use uuid::Uuid;

pub const UNAVAILABLE_PREFIX: &str = "External API Unavailable: ";
pub const APPLICATION_PREFIX: &str = "Application Error: ";

/// Name of the lock both sync runners take.
pub const SYNC_LOCK: &str = "ocds-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UpstreamUnavailable,
    Application,
}

impl FailureKind {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::UpstreamUnavailable => UNAVAILABLE_PREFIX,
            Self::Application => APPLICATION_PREFIX,
        }
    }
}

/// Upstream outages surface as [`FetchError::Unavailable`] somewhere in the
/// chain; anything else is ours.
pub fn classify(err: &anyhow::Error) -> FailureKind {
    let unavailable = err
        .downcast_ref::<FetchError>()
        .is_some_and(FetchError::is_upstream_unavailable)
        || err.chain().any(|cause| {
            cause
                .downcast_ref::<FetchError>()
                .is_some_and(FetchError::is_upstream_unavailable)
        });
    if unavailable {
        FailureKind::UpstreamUnavailable
    } else {
        FailureKind::Application
    }
}

pub fn failure_note(err: &anyhow::Error) -> String {
    format!("{}{err:#}", classify(err).prefix())
}

/// Outcome types that can describe themselves in a job log.
pub trait JobReport: Serialize {
    fn note(&self) -> String;
}

/// Wraps one operator-visible invocation in a job-log entry: RUNNING at
/// start, finalized exactly once with SUCCESS or a classified FAILED note.
pub async fn record_job<T, F>(
    store: &Arc<dyn ReleaseStore>,
    job_type: JobType,
    metadata: serde_json::Value,
    work: F,
) -> Result<T>
where
    T: JobReport,
    F: Future<Output = Result<T>>,
{
    let job = store.create_job(job_type, &metadata).await?;
    info!(job_id = %job.id, job_type = job_type.as_str(), "job started");

    match work.await {
        Ok(report) => {
            let note = report.note();
            let details = serde_json::to_value(&report).unwrap_or(metadata);
            finalize(store, job.id, JobStatus::Success, &note, &details).await;
            info!(job_id = %job.id, %note, "job finished");
            Ok(report)
        }
        Err(err) => {
            let note = failure_note(&err);
            let details = serde_json::json!({
                "request": metadata,
                "failure": classify(&err),
            });
            finalize(store, job.id, JobStatus::Failed, &note, &details).await;
            error!(job_id = %job.id, %note, "job failed");
            Err(err)
        }
    }
}

async fn finalize(
    store: &Arc<dyn ReleaseStore>,
    id: Uuid,
    status: JobStatus,
    note: &str,
    details: &serde_json::Value,
) {
    match store.finalize_job(id, status, note, details).await {
        Ok(true) => {}
        Ok(false) => warn!(job_id = %id, "job log was already finalized"),
        Err(err) => error!(job_id = %id, error = %err, "failed to finalize job log"),
    }
}

/// Held pipeline lock. Release it explicitly; an abandoned lock expires
/// after its TTL unless the holder keeps renewing it.
pub struct PipelineLock {
    store: Arc<dyn ReleaseStore>,
    name: &'static str,
    holder: Uuid,
    ttl: Duration,
}

impl PipelineLock {
    pub async fn acquire(
        store: Arc<dyn ReleaseStore>,
        name: &'static str,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<Self> {
        if !store.try_acquire_lock(name, holder, ttl).await? {
            bail!("another run holds the {name} lock");
        }
        Ok(Self {
            store,
            name,
            holder,
            ttl,
        })
    }

    /// Pushes the expiry a full TTL past now. Fails if the lock expired and
    /// another run took it.
    pub async fn renew(&self) -> Result<()> {
        if !self
            .store
            .try_acquire_lock(self.name, self.holder, self.ttl)
            .await?
        {
            bail!("lost the {} lock to another run", self.name);
        }
        debug!(lock = self.name, "pipeline lock renewed");
        Ok(())
    }

    pub async fn release(self) {
        if let Err(err) = self.store.release_lock(self.name, self.holder).await {
            warn!(lock = self.name, error = %err, "failed to release pipeline lock");
        }
    }
}

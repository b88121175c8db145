use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::plan::SyncRequest;
use crate::service::SyncService;

/// Cron jobs for the two daily syncs, or `None` when scheduling is off.
/// Crons use the six-field form with a leading seconds column.
pub async fn maybe_build_scheduler(service: Arc<SyncService>) -> Result<Option<JobScheduler>> {
    let config = service.config();
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in [&config.sync_cron_1, &config.sync_cron_2] {
        let service = service.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let service = service.clone();
            Box::pin(async move {
                info!("scheduled sync triggered");
                if let Err(err) = service.run_sync(&SyncRequest::default()).await {
                    error!(error = %format!("{err:#}"), "scheduled sync failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsync_storage::MemoryReleaseStore;

    use crate::config::SyncConfig;
    use crate::testing::{RecordingLookup, ScriptedSource};

    fn service(enabled: bool, cron: &str) -> Arc<SyncService> {
        let store = MemoryReleaseStore::new();
        let mut config = SyncConfig::from_env();
        config.scheduler_enabled = enabled;
        config.sync_cron_1 = cron.to_string();
        let lookup = Arc::new(RecordingLookup::new(&store, Vec::new()));
        Arc::new(SyncService::new(
            Arc::new(store),
            ScriptedSource::new(Vec::new()),
            lookup,
            config,
        ))
    }

    #[tokio::test]
    async fn disabled_scheduler_builds_nothing() {
        assert!(maybe_build_scheduler(service(false, "0 0 6 * * *"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn invalid_cron_is_reported() {
        let err = maybe_build_scheduler(service(true, "every morning"))
            .await
            .map(|_| ())
            .unwrap_err();
        assert!(err.to_string().contains("every morning"));
    }
}

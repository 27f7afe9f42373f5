use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use vidpub_core::{SyncOptions, SyncResult};

use crate::SyncRuntime;

#[derive(Debug, Clone, PartialEq)]
pub enum ScheduledRun {
    Skipped,
    Completed(SyncResult),
    Failed(String),
}

/// One scheduler tick: incremental sync, outcome logging, then the log retention sweep.
pub async fn run_scheduled_sync(runtime: &SyncRuntime) -> Result<ScheduledRun> {
    let log = runtime.activity();
    if !runtime.settings().is_api_configured() {
        log.warning("Scheduled sync skipped: API not configured").await;
        runtime.persist().await?;
        return Ok(ScheduledRun::Skipped);
    }

    let outcome = match runtime.run_sync(SyncOptions::default()).await {
        Ok(result) => {
            log.info(format!(
                "Scheduled sync completed: {} videos processed",
                result.processed
            ))
            .await;
            ScheduledRun::Completed(result)
        }
        Err(err) => {
            log.error(format!("Scheduled sync failed: {err}")).await;
            ScheduledRun::Failed(err.to_string())
        }
    };

    let dropped = log.clean_old(runtime.settings().log_retention_days).await?;
    if dropped > 0 {
        info!(dropped, "expired activity log entries removed");
    }
    runtime.persist().await?;
    Ok(outcome)
}

pub async fn build_scheduler(runtime: Arc<SyncRuntime>) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = runtime.settings().sync_interval.cron_expression();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let runtime = runtime.clone();
        Box::pin(async move {
            if let Err(err) = run_scheduled_sync(&runtime).await {
                error!("scheduled sync could not finish: {err:#}");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Builds the recurring job only when `VIDPUB_SCHEDULER_ENABLED` is set.
pub async fn maybe_build_scheduler(runtime: Arc<SyncRuntime>) -> Result<Option<JobScheduler>> {
    if !runtime.config().scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(runtime).await.map(Some)
}

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::runner::PipelineRunner;

/// Cron jobs for extraction and sync, or `None` when scheduling is
/// disabled. Jobs go through the runner so they never overlap with each
/// other or with API-triggered runs.
pub async fn maybe_build_scheduler(
    config: &PipelineConfig,
    runner: Arc<PipelineRunner>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let extract_runner = runner.clone();
    let extract = Job::new_async(config.extract_cron.as_str(), move |_uuid, _l| {
        let runner = extract_runner.clone();
        Box::pin(async move {
            let outcome = runner.run_extraction().await;
            if outcome.success {
                info!(run_id = %outcome.run_id, message = %outcome.message, "scheduled extraction finished");
            } else {
                warn!(run_id = %outcome.run_id, message = %outcome.message, "scheduled extraction failed");
            }
        })
    })
    .with_context(|| format!("creating extraction job for cron {}", config.extract_cron))?;
    sched.add(extract).await.context("adding extraction job")?;

    let sync = Job::new_async(config.sync_cron.as_str(), move |_uuid, _l| {
        let runner = runner.clone();
        Box::pin(async move {
            let outcome = runner.run_sync().await;
            if outcome.success {
                info!(run_id = %outcome.run_id, message = %outcome.message, "scheduled sync finished");
            } else {
                warn!(run_id = %outcome.run_id, message = %outcome.message, "scheduled sync failed");
            }
        })
    })
    .with_context(|| format!("creating sync job for cron {}", config.sync_cron))?;
    sched.add(sync).await.context("adding sync job")?;

    info!(extract = %config.extract_cron, sync = %config.sync_cron, "scheduler configured");
    Ok(Some(sched))
}

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::business_today;
use crate::engine::Engine;

/// Cron jobs for the fast and full reconciliation runs and the daily reminder pass.
///
/// Returns `None` when scheduling is disabled in the configuration.
pub async fn build_scheduler(engine: &Engine) -> Result<Option<JobScheduler>> {
    if !engine.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let horizons = [
        (&engine.config.cron_fast, engine.settings.horizons.fast_days),
        (&engine.config.cron_full, engine.settings.horizons.full_days),
    ];
    for (cron, days) in horizons {
        let reconciler = Arc::clone(&engine.reconciler);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let reconciler = Arc::clone(&reconciler);
            Box::pin(async move {
                if reconciler.run_exclusive(days).await.is_none() {
                    info!(days, "scheduled reconciliation skipped, previous run still in flight");
                }
            })
        })
        .with_context(|| format!("creating reconciliation job for cron {cron}"))?;
        sched.add(job).await.context("adding reconciliation job")?;
    }

    let reminders = Arc::clone(&engine.reminders);
    let timezone = engine.config.timezone;
    let cron = &engine.config.cron_reminders;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let reminders = Arc::clone(&reminders);
        Box::pin(async move {
            match reminders.run(business_today(timezone)).await {
                Ok(Some(_)) => {}
                Ok(None) => info!("scheduled reminder pass skipped, previous pass still in flight"),
                Err(err) => warn!(error = %format!("{err:#}"), "scheduled reminder pass failed"),
            }
        })
    })
    .with_context(|| format!("creating reminder job for cron {cron}"))?;
    sched.add(job).await.context("adding reminder job")?;

    Ok(Some(sched))
}

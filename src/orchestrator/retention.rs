//! Retention sweep (C7, `spec.md` §4.7).
//!
//! A daily cron job deletes Executions (and their logs) older than
//! `retention_days`. Grounded on `tokio-cron-scheduler`, the crate the
//! broader pack reaches for (`ProdByBuddha-rust_agency`) wherever a
//! background service needs a cron-style timer rather than a bare
//! `tokio::time::interval` loop.

use crate::orchestrator::repository::ExecutionRepository;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};

/// Default schedule: daily at 02:00 (`spec.md` §4.7).
pub const DEFAULT_RETENTION_CRON: &str = "0 0 2 * * *";

/// Run one retention sweep: delete every terminal execution (and its logs,
/// cascaded by the repository) older than `retention_days`. Idempotent —
/// running it twice on an unchanged dataset deletes nothing the second time
/// (`spec.md` §8 invariant 10).
pub async fn run_once(executions: &Arc<dyn ExecutionRepository>, retention_days: i64) -> u64 {
    let cutoff = Utc::now() - ChronoDuration::days(retention_days);
    match executions.delete_older_than(cutoff).await {
        Ok(count) => {
            log::info!("retention sweep deleted {} execution(s) older than {}", count, cutoff);
            count
        }
        Err(err) => {
            log::error!("retention sweep failed: {}", err);
            0
        }
    }
}

/// Start the daily retention job on `cron_expr`. Returns the running
/// [`JobScheduler`] handle; dropping it stops the schedule.
pub async fn start(
    executions: Arc<dyn ExecutionRepository>,
    retention_days: i64,
    cron_expr: &str,
) -> Result<JobScheduler, Box<dyn std::error::Error + Send + Sync>> {
    let scheduler = JobScheduler::new().await?;
    let job = Job::new_async(cron_expr, move |_uuid, _lock| {
        let executions = Arc::clone(&executions);
        Box::pin(async move {
            run_once(&executions, retention_days).await;
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;
    Ok(scheduler)
}

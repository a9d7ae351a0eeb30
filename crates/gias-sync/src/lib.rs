//! Database loading, the populate pipeline and its scheduler.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use gias_core::PipelineStage;
use gias_storage::{HttpFetcher, LocalBlobStore};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub mod config;
pub mod db;
pub mod pipeline;
pub mod staging;
pub mod transform;
pub mod trusts;
pub mod views;

pub use config::{GiasConfig, ReferenceRegistry, ReplacePolicy};
pub use db::{Database, PgDatabase};
pub use pipeline::{
    download, AbortSignal, Downloaded, Pipeline, PipelineError, RunFailure, RunOutcome, RunReport,
};
pub use staging::{LoadError, StagingLoader};
pub use transform::TransformLoader;
pub use trusts::{ExtractionError, RelationshipExtractor};
pub use views::{ViewError, ViewManager};

pub const CRATE_NAME: &str = "gias-sync";

/// The run date: the export is published under the local calendar day.
pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// Fetch and normalize the export for `date`. Typed failures are wrapped as [`RunFailure`].
pub async fn run_download(config: &GiasConfig, date: NaiveDate) -> Result<Downloaded> {
    let ctx = config.run_context(date)?;
    let store = LocalBlobStore::new(config.storage_dir.clone());
    let fetcher = HttpFetcher::new(config.http_client_config())?;
    let normalizer = config.normalizer()?;

    let downloaded = download(&ctx, &fetcher, &normalizer, &store)
        .await
        .map_err(|error| {
            let stage = match error {
                PipelineError::Fetch(_) => PipelineStage::Fetching,
                _ => PipelineStage::Normalizing,
            };
            RunFailure { stage, error }
        })?;
    Ok(downloaded)
}

/// Run the full pipeline for `date` against `config.database_url`.
pub async fn run_populate(
    config: &GiasConfig,
    date: NaiveDate,
    abort: AbortSignal,
) -> Result<RunReport> {
    let ctx = config.run_context(date)?;
    let store = LocalBlobStore::new(config.storage_dir.clone());
    let fetcher = HttpFetcher::new(config.http_client_config())?;
    let normalizer = config.normalizer()?;
    let mut db = PgDatabase::connect(&config.database_url)
        .await
        .context("connecting to database")?;

    let outcome = Pipeline::new(ctx, &fetcher, &store, normalizer)
        .with_policy(config.replace_policy)
        .with_lock_key(config.lock_key)
        .with_abort(abort)
        .run(&mut db)
        .await;

    if let Err(err) = db.close().await {
        warn!(error = %err, "closing database session");
    }
    Ok(outcome?)
}

/// Cron-driven populate runs; `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(
    config: &GiasConfig,
    abort: AbortSignal,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.clone();
    let shared = Arc::new(config.clone());
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let config = Arc::clone(&shared);
        let abort = abort.clone();
        Box::pin(async move {
            match run_populate(&config, today(), abort).await {
                Ok(report) => info!(
                    run_id = %report.run_id,
                    trusts = report.trusts.unwrap_or_default(),
                    dropped_rows = report.total_dropped_rows(),
                    "scheduled populate finished"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled populate failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

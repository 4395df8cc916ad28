//! Harvest pipeline: classification, migration, ingestion, season refresh and index rebuild.

pub mod classify;
pub mod config;
pub mod ingest;
pub mod migrate;
pub mod reindex;
pub mod seasons;

use std::sync::Arc;

use anyhow::{Context, Result};
use bh_storage::{load_season_index, StoreRegistry};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

pub use classify::{classify_format, classify_record, SkipReason};
pub use config::HarvestConfig;
pub use ingest::{CycleOutcome, Harvester, IngestSettings, IngestSummary};
pub use migrate::{BattleMigrator, MigrationSummary};
pub use reindex::{rebuild_index, ReindexSummary};
pub use seasons::{refresh_seasons, RefreshStop, SeasonRefresh, SeasonRefreshOptions};

pub const CRATE_NAME: &str = "bh-sync";

/// One migration run against the configured stores. The season file is loaded fresh
/// for the run and every store opened by it is released before returning.
pub async fn run_migration(config: &HarvestConfig) -> Result<MigrationSummary> {
    let seasons = load_season_index(&config.seasons_file)
        .await
        .context("loading season index")?;
    let stores = StoreRegistry::new(config.store_layout());
    let result = BattleMigrator::new(&stores, &seasons).migrate_all().await;
    stores.close().await;
    result
}

/// Cron-driven migration, or `None` when scheduling is disabled. A tick that fires while
/// the previous run is still going is skipped.
pub async fn maybe_build_scheduler(config: Arc<HarvestConfig>) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let running = Arc::new(Mutex::new(()));
    let cron = config.migrate_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let config = Arc::clone(&config);
        let running = Arc::clone(&running);
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("previous migration still running; skipping tick");
                return;
            };
            match run_migration(&config).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    migrated = summary.migrated,
                    skipped = summary.skipped,
                    "scheduled migration finished"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled migration failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

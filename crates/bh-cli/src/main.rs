use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bh_api::{ApiClient, AuthSession, CommandSigner};
use bh_storage::{read_oldest_scan, StoreRegistry};
use bh_sync::{
    maybe_build_scheduler, rebuild_index, refresh_seasons, run_migration, HarvestConfig, Harvester,
    IngestSettings, SeasonRefreshOptions,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "battle-harvester")]
#[command(about = "Harvest, classify and index battle history")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scan players and stage their battles until interrupted.
    Ingest,
    /// Log in with the configured signer and print the session token.
    Login,
    /// Move staged battles into their season/format stores.
    Migrate {
        /// Keep running on the configured cron schedule.
        #[arg(long)]
        watch: bool,
    },
    /// Fetch seasons newer than the season file and rewrite it.
    Seasons,
    /// Rebuild the battle index from the season stores.
    Reindex,
    /// Report how long ago the least recently scanned player was scanned.
    OldestScan,
}

/// Logs go to `HARVEST_LOG_PATH` when set, otherwise stderr.
fn init_logging() {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();

    if let Ok(path) = std::env::var("HARVEST_LOG_PATH") {
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(true)
                .with_ansi(false)
                .with_writer(file)
                .init();
            return;
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

fn format_elapsed(elapsed: chrono::Duration) -> String {
    let secs = elapsed.num_seconds().max(0);
    let (days, rest) = (secs / 86_400, secs % 86_400);
    let (hours, rest) = (rest / 3_600, rest % 3_600);
    let (minutes, seconds) = (rest / 60, rest % 60);
    if days > 0 {
        format!("{days}d {hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    }
}

/// `SPL_TOKEN` when set, otherwise a fresh login signed by `HARVEST_SIGNER_CMD`.
async fn resolve_session(config: &HarvestConfig, client: &ApiClient) -> Result<AuthSession> {
    if let Some(session) = config.auth_session() {
        return Ok(session);
    }
    let (Some(username), Some(command)) = (&config.username, &config.signer_command) else {
        bail!("set HIVE_USERNAME plus SPL_TOKEN or HARVEST_SIGNER_CMD to read battle history");
    };
    let signer = CommandSigner::from_command_line(command)?;
    Ok(client.login(username, &signer).await?)
}

async fn ingest(config: &HarvestConfig) -> Result<()> {
    let client = ApiClient::new(config.api_config())?;
    let session = resolve_session(config, &client).await?;
    let harvester = Harvester::new(
        Box::new(client.authenticated(session)),
        IngestSettings {
            seed_player: config.username.clone(),
            pending_requests_file: config.pending_requests_file.clone(),
            idle: config.idle(),
            player_delay: config.player_delay(),
        },
    );
    tracing::info!(data_dir = %config.data_dir.display(), "starting battle monitor");
    harvester
        .run_forever(config.store_layout(), shutdown_signal())
        .await
}

async fn migrate(config: HarvestConfig, watch: bool) -> Result<()> {
    if !watch {
        let summary = run_migration(&config).await?;
        println!(
            "migrate complete: run_id={} migrated={} skipped={} raw_deleted={} stores={} withheld={}",
            summary.run_id,
            summary.migrated,
            summary.skipped,
            summary.raw_deleted,
            summary.destinations,
            summary.cleanup_withheld
        );
        return Ok(());
    }

    let cron = config.migrate_cron.clone();
    let Some(mut sched) = maybe_build_scheduler(Arc::new(config)).await? else {
        bail!("--watch needs HARVEST_SCHEDULER_ENABLED=true");
    };
    sched.start().await.context("starting scheduler")?;
    tracing::info!(%cron, "scheduled migration running; ctrl-c to stop");
    shutdown_signal().await;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = HarvestConfig::from_env();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => ingest(&config).await?,
        Commands::Login => {
            if config.signer_command.is_none() {
                bail!("HARVEST_SIGNER_CMD must be set to log in");
            }
            let client = ApiClient::new(config.api_config())?;
            let session = resolve_session(&HarvestConfig { token: None, ..config }, &client).await?;
            println!("login ok: user={} token={}", session.username, session.token);
        }
        Commands::Migrate { watch } => migrate(config, watch).await?,
        Commands::Seasons => {
            let client = ApiClient::new(config.api_config())?;
            let refresh = refresh_seasons(
                &client,
                &config.seasons_file,
                Utc::now(),
                SeasonRefreshOptions::default(),
            )
            .await?;
            println!(
                "seasons refreshed: fetched={} total={} latest={:?} stop={:?} file={}",
                refresh.fetched,
                refresh.total,
                refresh.latest_id,
                refresh.stop,
                config.seasons_file.display()
            );
        }
        Commands::Reindex => {
            let stores = StoreRegistry::new(config.store_layout());
            let summary = rebuild_index(&stores).await;
            stores.close().await;
            let summary = summary?;
            println!(
                "index rebuilt: files={} skipped={} battles={}",
                summary.files_scanned,
                summary.files_skipped.len(),
                summary.indexed
            );
        }
        Commands::OldestScan => {
            match read_oldest_scan(&config.store_layout().players_path()).await? {
                Some(at) => println!(
                    "oldest scan was {} ago ({})",
                    format_elapsed(Utc::now() - at),
                    at.format("%Y-%m-%d %H:%M:%S UTC")
                ),
                None => println!("no players registered"),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_time_is_human_readable() {
        assert_eq!(format_elapsed(chrono::Duration::seconds(59)), "00:00:59");
        assert_eq!(
            format_elapsed(chrono::Duration::seconds(2 * 86_400 + 3_723)),
            "2d 01:02:03"
        );
        assert_eq!(format_elapsed(chrono::Duration::seconds(-5)), "00:00:00");
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["battle-harvester", "migrate", "--watch"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Migrate { watch: true })));
        let cli = Cli::try_parse_from(["battle-harvester", "login"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Login)));
        let cli = Cli::try_parse_from(["battle-harvester", "oldest-scan"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::OldestScan)));
        let cli = Cli::try_parse_from(["battle-harvester"]).unwrap();
        assert!(cli.command.is_none());
    }
}

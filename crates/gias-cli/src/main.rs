use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gias_sync::{AbortSignal, GiasConfig, RunFailure};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "gias-cli")]
#[command(about = "Get Information About Schools ingest")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch today's export and store it re-encoded.
    Download,
    /// Rebuild the schools database from today's export, downloading it if needed.
    Populate,
    /// Run populate on the configured cron expression until interrupted.
    Schedule,
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .context("installing tracing subscriber")
}

/// Exit status for a forced quit, as a shell reports SIGINT.
const FORCED_EXIT: i32 = 130;

/// Raise `abort` on the first Ctrl-C so the run stops at its next stage boundary.
/// A second Ctrl-C exits at once; the open transaction rolls back with the connection.
fn abort_on_ctrl_c(abort: AbortSignal) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if abort.raise() {
                warn!("second interrupt received; exiting now");
                std::process::exit(FORCED_EXIT);
            }
            warn!("interrupt received; aborting at the next stage boundary, press Ctrl-C again to quit");
        }
    });
}

async fn run(command: Commands) -> Result<()> {
    let config = GiasConfig::from_env()?;
    let date = gias_sync::today();

    match command {
        Commands::Download => {
            let downloaded = gias_sync::run_download(&config, date).await?;
            println!(
                "download complete: file={} bytes={} sha256={} substitutions={}",
                downloaded.blob.absolute_path.display(),
                downloaded.blob.byte_size,
                downloaded.blob.content_hash,
                downloaded.substitutions
            );
        }
        Commands::Populate => {
            let abort = AbortSignal::new();
            abort_on_ctrl_c(abort.clone());
            let report = gias_sync::run_populate(&config, date, abort).await?;
            println!(
                "populate complete: run_id={} trusts={} dropped_rows={} reused_export={}",
                report.run_id,
                report.trusts.unwrap_or_default(),
                report.total_dropped_rows(),
                report.source_reused
            );
        }
        Commands::Schedule => {
            let abort = AbortSignal::new();
            let Some(mut sched) = gias_sync::maybe_build_scheduler(&config, abort.clone()).await?
            else {
                anyhow::bail!("scheduler disabled; set GIAS_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler started");

            tokio::signal::ctrl_c()
                .await
                .context("waiting for interrupt")?;
            abort.raise();
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_logging() {
        eprintln!("{err:#}");
    }

    match run(cli.command.unwrap_or(Commands::Populate)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<RunFailure>() {
            Some(failure) => {
                eprintln!("{failure}");
                ExitCode::from(failure.exit_code())
            }
            None => {
                eprintln!("error: {err:#}");
                ExitCode::FAILURE
            }
        },
    }
}

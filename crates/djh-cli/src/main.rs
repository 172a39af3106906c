use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use djh_sync::{HarvestConfig, Harvester, SourceRegistry};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "djh-cli")]
#[command(about = "data.json harvester command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest every enabled source once, or only `--source`.
    Harvest {
        #[arg(long)]
        source: Option<String>,
    },
    /// Finish the pending items of an interrupted job.
    Resume {
        #[arg(long)]
        job: Uuid,
    },
    Migrate,
    /// Run the cron scheduler until Ctrl-C.
    Schedule,
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt::layer().json().with_target(true);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt)
        .try_init()
        .context("initializing tracing")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Harvest { source: None }) {
        Commands::Harvest { source } => {
            let results = djh_sync::run_harvest_once_from_env(source.as_deref()).await?;
            let mut failures = 0;
            for (source_id, result) in &results {
                match result {
                    Ok(report) => println!(
                        "{source_id}: {} job_id={} created={} updated={} retired={} skipped={} failed={}",
                        report.status.as_str(),
                        report.job_id,
                        report.created.len(),
                        report.updated.len(),
                        report.retired.len(),
                        report.skipped.len(),
                        report.failed.len()
                    ),
                    Err(err) => {
                        failures += 1;
                        eprintln!("{source_id}: failed: {err}");
                    }
                }
            }
            if failures > 0 {
                bail!("{failures} of {} sources failed", results.len());
            }
        }
        Commands::Resume { job } => {
            let report = djh_sync::resume_job_from_env(job).await?;
            println!(
                "resumed job_id={} created={} updated={} retired={} skipped={} failed={}",
                report.job_id,
                report.created.len(),
                report.updated.len(),
                report.retired.len(),
                report.skipped.len(),
                report.failed.len()
            );
        }
        Commands::Migrate => {
            djh_sync::migrate_from_env().await?;
            println!("harvest ledger migrations applied");
        }
        Commands::Schedule => {
            let config = HarvestConfig::from_env();
            let registry = Arc::new(SourceRegistry::load(&config.sources_path()).await?);
            let harvester = Arc::new(Harvester::from_config(&config).await?);
            let Some(mut sched) =
                djh_sync::maybe_build_scheduler(&config, harvester, registry).await?
            else {
                bail!("scheduler is disabled; set DJH_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.harvest_cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

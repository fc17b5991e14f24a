use std::sync::Arc;

use anyhow::{bail, Context, Result};
use calp_storage::{ListingStore, PgListingStore};
use calp_sync::{
    maybe_build_scheduler, ExtractionOutcome, PipelineConfig, PipelineRunner, SyncOutcome,
};
use serde::Serialize;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "calp-cli")]
#[command(about = "Car ad listing pipeline: scrape, store and index marketplace listings")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one extraction from the configured search page
    Scrape {
        /// Replicate to the search index afterwards
        #[arg(long)]
        sync: bool,
    },
    /// Replicate unindexed listings to the search index
    Sync,
    /// Create the listing table and its indexes
    Migrate,
    /// Serve the HTTP API (and the cron jobs when enabled)
    Serve,
    /// Run extraction and sync on their cron schedules until interrupted
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env().context("loading configuration");

    match cli.command.unwrap_or(Commands::Scrape { sync: false }) {
        Commands::Scrape { sync } => {
            let runner = match connect(config).await {
                Ok(runner) => runner,
                Err(err) => {
                    print_outcome(&ExtractionOutcome::failed(format!("{err:#}")))?;
                    return Err(err);
                }
            };
            let outcome = runner.run_extraction().await;
            print_outcome(&outcome)?;
            if !outcome.success {
                bail!("extraction failed: {}", outcome.message);
            }
            if sync {
                let outcome = runner.run_sync().await;
                print_outcome(&outcome)?;
                if !outcome.success {
                    bail!("sync failed: {}", outcome.message);
                }
            }
        }
        Commands::Sync => {
            let runner = match connect(config).await {
                Ok(runner) => runner,
                Err(err) => {
                    print_outcome(&SyncOutcome::failed(format!("{err:#}")))?;
                    return Err(err);
                }
            };
            let outcome = runner.run_sync().await;
            print_outcome(&outcome)?;
            if !outcome.success {
                bail!("sync failed: {}", outcome.message);
            }
        }
        Commands::Migrate => {
            let config = config?;
            let store = PgListingStore::connect(&config.database_url, &config.listings_table)
                .await
                .context("connecting listing store")?;
            store.ensure_indexes().await.context("creating listing store schema")?;
            println!("migrate complete: table={}", store.table());
        }
        Commands::Serve => {
            let config = config?;
            let runner = Arc::new(PipelineRunner::connect(&config).await?);
            let scheduler = maybe_build_scheduler(&config, runner.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
            }
            calp_web::serve(&config, runner).await?;
            if let Some(mut sched) = scheduler {
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
        Commands::Schedule => {
            let config = config?;
            let runner = Arc::new(PipelineRunner::connect(&config).await?);
            let Some(mut sched) = maybe_build_scheduler(&config, runner).await? else {
                bail!("scheduler is disabled; set CALP_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

async fn connect(config: Result<PipelineConfig>) -> Result<PipelineRunner> {
    let config = config?;
    PipelineRunner::connect(&config).await
}

fn print_outcome<T: Serialize>(outcome: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    Ok(())
}

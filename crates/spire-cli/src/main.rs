//! `spire` binary: one subcommand per job, plus the scheduler loop.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use spire_core::JobResult;
use spire_store::{PgWarehouse, ScanStore, Warehouse};
use spire_sync::{
    maybe_build_scheduler, reconstruct_delta, DeltaOutcome, EngineConfig, SiteRegistry, SyncEngine,
};
use spire_upstream::HttpReportingClient;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "spire")]
#[command(about = "Search-performance warehouse sync jobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull search metrics for every enabled site into the warehouse.
    Sync {
        /// Report dates to ingest, ending at the newest date the upstream
        /// can serve.
        #[arg(long)]
        days: Option<u64>,
    },
    /// Record pending snapshots of each site's top pages.
    Capture,
    /// Fill pending snapshots whose reporting lag has passed.
    Complete,
    /// Check the snapshot cadence and staleness thresholds.
    Health,
    /// Show the broken-link delta between a site's two most recent scans.
    Delta {
        #[arg(long)]
        site: String,
    },
    /// Run the daily job chain on its cron schedule until ctrl-c.
    Schedule,
    /// Create the warehouse schema and tables.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging()?;
    let config = EngineConfig::from_env()?;

    match cli.command {
        Commands::Sync { days } => {
            let engine = build_engine(&config).await?;
            let window = engine.sync_window(days.unwrap_or(config.sync_window_days));
            let result = engine.run_sync(window).await?;
            Ok(report(&result))
        }
        Commands::Capture => {
            let engine = build_engine(&config).await?;
            let result = engine.run_capture(Utc::now().date_naive()).await?;
            Ok(report(&result))
        }
        Commands::Complete => {
            let engine = build_engine(&config).await?;
            let result = engine.run_completion(Utc::now().date_naive()).await?;
            Ok(report(&result))
        }
        Commands::Health => {
            let engine = build_engine(&config).await?;
            let report = engine.run_health_check(Utc::now().date_naive()).await?;
            if report.healthy() {
                println!("healthy: snapshot cadence ok as of {}", report.checked_on);
                Ok(ExitCode::SUCCESS)
            } else {
                for violation in &report.violations {
                    println!("violation: {violation}");
                }
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Delta { site } => {
            let store = ScanStore::new(&config.scan_root);
            match reconstruct_delta(&store, &site).await? {
                DeltaOutcome::Computed(delta) => {
                    println!(
                        "{}: {} -> {} (+{} -{} ={})",
                        delta.site,
                        delta.from_scanned_at.format("%Y-%m-%d %H:%M"),
                        delta.to_scanned_at.format("%Y-%m-%d %H:%M"),
                        delta.added.len(),
                        delta.removed.len(),
                        delta.unchanged.len()
                    );
                    for link in &delta.added {
                        println!("  + {} -> {}", link.source, link.target);
                    }
                    for link in &delta.removed {
                        println!("  - {} -> {}", link.source, link.target);
                    }
                    Ok(ExitCode::SUCCESS)
                }
                DeltaOutcome::Unavailable { scans_found } => {
                    println!("delta unavailable: {scans_found} scan(s) on record for {site}, need 2");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Schedule => {
            let engine = Arc::new(build_engine(&config).await?);
            match maybe_build_scheduler(engine).await? {
                None => {
                    println!("scheduler disabled; set SPIRE_SCHEDULER_ENABLED=1 to enable");
                    Ok(ExitCode::SUCCESS)
                }
                Some(mut sched) => {
                    sched.start().await.context("starting scheduler")?;
                    info!(cron = %config.daily_cron, "scheduler running; ctrl-c to stop");
                    tokio::signal::ctrl_c()
                        .await
                        .context("waiting for shutdown signal")?;
                    sched.shutdown().await.context("stopping scheduler")?;
                    Ok(ExitCode::SUCCESS)
                }
            }
        }
        Commands::Migrate => {
            let warehouse = build_warehouse(&config).await?;
            warehouse.ensure_schema().await?;
            println!("schema {} ready", config.schema);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn report(result: &JobResult) -> ExitCode {
    println!("{}", result.summary_line());
    ExitCode::from(result.status.exit_code() as u8)
}

async fn connect_pool(config: &EngineConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("connecting to warehouse database")
}

async fn build_warehouse(config: &EngineConfig) -> Result<PgWarehouse> {
    let pool = connect_pool(config).await?;
    Ok(PgWarehouse::new(pool, config.warehouse_config())?)
}

async fn build_engine(config: &EngineConfig) -> Result<SyncEngine> {
    let warehouse = Arc::new(build_warehouse(config).await?);
    let source = Arc::new(HttpReportingClient::new(config.reporting_client_config())?);
    let registry = SiteRegistry::load(&config.sites_file).await?;
    let sites = registry.enabled_sites();
    if sites.is_empty() {
        warn!(
            registry = %config.sites_file.display(),
            "no enabled sites; jobs will run vacuously"
        );
    }
    Ok(SyncEngine::new(config.clone(), sites, warehouse, source))
}

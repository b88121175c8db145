use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveTime};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tsync_core::{DateWindow, SyncMode};
use tsync_storage::PgReleaseStore;
use tsync_sync::{maybe_build_scheduler, BackfillRequest, SyncConfig, SyncRequest, SyncService};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "tsync-cli")]
#[command(about = "OCDS tender sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync on the configured runner.
    Sync {
        #[arg(long, default_value = "daily")]
        mode: SyncMode,
        /// First publication day of an explicit window.
        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
        #[arg(long)]
        cap: Option<usize>,
    },
    /// Resume a durable run from its checkpoints.
    Resume { run_id: Uuid },
    EnrichToday {
        #[arg(long)]
        cap: Option<usize>,
    },
    Backfill {
        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    CancelBackfill,
    /// Print sync state, health and recent jobs.
    Status {
        #[arg(long, default_value_t = 10)]
        jobs: usize,
    },
    Migrate,
    /// Serve the operator API; runs the cron scheduler when enabled.
    Serve,
    /// Run only the cron scheduler until interrupted.
    Schedule,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,reqwest=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn day_window(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Option<DateWindow> {
    let (from, to) = (from?, to?);
    let end_of_day = NaiveTime::from_hms_opt(23, 59, 59)?;
    Some(DateWindow::new(
        from.and_time(NaiveTime::MIN).and_utc(),
        to.and_time(end_of_day).and_utc(),
    ))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Ctrl-C cancels in-flight runs at their next check.
fn cancel_on_ctrl_c(service: &Arc<SyncService>) {
    let token = service.shutdown_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    let command = cli.command.unwrap_or(Commands::Sync {
        mode: SyncMode::Daily,
        from: None,
        to: None,
        cap: None,
    });

    if let Commands::Migrate = command {
        let store = PgReleaseStore::connect(&config.database_url, config.db_max_connections)
            .await
            .context("connecting release store")?;
        store.migrate().await?;
        println!("migrations applied");
        return Ok(());
    }

    let bind_addr = config.bind_addr.clone();
    let service = Arc::new(SyncService::from_config(config).await?);
    cancel_on_ctrl_c(&service);

    match command {
        Commands::Sync {
            mode,
            from,
            to,
            cap,
        } => {
            let request = SyncRequest {
                mode,
                range: day_window(from, to),
                cap_override: cap,
            };
            print_json(&service.run_sync(&request).await?)?;
        }
        Commands::Resume { run_id } => print_json(&service.resume_durable(run_id).await?)?,
        Commands::EnrichToday { cap } => print_json(&service.enrich_today(cap).await?)?,
        Commands::Backfill { from, to, limit } => {
            let request = BackfillRequest {
                window: day_window(from, to),
                limit,
            };
            print_json(&service.run_backfill(&request).await?)?;
        }
        Commands::CancelBackfill => {
            service.cancel_backfill().await?;
            println!("backfill cancel requested");
        }
        Commands::Status { jobs } => {
            print_json(&service.sync_status().await?)?;
            print_json(&service.recent_jobs(jobs).await?)?;
        }
        Commands::Serve => {
            let scheduler = maybe_build_scheduler(service.clone()).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!("cron scheduler started");
            }
            tsync_web::serve(service.clone(), &bind_addr).await?;
            if let Some(mut sched) = scheduler {
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
        Commands::Schedule => {
            let Some(mut sched) = maybe_build_scheduler(service.clone()).await? else {
                anyhow::bail!("scheduler is disabled; set TSYNC_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!("cron scheduler started");
            service.shutdown_token().cancelled().await;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        // handled before the service connects
        Commands::Migrate => {}
    }

    Ok(())
}

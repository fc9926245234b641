use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use infoguard_core::WatchStatus;
use infoguard_storage::Store;
use infoguard_sync::{maybe_build_scheduler, MonitorConfig, MonitorPipeline};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "infoguard")]
#[command(about = "Revision monitor: edit risk scoring, anomaly detection and triage")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one full monitoring cycle.
    Cycle,
    /// Promote frequently edited documents from the recent-changes feed.
    Discover,
    /// Print the triage ordering.
    Rank {
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
    /// Re-run anomaly detection over stored history.
    Sweep,
    Pause {
        title: String,
    },
    Resume {
        title: String,
    },
    /// Run cycles on the configured cron schedule until interrupted.
    Schedule,
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("INFOGUARD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = MonitorConfig::from_env();
    let store = Store::connect(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;

    let result = run(cli.command.unwrap_or(Commands::Cycle), config, store.clone()).await;
    store.close().await;
    result
}

async fn run(command: Commands, config: MonitorConfig, store: Store) -> Result<()> {
    match command {
        Commands::Migrate => {
            println!("migrations applied to {}", config.database_url);
        }
        Commands::Pause { title } => set_status(&store, &title, WatchStatus::Paused).await?,
        Commands::Resume { title } => set_status(&store, &title, WatchStatus::Active).await?,
        Commands::Cycle => {
            let pipeline = MonitorPipeline::new(config, store)?;
            let summary = pipeline.run_cycle_with_deadline().await?;
            println!(
                "cycle complete: run_id={} checked={} discovered={} changes={} flagged={} duration={:.2}s",
                summary.run_id,
                summary.documents_checked,
                summary.documents_discovered,
                summary.changes_detected,
                summary.flagged_count,
                summary.duration_seconds
            );
        }
        Commands::Discover => {
            let pipeline = MonitorPipeline::new(config, store)?;
            let promoted = pipeline.discover().await?;
            println!("promoted {} document(s)", promoted.len());
            for title in promoted {
                println!("  {title}");
            }
        }
        Commands::Rank { top } => {
            let pipeline = MonitorPipeline::new(config, store)?;
            let ranking = pipeline.rank().await?;
            println!(
                "{:<4} {:<48} {:>8} {:>8} {:>8} {:>6} {:>6}",
                "#", "document", "priority", "avg", "max", "flags", "edits"
            );
            for (i, e) in ranking.iter().take(top).enumerate() {
                println!(
                    "{:<4} {:<48} {:>8.3} {:>8.3} {:>8.3} {:>6.2} {:>6}{}",
                    i + 1,
                    e.document_id,
                    e.priority_score,
                    e.avg_risk,
                    e.max_risk,
                    e.flag_rate,
                    e.edit_volume,
                    if e.anomaly_boost > 0.0 { "  anomaly" } else { "" }
                );
            }
        }
        Commands::Sweep => {
            let pipeline = MonitorPipeline::new(config, store)?;
            let sweep = pipeline.sweep_anomalies(Utc::now()).await?;
            println!(
                "sweep complete: risk_anomalies={} run_anomalies={} model_anomalies={}",
                sweep.risk_anomalies.len(),
                sweep.run_anomalies.len(),
                sweep.model_anomalies.len()
            );
        }
        Commands::Schedule => {
            let pipeline = Arc::new(MonitorPipeline::new(config, store)?);
            let Some(mut sched) = maybe_build_scheduler(pipeline).await? else {
                bail!("INFOGUARD_SCHEDULER_CRON is empty; nothing to schedule");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }
    Ok(())
}

async fn set_status(store: &Store, title: &str, status: WatchStatus) -> Result<()> {
    if !store.set_status(title, status).await? {
        bail!("{title} is not on the watchlist");
    }
    println!("{title}: {status}");
    Ok(())
}

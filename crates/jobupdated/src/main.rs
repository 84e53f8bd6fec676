//! jobupdated — the job update daemon.
//!
//! Assembles the update subsystems into one process:
//! - State store (redb)
//! - Scheduler (in-process simulation)
//! - Update registry and its controllers
//!
//! On start the daemon recovers every unfinished update from the store,
//! then starts the updates listed in its configuration file.
//!
//! # Usage
//!
//! ```text
//! jobupdated run --data-dir /var/lib/jobupdated --config jobupdated.toml
//! jobupdated list --data-dir /var/lib/jobupdated --job prod/api
//! ```

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use jobupdate_controller::{SimulatedScheduler, UpdateError, UpdateRegistry};
use jobupdate_state::{StateStore, UpdateStore};
use tracing::{info, warn};

use crate::config::DaemonConfig;

#[derive(Parser)]
#[command(name = "jobupdated", about = "Job update daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run update controllers until interrupted.
    Run {
        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/jobupdated")]
        data_dir: PathBuf,

        /// Daemon configuration file (TOML).
        #[arg(long)]
        config: Option<PathBuf>,

        /// Stop once every update has reached a terminal state.
        #[arg(long)]
        exit_when_idle: bool,
    },
    /// Print recorded updates as JSON.
    List {
        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/jobupdated")]
        data_dir: PathBuf,

        /// Only show updates of this job.
        #[arg(long)]
        job: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,jobupdated=debug,jobupdate=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            data_dir,
            config,
            exit_when_idle,
        } => run(data_dir, config, exit_when_idle).await,
        Command::List { data_dir, job } => list(&data_dir, job.as_deref()),
    }
}

fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("jobupdate.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

async fn run(
    data_dir: PathBuf,
    config_path: Option<PathBuf>,
    exit_when_idle: bool,
) -> anyhow::Result<()> {
    info!("job update daemon starting");

    let config = match &config_path {
        Some(path) => DaemonConfig::from_file(path)?,
        None => DaemonConfig::default(),
    };

    // ── Initialize subsystems ──────────────────────────────────

    let store = open_store(&data_dir)?;

    let scheduler = SimulatedScheduler::new(config.simulation.healthy_after());
    for job in &config.simulation.jobs {
        scheduler.add_job(&job.id, job.instances, &job.version);
        for rule in &job.fail_on {
            scheduler.fail_on(&job.id, rule.instance, &rule.version);
        }
    }
    info!(
        jobs = config.simulation.jobs.len(),
        healthy_after_ms = config.simulation.healthy_after_ms,
        "simulated scheduler initialized"
    );

    let registry = UpdateRegistry::new(
        Arc::new(store),
        Arc::new(scheduler),
        config.controller.clone(),
    );
    let recovered = registry.recover().await?;
    info!(recovered, "updates recovered");

    // ── Start configured updates ───────────────────────────────

    for request in &config.updates {
        let history = registry.list_updates(Some(&request.job)).await?;
        if history
            .iter()
            .any(|u| u.spec.desired_version == request.spec.desired_version)
        {
            info!(job = %request.job, version = %request.spec.desired_version, "update already recorded; skipping");
            continue;
        }
        match registry
            .start_update(&request.job, request.spec.clone(), request.supersede)
            .await
        {
            Ok(key) => info!(update = %key, "update started"),
            Err(UpdateError::Conflict { active, .. }) => {
                warn!(job = %request.job, %active, "job already has an active update; skipping");
            }
            Err(e) => return Err(e.into()),
        }
    }

    // ── Wait for shutdown ──────────────────────────────────────

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut idle_check = tokio::time::interval(Duration::from_millis(200));
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result?;
                info!("shutdown signal received");
                break;
            }
            _ = idle_check.tick(), if exit_when_idle => {
                if registry.is_idle().await {
                    info!("all updates finished");
                    break;
                }
            }
        }
    }

    registry.shutdown().await;
    for update in registry.list_updates(None).await? {
        info!(
            update = %update.key,
            state = %update.status.state,
            updated = update.status.instances_updated,
            reverted = update.status.instances_reverted,
            "final update state"
        );
    }

    info!("job update daemon stopped");
    Ok(())
}

fn list(data_dir: &Path, job: Option<&str>) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    let entries = match job {
        Some(job) => store.list_updates_for_job(job)?,
        None => store.load_all("")?,
    };
    for entry in entries {
        println!("{}", serde_json::to_string(&entry.value)?);
    }
    Ok(())
}

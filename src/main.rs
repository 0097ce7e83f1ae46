use adsplice_lib::commands::{self, SubmitOptions};
use adsplice_lib::config::AppConfig;
use adsplice_lib::database::{Database, JobSnapshot, JobStatus};
use adsplice_lib::error::AppError;
use adsplice_lib::worker::cleanup::CleanupSweeper;
use adsplice_lib::{boot, init_logging, open_store};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "adsplice", version, about = "Remove ads from podcast episodes")]
struct Cli {
    /// YAML config file
    #[arg(short, long, global = true, env = "ADSPLICE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process episodes and wait for the results
    Process {
        /// Audio file paths or URLs
        #[arg(required = true)]
        episodes: Vec<String>,
        /// Queue priority; lower values run first
        #[arg(short, long, default_value_t = 0)]
        priority: i32,
        /// Re-run every stage even if a current output exists
        #[arg(long)]
        force: bool,
    },
    /// Run the scheduler and cleanup agent until Ctrl-C
    Serve,
    /// Show one job, or the active jobs
    Status {
        job_id: Option<String>,
        /// Include finished jobs
        #[arg(long)]
        all: bool,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Remove expired jobs
    Cleanup {
        /// Only report what would be removed
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load config")?;
    init_logging(&config.logging.level);

    match cli.command {
        Commands::Process {
            episodes,
            priority,
            force,
        } => process(config, episodes, priority, force).await,
        Commands::Serve => serve(config).await,
        Commands::Status { job_id, all, limit } => status(&config, job_id, all, limit),
        Commands::Cleanup { dry_run } => cleanup(config, dry_run).await,
    }
}

/// Local paths are made absolute so the stored reference does not depend on
/// the working directory.
fn normalize_reference(episode: &str) -> String {
    let path = Path::new(episode);
    if path.exists() {
        if let Ok(abs) = path.canonicalize() {
            return abs.to_string_lossy().to_string();
        }
    }
    episode.to_string()
}

async fn process(
    config: AppConfig,
    episodes: Vec<String>,
    priority: i32,
    force: bool,
) -> anyhow::Result<()> {
    let service = boot(config).await?;
    let state = service.state().clone();

    let mut job_ids = Vec::new();
    for episode in &episodes {
        let episode_ref = normalize_reference(episode);
        match commands::submit_job_with(&state, &episode_ref, priority, SubmitOptions { force })
            .await
        {
            Ok(job_id) => job_ids.push(job_id),
            Err(AppError::Conflict(msg)) => match state.db.active_job_for_episode(&episode_ref)? {
                Some(job) => {
                    log::info!("{}; waiting on job {}", msg, job.id);
                    job_ids.push(job.id);
                }
                None => anyhow::bail!("{}", msg),
            },
            Err(e) => return Err(e.into()),
        }
    }

    let poll = state.clone();
    let ids = job_ids.clone();
    service
        .run_until(async move {
            loop {
                let mut pending = 0;
                for id in &ids {
                    match poll.db.get_job(id) {
                        Ok(Some(job)) if job.status.is_terminal() => {}
                        Ok(Some(_)) => pending += 1,
                        Ok(None) => {}
                        Err(e) => log::warn!("Failed to read job {}: {}", id, e),
                    }
                }
                if pending == 0 {
                    break;
                }
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        log::warn!("Interrupted; {} job(s) still pending", pending);
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                }
            }
        })
        .await?;

    let mut snapshots = Vec::new();
    for id in &job_ids {
        snapshots.push(commands::get_job(&state, id).await?);
    }
    println!("{}", serde_json::to_string_pretty(&snapshots)?);

    let failed = snapshots
        .iter()
        .filter(|s| matches!(s.status, JobStatus::Failed | JobStatus::Cancelled))
        .count();
    if failed > 0 {
        anyhow::bail!("{} job(s) did not complete", failed);
    }
    Ok(())
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let service = boot(config).await?;
    service
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await?;
    Ok(())
}

fn status(config: &AppConfig, job_id: Option<String>, all: bool, limit: i64) -> anyhow::Result<()> {
    let db_path = config.paths.database_path();
    if !db_path.exists() {
        anyhow::bail!("No store at {:?}; nothing has been processed yet", db_path);
    }
    let db = Database::open(&db_path)?;

    let output = match job_id {
        Some(id) => {
            let job = db
                .get_job(&id)?
                .ok_or_else(|| AppError::NotFound(format!("job {}", id)))?;
            serde_json::to_string_pretty(&JobSnapshot::from(&job))?
        }
        None => {
            let jobs: Vec<JobSnapshot> = db
                .list_jobs(!all, limit)?
                .iter()
                .map(JobSnapshot::from)
                .collect();
            serde_json::to_string_pretty(&jobs)?
        }
    };
    println!("{}", output);
    Ok(())
}

async fn cleanup(config: AppConfig, dry_run: bool) -> anyhow::Result<()> {
    let (writer, _writer_task, db) = open_store(&config)?;
    let sweeper = CleanupSweeper::new(db, writer, config.cleanup.retention_days);
    if !sweeper.is_enabled() {
        anyhow::bail!("Cleanup is disabled: set cleanup.retention_days in the config");
    }

    let output = if dry_run {
        serde_json::to_string_pretty(&sweeper.preview()?)?
    } else {
        serde_json::to_string_pretty(&sweeper.run().await?)?
    };
    println!("{}", output);
    Ok(())
}

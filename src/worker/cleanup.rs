use crate::database::actions::{ActionOutcome, WriteAction};
use crate::database::{timestamp, Database, Job};
use crate::error::AppError;
use crate::writer::WriterHandle;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CleanupPreview {
    pub enabled: bool,
    pub count: usize,
    pub cutoff: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CleanupReport {
    pub removed: usize,
    /// Jobs left in the store.
    pub remaining: i64,
    pub purged_episodes: usize,
    pub deleted_files: usize,
}

/// Removes terminal jobs of unpinned episodes once they pass the retention
/// window. Every deletion goes through the writer.
pub struct CleanupSweeper {
    db: Arc<Database>,
    writer: WriterHandle,
    retention_days: Option<i64>,
}

impl CleanupSweeper {
    pub fn new(db: Arc<Database>, writer: WriterHandle, retention_days: Option<i64>) -> Self {
        Self {
            db,
            writer,
            retention_days,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.retention_days.map(|d| d > 0).unwrap_or(false)
    }

    fn cutoff_at(&self, now: DateTime<Utc>) -> Option<String> {
        self.retention_days
            .filter(|d| *d > 0)
            .map(|d| timestamp(now - chrono::Duration::days(d)))
    }

    pub fn preview(&self) -> Result<CleanupPreview, AppError> {
        self.preview_at(Utc::now())
    }

    /// Dry run: what `run_at(now)` would remove.
    pub fn preview_at(&self, now: DateTime<Utc>) -> Result<CleanupPreview, AppError> {
        let Some(cutoff) = self.cutoff_at(now) else {
            return Ok(CleanupPreview {
                enabled: false,
                count: 0,
                cutoff: None,
            });
        };
        let count = self.db.cleanup_candidates(&cutoff)?.len();
        Ok(CleanupPreview {
            enabled: true,
            count,
            cutoff: Some(cutoff),
        })
    }

    pub async fn run(&self) -> Result<CleanupReport, AppError> {
        self.run_at(Utc::now()).await
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<CleanupReport, AppError> {
        let mut report = CleanupReport {
            removed: 0,
            remaining: 0,
            purged_episodes: 0,
            deleted_files: 0,
        };
        let Some(cutoff) = self.cutoff_at(now) else {
            report.remaining = self.db.count_jobs()?;
            return Ok(report);
        };

        let candidates = self.db.cleanup_candidates(&cutoff)?;
        if !candidates.is_empty() {
            let outcome = self
                .writer
                .apply(WriteAction::DeleteJobs {
                    job_ids: candidates.iter().map(|j| j.id.clone()).collect(),
                    finished_before: Some(cutoff.clone()),
                })
                .await?;
            report.removed = outcome.rows();

            // Pinned or re-run since the candidates were read
            let deleted: BTreeSet<&str> = match &outcome {
                ActionOutcome::JobsDeleted { job_ids } => {
                    job_ids.iter().map(String::as_str).collect()
                }
                _ => BTreeSet::new(),
            };
            let candidates: Vec<&Job> = candidates
                .iter()
                .filter(|j| deleted.contains(j.id.as_str()))
                .collect();

            // Output files of removed jobs, unless still the episode's current output
            for job in &candidates {
                let Some(path) = job.output_path.as_deref() else {
                    continue;
                };
                let current = self
                    .db
                    .get_episode(&job.episode_ref)?
                    .and_then(|e| e.output_path);
                if current.as_deref() == Some(path) {
                    continue;
                }
                match std::fs::remove_file(path) {
                    Ok(()) => report.deleted_files += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => log::warn!("Failed to delete old output {}: {}", path, e),
                }
            }

            let episodes: BTreeSet<&str> =
                candidates.iter().map(|j| j.episode_ref.as_str()).collect();
            for episode_ref in episodes {
                if self.db.count_jobs_for_episode(episode_ref)? > 0 {
                    continue;
                }
                let purge = WriteAction::PurgeEpisodeData {
                    episode_ref: episode_ref.to_string(),
                };
                match self.writer.apply(purge).await {
                    Ok(outcome) if outcome.rows() > 0 => report.purged_episodes += 1,
                    Ok(_) => {}
                    // Resubmitted or pinned since the candidates were read
                    Err(AppError::Conflict(msg)) => log::info!("Keeping {}: {}", episode_ref, msg),
                    Err(e) => return Err(e),
                }
            }
        }

        report.remaining = self.db.count_jobs()?;
        log::info!(
            "Cleanup removed {} job(s) finished before {} ({} remaining, {} episode(s) purged, {} file(s) deleted)",
            report.removed,
            cutoff,
            report.remaining,
            report.purged_episodes,
            report.deleted_files
        );
        Ok(report)
    }
}

/// Run the sweeper every `interval` until cancelled
pub async fn cleanup_agent(
    sweeper: Arc<CleanupSweeper>,
    interval: Duration,
    cancel: CancellationToken,
) {
    if !sweeper.is_enabled() {
        log::info!("Cleanup agent disabled (no retention window)");
        return;
    }
    log::info!("Cleanup agent started (every {:?})", interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                log::info!("Cleanup agent cancelled");
                break;
            }
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = sweeper.run().await {
                    log::error!("Cleanup sweep failed: {}", e);
                }
            }
        }
    }
}

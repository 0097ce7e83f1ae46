pub mod cleanup;
pub mod pipeline;
pub mod source;
pub mod splice;
pub mod transcribe;

#[cfg(test)]
pub(crate) mod testing;

use crate::database::actions::WriteAction;
use crate::database::{Database, JobOutcome, JobStatus, RunSummary};
use crate::error::AppError;
use crate::writer::WriterHandle;
use chrono::{DateTime, Utc};
use pipeline::JobExecutor;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Preparing,
    Transcribing,
    Classifying,
    Resolving,
    Splicing,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Preparing,
        Stage::Transcribing,
        Stage::Classifying,
        Stage::Resolving,
        Stage::Splicing,
    ];

    pub fn step(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Preparing => "preparing",
            Self::Transcribing => "transcribing",
            Self::Classifying => "classifying",
            Self::Resolving => "resolving",
            Self::Splicing => "splicing",
        }
    }

    /// Overall progress range covered by this stage, in percent.
    pub fn band(self) -> (i32, i32) {
        match self {
            Self::Preparing => (0, 5),
            Self::Transcribing => (5, 35),
            Self::Classifying => (35, 80),
            Self::Resolving => (80, 85),
            Self::Splicing => (85, 100),
        }
    }

    /// Overall percentage for a fraction of this stage.
    pub fn percent(self, fraction: f64) -> i32 {
        let (lo, hi) = self.band();
        lo + ((hi - lo) as f64 * fraction.clamp(0.0, 1.0)).round() as i32
    }
}

/// Progress update from a running job
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub job_id: String,
    pub step: i32,
    pub step_name: String,
    pub progress: i32,
}

/// Reports in-stage progress to the scheduler's live view.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: String,
    stage: Stage,
    tx: mpsc::Sender<ProgressUpdate>,
}

impl ProgressReporter {
    pub fn new(job_id: &str, stage: Stage, tx: mpsc::Sender<ProgressUpdate>) -> Self {
        Self {
            job_id: job_id.to_string(),
            stage,
            tx,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Never blocks; a full channel drops the update.
    pub fn report(&self, fraction: f64) {
        let _ = self.tx.try_send(ProgressUpdate {
            job_id: self.job_id.clone(),
            step: self.stage.step(),
            step_name: self.stage.name().to_string(),
            progress: self.stage.percent(fraction),
        });
    }
}

/// A job currently held by a worker slot
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSlot {
    pub job_id: String,
    pub episode_ref: String,
    pub step: i32,
    pub step_name: String,
    pub progress: i32,
    pub started_at: DateTime<Utc>,
}

/// Shared worker state for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct WorkerState {
    pub slots: Vec<WorkerSlot>,
    pub concurrency: usize,
    pub summary: RunSummary,
    pub last_activity: Option<DateTime<Utc>>,
}

impl WorkerState {
    pub fn new(concurrency: usize) -> Self {
        Self {
            slots: Vec::new(),
            concurrency,
            summary: RunSummary::default(),
            last_activity: None,
        }
    }

    pub fn is_processing(&self) -> bool {
        !self.slots.is_empty()
    }
}

#[derive(Debug)]
pub enum SchedulerCommand {
    /// Look at the queue now instead of waiting for the next poll.
    Wake,
    /// Fire the cancellation token of a running job.
    Cancel(String),
}

/// Cloneable control side of the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerCommand>,
    state: Arc<RwLock<WorkerState>>,
}

impl SchedulerHandle {
    pub fn notify(&self) {
        let _ = self.tx.try_send(SchedulerCommand::Wake);
    }

    pub async fn cancel(&self, job_id: &str) {
        let _ = self
            .tx
            .send(SchedulerCommand::Cancel(job_id.to_string()))
            .await;
    }

    pub async fn status(&self) -> WorkerState {
        self.state.read().await.clone()
    }

    pub async fn record_submitted(&self) {
        let mut ws = self.state.write().await;
        ws.summary.submitted += 1;
        ws.last_activity = Some(Utc::now());
    }

    /// Start a new summary epoch.
    pub async fn reset_summary(&self) -> RunSummary {
        let mut ws = self.state.write().await;
        std::mem::take(&mut ws.summary)
    }
}

pub struct JobScheduler {
    db: Arc<Database>,
    writer: WriterHandle,
    executor: Arc<JobExecutor>,
    state: Arc<RwLock<WorkerState>>,
    rx: mpsc::Receiver<SchedulerCommand>,
    concurrency: usize,
    poll_interval: Duration,
}

impl JobScheduler {
    pub fn new(
        db: Arc<Database>,
        writer: WriterHandle,
        executor: Arc<JobExecutor>,
        concurrency: usize,
        poll_interval: Duration,
    ) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::channel(64);
        let state = Arc::new(RwLock::new(WorkerState::new(concurrency)));
        let handle = SchedulerHandle {
            tx,
            state: state.clone(),
        };
        let scheduler = Self {
            db,
            writer,
            executor,
            state,
            rx,
            concurrency: concurrency.max(1),
            poll_interval,
        };
        (scheduler, handle)
    }

    /// Run until `shutdown` fires and every running job has wound down.
    pub async fn run(mut self, shutdown: CancellationToken) {
        log::info!("Job scheduler started (concurrency {})", self.concurrency);

        // Jobs left running by a previous process can never finish
        match self.writer.apply(WriteAction::FailInterruptedJobs).await {
            Ok(outcome) if outcome.rows() > 0 => {
                log::warn!("Marked {} interrupted job(s) as failed", outcome.rows())
            }
            Ok(_) => {}
            Err(e) => log::error!("Failed to recover interrupted jobs: {}", e),
        }

        let (progress_tx, mut progress_rx) = mpsc::channel::<ProgressUpdate>(64);
        let mut running: JoinSet<(String, Result<JobStatus, tokio::task::JoinError>)> =
            JoinSet::new();
        let mut tokens: HashMap<String, CancellationToken> = HashMap::new();
        let mut stopping = false;
        let mut commands_open = true;

        loop {
            if stopping && running.is_empty() {
                break;
            }
            if !stopping {
                self.fill_slots(&mut running, &mut tokens, &progress_tx, &shutdown)
                    .await;
            }

            tokio::select! {
                _ = shutdown.cancelled(), if !stopping => {
                    log::info!(
                        "Shutdown requested, waiting for {} running job(s)",
                        running.len()
                    );
                    stopping = true;
                }
                cmd = self.rx.recv(), if commands_open => {
                    match cmd {
                        Some(SchedulerCommand::Wake) => {}
                        Some(SchedulerCommand::Cancel(job_id)) => {
                            if let Some(token) = tokens.get(&job_id) {
                                log::info!("Cancelling running job {}", job_id);
                                token.cancel();
                            }
                        }
                        None => commands_open = false,
                    }
                }
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    match joined {
                        Ok((job_id, result)) => {
                            tokens.remove(&job_id);
                            let status = match result {
                                Ok(status) => status,
                                Err(e) => self.fail_panicked(&job_id, e).await,
                            };
                            self.job_finished(&job_id, status).await;
                        }
                        Err(e) => log::error!("Job supervisor task failed: {}", e),
                    }
                }
                Some(update) = progress_rx.recv() => {
                    let mut ws = self.state.write().await;
                    if let Some(slot) = ws.slots.iter_mut().find(|s| s.job_id == update.job_id) {
                        slot.step = update.step;
                        slot.step_name = update.step_name;
                        slot.progress = update.progress;
                    }
                }
                _ = tokio::time::sleep(self.poll_interval), if !stopping => {}
            }
        }

        log::info!("Job scheduler stopped");
    }

    /// Admit queued jobs while slots are free
    async fn fill_slots(
        &self,
        running: &mut JoinSet<(String, Result<JobStatus, tokio::task::JoinError>)>,
        tokens: &mut HashMap<String, CancellationToken>,
        progress_tx: &mpsc::Sender<ProgressUpdate>,
        shutdown: &CancellationToken,
    ) {
        while running.len() < self.concurrency {
            let job = match self.db.next_queued_job() {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    log::error!("Failed to read the job queue: {}", e);
                    break;
                }
            };

            match self
                .writer
                .apply(WriteAction::StartJob {
                    job_id: job.id.clone(),
                })
                .await
            {
                Ok(_) => {}
                // Cancelled between the read and the write
                Err(AppError::InvalidTransition(_)) | Err(AppError::NotFound(_)) => continue,
                Err(e) => {
                    log::error!("Failed to start job {}: {}", job.id, e);
                    break;
                }
            }

            let token = shutdown.child_token();
            tokens.insert(job.id.clone(), token.clone());
            {
                let mut ws = self.state.write().await;
                ws.slots.push(WorkerSlot {
                    job_id: job.id.clone(),
                    episode_ref: job.episode_ref.clone(),
                    step: Stage::Preparing.step(),
                    step_name: Stage::Preparing.name().to_string(),
                    progress: 0,
                    started_at: Utc::now(),
                });
                ws.last_activity = Some(Utc::now());
            }

            let executor = self.executor.clone();
            let progress_tx = progress_tx.clone();
            let shutdown = shutdown.clone();
            let job_id = job.id.clone();
            running.spawn(async move {
                // Inner task so a panic is reported against its job
                let inner = tokio::spawn(async move {
                    executor.execute(job, token, shutdown, progress_tx).await
                });
                (job_id, inner.await)
            });
        }
    }

    async fn fail_panicked(&self, job_id: &str, e: tokio::task::JoinError) -> JobStatus {
        log::error!("Job {} worker panicked: {}", job_id, e);
        let finish = WriteAction::FinishJob {
            job_id: job_id.to_string(),
            outcome: JobOutcome::Failed {
                error: format!("worker panicked: {}", e),
            },
        };
        if let Err(e) = self.writer.apply(finish).await {
            log::error!("Failed to record panic of job {}: {}", job_id, e);
        }
        JobStatus::Failed
    }

    async fn job_finished(&self, job_id: &str, status: JobStatus) {
        let mut ws = self.state.write().await;
        ws.slots.retain(|s| s.job_id != job_id);
        ws.summary.record(status);
        ws.last_activity = Some(Utc::now());
    }
}

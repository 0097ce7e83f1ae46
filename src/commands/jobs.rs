use super::{AppState, SubmitOptions};
use crate::database::actions::{ActionOutcome, WriteAction};
use crate::database::{JobSnapshot, JobStatus, ModelCall};
use crate::error::AppError;

const DEFAULT_LIST_LIMIT: i64 = 50;

/// POST /jobs -> submit_job command
pub async fn submit_job(
    state: &AppState,
    episode_ref: &str,
    priority: i32,
) -> Result<String, AppError> {
    submit_job_with(state, episode_ref, priority, SubmitOptions::default()).await
}

pub async fn submit_job_with(
    state: &AppState,
    episode_ref: &str,
    priority: i32,
    options: SubmitOptions,
) -> Result<String, AppError> {
    let episode_ref = episode_ref.trim();
    let job_id = uuid::Uuid::new_v4().to_string();

    let outcome = state
        .writer
        .apply(WriteAction::CreateJob {
            job_id: job_id.clone(),
            episode_ref: episode_ref.to_string(),
            priority,
            force: options.force,
        })
        .await;

    match outcome {
        Ok(ActionOutcome::JobCreated { job_id }) => {
            log::info!(
                "Queued job {} for {} (priority {}{})",
                job_id,
                episode_ref,
                priority,
                if options.force { ", forced" } else { "" }
            );
            state.scheduler.record_submitted().await;
            state.scheduler.notify();
            Ok(job_id)
        }
        Ok(other) => Err(AppError::Other(format!(
            "Unexpected writer outcome for job creation: {:?}",
            other
        ))),
        Err(e @ AppError::Conflict(_)) => {
            log::info!("Rejected duplicate submission for {}: {}", episode_ref, e);
            Err(e)
        }
        Err(e) => Err(e),
    }
}

/// GET /jobs/:id -> get_job command
pub async fn get_job(state: &AppState, job_id: &str) -> Result<JobSnapshot, AppError> {
    state
        .db
        .get_job(job_id)?
        .map(|job| JobSnapshot::from(&job))
        .ok_or_else(|| AppError::NotFound(format!("job {}", job_id)))
}

/// Queued and running jobs, highest priority first
pub async fn list_active(
    state: &AppState,
    limit: Option<i64>,
) -> Result<Vec<JobSnapshot>, AppError> {
    let jobs = state
        .db
        .list_jobs(true, limit.unwrap_or(DEFAULT_LIST_LIMIT))?;
    Ok(jobs.iter().map(JobSnapshot::from).collect())
}

pub async fn list_all(state: &AppState, limit: Option<i64>) -> Result<Vec<JobSnapshot>, AppError> {
    let jobs = state
        .db
        .list_jobs(false, limit.unwrap_or(DEFAULT_LIST_LIMIT))?;
    Ok(jobs.iter().map(JobSnapshot::from).collect())
}

/// DELETE /jobs/:id -> cancel_job command
///
/// A queued job is cancelled outright. A running job has its flag raised and
/// stops at the next stage boundary; the returned status is the one the job
/// has right after the request.
pub async fn cancel_job(state: &AppState, job_id: &str) -> Result<JobStatus, AppError> {
    let outcome = state
        .writer
        .apply(WriteAction::CancelJob {
            job_id: job_id.to_string(),
        })
        .await?;

    match outcome {
        ActionOutcome::CancelRequested { status } => {
            if status == JobStatus::Running {
                state.scheduler.cancel(job_id).await;
            }
            log::info!("Cancel requested for job {} (now {})", job_id, status);
            Ok(status)
        }
        other => Err(AppError::Other(format!(
            "Unexpected writer outcome for cancellation: {:?}",
            other
        ))),
    }
}

/// Audit trail of a job's transcription and classification calls
pub async fn get_model_calls(state: &AppState, job_id: &str) -> Result<Vec<ModelCall>, AppError> {
    if state.db.get_job(job_id)?.is_none() {
        return Err(AppError::NotFound(format!("job {}", job_id)));
    }
    state
        .db
        .get_model_calls_for_job(job_id)
        .map_err(AppError::from)
}

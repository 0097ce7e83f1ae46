use super::AppState;
use crate::database::RunSummary;
use crate::error::AppError;
use crate::worker::WorkerSlot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Scheduler snapshot plus job counts from the store
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    /// "processing" while any slot is busy, otherwise "idle".
    pub status: String,
    pub concurrency: usize,
    pub slots: Vec<SlotStatus>,
    pub summary: RunSummary,
    pub last_activity: Option<DateTime<Utc>>,
    pub job_counts: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    #[serde(flatten)]
    pub slot: WorkerSlot,
    pub elapsed_seconds: i64,
}

/// GET /worker/status -> get_worker_status command
pub async fn get_worker_status(state: &AppState) -> Result<WorkerStatus, AppError> {
    let ws = state.scheduler.status().await;
    let now = Utc::now();

    let job_counts = state
        .db
        .count_jobs_by_status()?
        .into_iter()
        .map(|(status, count)| (status.to_string(), count))
        .collect();

    Ok(WorkerStatus {
        status: if ws.is_processing() { "processing" } else { "idle" }.to_string(),
        concurrency: ws.concurrency,
        slots: ws
            .slots
            .into_iter()
            .map(|slot| SlotStatus {
                elapsed_seconds: (now - slot.started_at).num_seconds().max(0),
                slot,
            })
            .collect(),
        summary: ws.summary,
        last_activity: ws.last_activity,
        job_counts,
    })
}

/// Returns the summary that was just closed
pub async fn reset_run_summary(state: &AppState) -> Result<RunSummary, AppError> {
    let previous = state.scheduler.reset_summary().await;
    log::info!("Run summary reset ({} submitted)", previous.submitted);
    Ok(previous)
}

//! Named, serializable mutation descriptors and the code that applies them.
//!
//! Every change to the store is one `WriteAction`. The writer service applies
//! each action inside its own transaction via [`apply`]; an `Err` from
//! `apply` means the transaction is dropped and rolled back.

use super::models::*;
use super::get_job_with;
use crate::error::AppError;
use rusqlite::{params, ErrorCode, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WriteAction {
    CreateJob {
        job_id: String,
        episode_ref: String,
        priority: i32,
        force: bool,
    },
    StartJob {
        job_id: String,
    },
    UpdateJobProgress {
        job_id: String,
        step: i32,
        step_name: String,
        progress: i32,
    },
    FinishJob {
        job_id: String,
        outcome: JobOutcome,
    },
    CancelJob {
        job_id: String,
    },
    /// Startup recovery for jobs left `running` by a previous process.
    FailInterruptedJobs,
    SetEpisodeSource {
        episode_ref: String,
        source_path: String,
        fingerprint: String,
    },
    AppendSegments {
        episode_ref: String,
        first_seq: i64,
        segments: Vec<NewSegment>,
    },
    BeginModelCall {
        job_id: Option<String>,
        episode_ref: String,
        kind: ModelCallKind,
        model_name: String,
        range: Option<SegmentRange>,
        prompt: Option<String>,
    },
    RecordModelCallRetry {
        call_id: i64,
        attempts: u32,
        error: String,
    },
    CompleteModelCall {
        call_id: i64,
        status: ModelCallStatus,
        attempts: u32,
        response: Option<String>,
        error: Option<String>,
    },
    InsertIdentifications {
        call_id: i64,
        episode_ref: String,
        identifications: Vec<NewIdentification>,
    },
    SwapEpisodeOutput {
        episode_ref: String,
        job_id: String,
        output_path: String,
        fingerprint: Option<String>,
        duration: f64,
    },
    SetEpisodePinned {
        episode_ref: String,
        pinned: bool,
    },
    /// Remove terminal jobs. Fails without effect if any listed job is active.
    ///
    /// With `finished_before`, a job is removed only if it still finished
    /// before that timestamp and its episode is not pinned; others are kept.
    DeleteJobs {
        job_ids: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finished_before: Option<String>,
    },
    /// Remove an episode's segments, identifications and model calls once no
    /// job references it.
    PurgeEpisodeData {
        episode_ref: String,
    },
}

impl WriteAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateJob { .. } => "create_job",
            Self::StartJob { .. } => "start_job",
            Self::UpdateJobProgress { .. } => "update_job_progress",
            Self::FinishJob { .. } => "finish_job",
            Self::CancelJob { .. } => "cancel_job",
            Self::FailInterruptedJobs => "fail_interrupted_jobs",
            Self::SetEpisodeSource { .. } => "set_episode_source",
            Self::AppendSegments { .. } => "append_segments",
            Self::BeginModelCall { .. } => "begin_model_call",
            Self::RecordModelCallRetry { .. } => "record_model_call_retry",
            Self::CompleteModelCall { .. } => "complete_model_call",
            Self::InsertIdentifications { .. } => "insert_identifications",
            Self::SwapEpisodeOutput { .. } => "swap_episode_output",
            Self::SetEpisodePinned { .. } => "set_episode_pinned",
            Self::DeleteJobs { .. } => "delete_jobs",
            Self::PurgeEpisodeData { .. } => "purge_episode_data",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ActionOutcome {
    Applied,
    Rows { count: usize },
    JobCreated { job_id: String },
    /// `status` is `cancelled` when the job was still queued, `running` when
    /// only the cancel flag was raised.
    CancelRequested { status: JobStatus },
    ModelCallStarted { call_id: i64 },
    OutputSwapped { previous: Option<String> },
    JobsDeleted { job_ids: Vec<String> },
}

impl ActionOutcome {
    pub fn rows(&self) -> usize {
        match self {
            Self::Rows { count } => *count,
            Self::JobsDeleted { job_ids } => job_ids.len(),
            _ => 0,
        }
    }
}

/// Apply one action inside `tx`. The caller commits on `Ok`.
pub fn apply(tx: &Transaction<'_>, action: &WriteAction) -> Result<ActionOutcome, AppError> {
    let now = now_timestamp();
    match action {
        WriteAction::CreateJob {
            job_id,
            episode_ref,
            priority,
            force,
        } => create_job(tx, job_id, episode_ref, *priority, *force, &now),

        WriteAction::StartJob { job_id } => {
            let count = tx.execute(
                "UPDATE jobs SET status = 'running', started_at = ?1, updated_at = ?1,
                        step = 0, step_name = 'preparing', progress = 0
                 WHERE id = ?2 AND status = 'queued'",
                params![now, job_id],
            )?;
            expect_transition(tx, job_id, count, JobStatus::Running)?;
            Ok(ActionOutcome::Applied)
        }

        WriteAction::UpdateJobProgress {
            job_id,
            step,
            step_name,
            progress,
        } => {
            let count = tx.execute(
                "UPDATE jobs SET step = ?1, step_name = ?2, progress = ?3, updated_at = ?4
                 WHERE id = ?5 AND status = 'running'",
                params![step, step_name, (*progress).clamp(0, 100), now, job_id],
            )?;
            expect_transition(tx, job_id, count, JobStatus::Running)?;
            Ok(ActionOutcome::Applied)
        }

        WriteAction::FinishJob { job_id, outcome } => {
            let status = outcome.status();
            let count = tx.execute(
                "UPDATE jobs SET status = ?1,
                        error_message = ?2,
                        progress = CASE WHEN ?1 = 'completed' THEN 100 ELSE progress END,
                        step_name = CASE WHEN ?1 = 'completed' THEN 'done' ELSE step_name END,
                        finished_at = ?3, updated_at = ?3
                 WHERE id = ?4 AND status = 'running'",
                params![status, outcome.message(), now, job_id],
            )?;
            expect_transition(tx, job_id, count, status)?;
            Ok(ActionOutcome::Applied)
        }

        WriteAction::CancelJob { job_id } => cancel_job(tx, job_id, &now),

        WriteAction::FailInterruptedJobs => {
            let count = tx.execute(
                "UPDATE jobs SET status = 'failed',
                        error_message = 'interrupted: service stopped while the job was running',
                        finished_at = ?1, updated_at = ?1
                 WHERE status = 'running'",
                params![now],
            )?;
            Ok(ActionOutcome::Rows { count })
        }

        WriteAction::SetEpisodeSource {
            episode_ref,
            source_path,
            fingerprint,
        } => {
            let count = tx.execute(
                "UPDATE episodes SET source_path = ?1, source_fingerprint = ?2, updated_at = ?3
                 WHERE episode_ref = ?4",
                params![source_path, fingerprint, now, episode_ref],
            )?;
            if count == 0 {
                return Err(AppError::NotFound(format!("episode {}", episode_ref)));
            }
            Ok(ActionOutcome::Applied)
        }

        WriteAction::AppendSegments {
            episode_ref,
            first_seq,
            segments,
        } => append_segments(tx, episode_ref, *first_seq, segments),

        WriteAction::BeginModelCall {
            job_id,
            episode_ref,
            kind,
            model_name,
            range,
            prompt,
        } => {
            tx.execute(
                "INSERT INTO model_calls (job_id, episode_ref, kind, model_name, status,
                        first_seq, last_seq, attempts, prompt, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, 0, ?7, ?8, ?8)",
                params![
                    job_id,
                    episode_ref,
                    kind,
                    model_name,
                    range.map(|r| r.first),
                    range.map(|r| r.last),
                    prompt,
                    now
                ],
            )?;
            Ok(ActionOutcome::ModelCallStarted {
                call_id: tx.last_insert_rowid(),
            })
        }

        WriteAction::RecordModelCallRetry {
            call_id,
            attempts,
            error,
        } => {
            let count = tx.execute(
                "UPDATE model_calls SET attempts = MAX(attempts, ?1), error_message = ?2,
                        updated_at = ?3
                 WHERE id = ?4 AND status = 'pending'",
                params![attempts, error, now, call_id],
            )?;
            expect_pending_call(tx, *call_id, count)?;
            Ok(ActionOutcome::Applied)
        }

        WriteAction::CompleteModelCall {
            call_id,
            status,
            attempts,
            response,
            error,
        } => {
            if *status == ModelCallStatus::Pending {
                return Err(AppError::InvalidTransition(
                    "a model call cannot be completed as pending".into(),
                ));
            }
            let count = tx.execute(
                "UPDATE model_calls SET status = ?1, attempts = MAX(attempts, ?2),
                        response = ?3, error_message = COALESCE(?4, error_message),
                        updated_at = ?5
                 WHERE id = ?6 AND status = 'pending'",
                params![status, attempts, response, error, now, call_id],
            )?;
            expect_pending_call(tx, *call_id, count)?;
            Ok(ActionOutcome::Applied)
        }

        WriteAction::InsertIdentifications {
            call_id,
            episode_ref,
            identifications,
        } => insert_identifications(tx, *call_id, episode_ref, identifications, &now),

        WriteAction::SwapEpisodeOutput {
            episode_ref,
            job_id,
            output_path,
            fingerprint,
            duration,
        } => {
            let previous: Option<String> = tx
                .query_row(
                    "SELECT output_path FROM episodes WHERE episode_ref = ?",
                    params![episode_ref],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| AppError::NotFound(format!("episode {}", episode_ref)))?;
            let count = tx.execute(
                "UPDATE jobs SET output_path = ?1, updated_at = ?2
                 WHERE id = ?3 AND episode_ref = ?4 AND status = 'running'",
                params![output_path, now, job_id, episode_ref],
            )?;
            expect_transition(tx, job_id, count, JobStatus::Running)?;
            tx.execute(
                "UPDATE episodes SET output_path = ?1, output_fingerprint = ?2,
                        output_duration = ?3, updated_at = ?4
                 WHERE episode_ref = ?5",
                params![output_path, fingerprint, duration, now, episode_ref],
            )?;
            Ok(ActionOutcome::OutputSwapped { previous })
        }

        WriteAction::SetEpisodePinned {
            episode_ref,
            pinned,
        } => {
            tx.execute(
                "INSERT INTO episodes (episode_ref, pinned, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(episode_ref) DO UPDATE SET pinned = ?2, updated_at = ?3",
                params![episode_ref, *pinned as i32, now],
            )?;
            Ok(ActionOutcome::Applied)
        }

        WriteAction::DeleteJobs {
            job_ids,
            finished_before,
        } => {
            let mut deleted = Vec::new();
            for job_id in job_ids {
                let status: Option<JobStatus> = tx
                    .query_row(
                        "SELECT status FROM jobs WHERE id = ?",
                        params![job_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                match status {
                    None => continue,
                    Some(s) if !s.is_terminal() => {
                        return Err(AppError::InvalidTransition(format!(
                            "job {} is {} and cannot be removed",
                            job_id, s
                        )));
                    }
                    Some(_) => {}
                }
                let removed = match finished_before {
                    None => tx.execute("DELETE FROM jobs WHERE id = ?", params![job_id])?,
                    Some(cutoff) => tx.execute(
                        "DELETE FROM jobs
                         WHERE id = ?1
                           AND finished_at IS NOT NULL
                           AND finished_at < ?2
                           AND episode_ref NOT IN (SELECT episode_ref FROM episodes WHERE pinned = 1)",
                        params![job_id, cutoff],
                    )?,
                };
                if removed > 0 {
                    deleted.push(job_id.clone());
                }
            }
            Ok(ActionOutcome::JobsDeleted { job_ids: deleted })
        }

        WriteAction::PurgeEpisodeData { episode_ref } => purge_episode(tx, episode_ref),
    }
}

fn create_job(
    tx: &Transaction<'_>,
    job_id: &str,
    episode_ref: &str,
    priority: i32,
    force: bool,
    now: &str,
) -> Result<ActionOutcome, AppError> {
    if episode_ref.trim().is_empty() {
        return Err(AppError::InputData("episode reference is empty".into()));
    }

    let existing: Option<String> = tx
        .query_row(
            "SELECT id FROM jobs WHERE episode_ref = ? AND status IN ('queued', 'running')",
            params![episode_ref],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(existing) = existing {
        return Err(AppError::Conflict(format!(
            "already in progress: episode {} has active job {}",
            episode_ref, existing
        )));
    }

    tx.execute(
        "INSERT INTO episodes (episode_ref, created_at, updated_at) VALUES (?1, ?2, ?2)
         ON CONFLICT(episode_ref) DO NOTHING",
        params![episode_ref, now],
    )?;

    let inserted = tx.execute(
        "INSERT INTO jobs (id, episode_ref, priority, status, step, step_name, progress,
                force, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'queued', 0, 'queued', 0, ?4, ?5, ?5)",
        params![job_id, episode_ref, priority, force as i32, now],
    );
    match inserted {
        Ok(_) => Ok(ActionOutcome::JobCreated {
            job_id: job_id.to_string(),
        }),
        Err(rusqlite::Error::SqliteFailure(e, msg)) if e.code == ErrorCode::ConstraintViolation => {
            Err(AppError::Conflict(format!(
                "already in progress: {}",
                msg.unwrap_or_else(|| episode_ref.to_string())
            )))
        }
        Err(e) => Err(e.into()),
    }
}

fn cancel_job(tx: &Transaction<'_>, job_id: &str, now: &str) -> Result<ActionOutcome, AppError> {
    let job = get_job_with(tx, job_id)?
        .ok_or_else(|| AppError::NotFound(format!("job {}", job_id)))?;
    match job.status {
        JobStatus::Queued => {
            tx.execute(
                "UPDATE jobs SET status = 'cancelled', cancel_requested = 1,
                        finished_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND status = 'queued'",
                params![now, job_id],
            )?;
            Ok(ActionOutcome::CancelRequested {
                status: JobStatus::Cancelled,
            })
        }
        JobStatus::Running => {
            tx.execute(
                "UPDATE jobs SET cancel_requested = 1, updated_at = ?1 WHERE id = ?2",
                params![now, job_id],
            )?;
            Ok(ActionOutcome::CancelRequested {
                status: JobStatus::Running,
            })
        }
        terminal => Err(AppError::AlreadyTerminal(format!(
            "job {} is {}",
            job_id, terminal
        ))),
    }
}

fn append_segments(
    tx: &Transaction<'_>,
    episode_ref: &str,
    first_seq: i64,
    segments: &[NewSegment],
) -> Result<ActionOutcome, AppError> {
    let (count, max_seq): (i64, i64) = tx.query_row(
        "SELECT COUNT(*), COALESCE(MAX(seq), -1) FROM transcript_segments WHERE episode_ref = ?",
        params![episode_ref],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    if count != max_seq + 1 || first_seq != count {
        return Err(AppError::Conflict(format!(
            "segments for {} must continue at {}, got {}",
            episode_ref, count, first_seq
        )));
    }

    let mut stmt = tx.prepare(
        "INSERT INTO transcript_segments (episode_ref, seq, start_time, end_time, text)
         VALUES (?, ?, ?, ?, ?)",
    )?;
    for (offset, segment) in segments.iter().enumerate() {
        let valid = segment.start_time.is_finite()
            && segment.end_time.is_finite()
            && segment.start_time >= 0.0
            && segment.end_time >= segment.start_time;
        if !valid {
            return Err(AppError::InputData(format!(
                "segment {} has invalid bounds [{}, {}]",
                first_seq + offset as i64,
                segment.start_time,
                segment.end_time
            )));
        }
        stmt.execute(params![
            episode_ref,
            first_seq + offset as i64,
            segment.start_time,
            segment.end_time,
            segment.text
        ])?;
    }
    Ok(ActionOutcome::Rows {
        count: segments.len(),
    })
}

fn insert_identifications(
    tx: &Transaction<'_>,
    call_id: i64,
    episode_ref: &str,
    identifications: &[NewIdentification],
    now: &str,
) -> Result<ActionOutcome, AppError> {
    let call: Option<(String, ModelCallKind, Option<i64>, Option<i64>)> = tx
        .query_row(
            "SELECT episode_ref, kind, first_seq, last_seq FROM model_calls WHERE id = ?",
            params![call_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;
    let (call_episode, kind, first, last) =
        call.ok_or_else(|| AppError::NotFound(format!("model call {}", call_id)))?;
    if call_episode != episode_ref || kind != ModelCallKind::Classification {
        return Err(AppError::InputData(format!(
            "model call {} is not a classification call for {}",
            call_id, episode_ref
        )));
    }
    let range = first.zip(last).map(|(f, l)| SegmentRange::new(f, l));

    let mut stmt = tx.prepare(
        "INSERT INTO identifications (episode_ref, seq, model_call_id, label, confidence, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )?;
    for ident in identifications {
        if let Some(c) = ident.confidence {
            if !c.is_finite() || !(0.0..=1.0).contains(&c) {
                return Err(AppError::InputData(format!(
                    "confidence {} for segment {} is outside [0, 1]",
                    c, ident.seq
                )));
            }
        }
        if let Some(r) = range {
            if !r.contains(ident.seq) {
                return Err(AppError::InputData(format!(
                    "segment {} is outside model call {} range {}..={}",
                    ident.seq, call_id, r.first, r.last
                )));
            }
        }
        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM transcript_segments WHERE episode_ref = ? AND seq = ?)",
            params![episode_ref, ident.seq],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(AppError::NotFound(format!(
                "segment {} of {}",
                ident.seq, episode_ref
            )));
        }
        stmt.execute(params![
            episode_ref,
            ident.seq,
            call_id,
            ident.label,
            ident.confidence,
            now
        ])?;
    }
    Ok(ActionOutcome::Rows {
        count: identifications.len(),
    })
}

fn purge_episode(tx: &Transaction<'_>, episode_ref: &str) -> Result<ActionOutcome, AppError> {
    let remaining: i64 = tx.query_row(
        "SELECT COUNT(*) FROM jobs WHERE episode_ref = ?",
        params![episode_ref],
        |row| row.get(0),
    )?;
    if remaining > 0 {
        return Err(AppError::Conflict(format!(
            "episode {} still has {} job(s)",
            episode_ref, remaining
        )));
    }

    let pinned: bool = tx
        .query_row(
            "SELECT pinned FROM episodes WHERE episode_ref = ?",
            params![episode_ref],
            |row| Ok(row.get::<_, i32>(0)? == 1),
        )
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("episode {}", episode_ref)))?;
    if pinned {
        return Err(AppError::Conflict(format!("episode {} is pinned", episode_ref)));
    }

    // The episode row and its current output pointer stay
    let mut count = 0;
    for table in ["identifications", "model_calls", "transcript_segments"] {
        count += tx.execute(
            &format!("DELETE FROM {} WHERE episode_ref = ?", table),
            params![episode_ref],
        )?;
    }
    Ok(ActionOutcome::Rows { count })
}

/// Turn a zero-row guarded update into NotFound / InvalidTransition.
fn expect_transition(
    tx: &Transaction<'_>,
    job_id: &str,
    count: usize,
    target: JobStatus,
) -> Result<(), AppError> {
    if count > 0 {
        return Ok(());
    }
    let current = get_job_with(tx, job_id)?;
    match current {
        None => Err(AppError::NotFound(format!("job {}", job_id))),
        Some(job) => Err(AppError::InvalidTransition(format!(
            "job {} is {}, cannot apply {} update",
            job_id, job.status, target
        ))),
    }
}

fn expect_pending_call(tx: &Transaction<'_>, call_id: i64, count: usize) -> Result<(), AppError> {
    if count > 0 {
        return Ok(());
    }
    let status: Option<ModelCallStatus> = tx
        .query_row(
            "SELECT status FROM model_calls WHERE id = ?",
            params![call_id],
            |row| row.get(0),
        )
        .optional()?;
    match status {
        None => Err(AppError::NotFound(format!("model call {}", call_id))),
        Some(s) => Err(AppError::InvalidTransition(format!(
            "model call {} is already {}",
            call_id,
            s.as_str()
        ))),
    }
}

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Timestamp format used for every stored time: fixed-width RFC 3339 with
/// millisecond precision, so lexical order equals chronological order.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_timestamp() -> String {
    timestamp(Utc::now())
}

// ============================================================================
// Jobs
// ============================================================================

/// Job lifecycle: `queued → running → {completed, failed, skipped, cancelled}`,
/// plus `queued → cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

impl ToSql for JobStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for JobStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// How a running job ended. Each variant maps to exactly one terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    Failed { error: String },
    Skipped { reason: String },
    Cancelled,
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Completed => JobStatus::Completed,
            Self::Failed { .. } => JobStatus::Failed,
            Self::Skipped { .. } => JobStatus::Skipped,
            Self::Cancelled => JobStatus::Cancelled,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Failed { error } => Some(error),
            Self::Skipped { reason } => Some(reason),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Creation order; breaks priority ties.
    pub seq: i64,
    pub episode_ref: String,
    pub priority: i32,
    pub status: JobStatus,
    pub step: i32,
    pub step_name: String,
    pub progress: i32,
    pub force: bool,
    pub cancel_requested: bool,
    pub error_message: Option<String>,
    pub output_path: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub updated_at: String,
}

/// Externally visible job status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSnapshot {
    pub job_id: String,
    pub episode_ref: String,
    pub priority: i32,
    pub status: JobStatus,
    pub step: i32,
    pub step_name: String,
    pub progress_percentage: i32,
    pub error: Option<String>,
    pub output_path: Option<String>,
    pub created_at: String,
    pub finished_at: Option<String>,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            episode_ref: job.episode_ref.clone(),
            priority: job.priority,
            status: job.status,
            step: job.step,
            step_name: job.step_name.clone(),
            progress_percentage: job.progress,
            error: job.error_message.clone(),
            output_path: job.output_path.clone(),
            created_at: job.created_at.clone(),
            finished_at: job.finished_at.clone(),
        }
    }
}

// ============================================================================
// Episodes
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub episode_ref: String,
    /// Local audio the pipeline reads from.
    pub source_path: Option<String>,
    pub source_fingerprint: Option<String>,
    /// Current ad-free output; swapped only after a successful splice.
    pub output_path: Option<String>,
    /// Source fingerprint the current output was produced from.
    pub output_fingerprint: Option<String>,
    pub output_duration: Option<f64>,
    pub pinned: bool,
    pub updated_at: String,
}

// ============================================================================
// Transcript
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub episode_ref: String,
    pub seq: i64,
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
}

impl TranscriptSegment {
    pub fn duration(&self) -> f64 {
        (self.end_time - self.start_time).max(0.0)
    }
}

/// A span produced by the transcriber, before it is numbered and stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSegment {
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
}

/// Inclusive range of segment sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRange {
    pub first: i64,
    pub last: i64,
}

impl SegmentRange {
    pub fn new(first: i64, last: i64) -> Self {
        Self { first, last }
    }

    pub fn contains(&self, seq: i64) -> bool {
        seq >= self.first && seq <= self.last
    }

    pub fn len(&self) -> usize {
        if self.last < self.first {
            0
        } else {
            (self.last - self.first + 1) as usize
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Model calls and identifications
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCallKind {
    Transcription,
    Classification,
}

impl ModelCallKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transcription => "transcription",
            Self::Classification => "classification",
        }
    }
}

impl ToSql for ModelCallKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ModelCallKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "transcription" => Ok(Self::Transcription),
            "classification" => Ok(Self::Classification),
            other => Err(FromSqlError::Other(
                format!("unknown model call kind '{}'", other).into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelCallStatus {
    Pending,
    Succeeded,
    Failed,
}

impl ModelCallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl ToSql for ModelCallStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ModelCallStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "pending" => Ok(Self::Pending),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(FromSqlError::Other(
                format!("unknown model call status '{}'", other).into(),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCall {
    pub id: i64,
    pub job_id: Option<String>,
    pub episode_ref: String,
    pub kind: ModelCallKind,
    pub model_name: String,
    pub status: ModelCallStatus,
    pub first_seq: Option<i64>,
    pub last_seq: Option<i64>,
    pub attempts: i32,
    pub error_message: Option<String>,
    pub prompt: Option<String>,
    pub response: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    Ad,
    Content,
}

impl Label {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ad => "ad",
            Self::Content => "content",
        }
    }
}

impl ToSql for Label {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Label {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "ad" => Ok(Self::Ad),
            "content" => Ok(Self::Content),
            other => Err(FromSqlError::Other(
                format!("unknown label '{}'", other).into(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identification {
    pub episode_ref: String,
    pub seq: i64,
    pub model_call_id: i64,
    pub label: Label,
    pub confidence: Option<f64>,
}

/// A label returned by the classifier for one segment of its range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewIdentification {
    pub seq: i64,
    pub label: Label,
    pub confidence: Option<f64>,
}

// ============================================================================
// Run summary
// ============================================================================

/// Counters for the current scheduler epoch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub epoch_started_at: String,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub cancelled: u64,
}

impl Default for RunSummary {
    fn default() -> Self {
        Self {
            epoch_started_at: now_timestamp(),
            submitted: 0,
            completed: 0,
            failed: 0,
            skipped: 0,
            cancelled: 0,
        }
    }
}

impl RunSummary {
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Skipped => self.skipped += 1,
            JobStatus::Cancelled => self.cancelled += 1,
            JobStatus::Queued | JobStatus::Running => {}
        }
    }
}

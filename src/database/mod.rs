pub mod actions;
pub mod models;

#[cfg(test)]
mod tests;

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub use models::*;

/// Read side of the store.
///
/// The connection is opened with `query_only`, so nothing holding a
/// `Database` can mutate the store; every write goes through the writer
/// service (`crate::writer`).
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

/// Open the single writable connection and make sure the schema exists.
///
/// Only the writer service calls this.
pub(crate) fn open_writable(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;

    // Enable WAL mode so readers never wait on the writer
    conn.execute_batch(
        "
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        PRAGMA cache_size=10000;
        PRAGMA temp_store=MEMORY;
    ",
    )?;
    conn.busy_timeout(Duration::from_secs(5))?;

    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS episodes (
            episode_ref TEXT PRIMARY KEY,
            source_path TEXT,
            source_fingerprint TEXT,
            output_path TEXT,
            output_fingerprint TEXT,
            output_duration REAL,
            pinned INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS jobs (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            episode_ref TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'queued'
                CHECK (status IN ('queued','running','completed','failed','skipped','cancelled')),
            step INTEGER NOT NULL DEFAULT 0,
            step_name TEXT NOT NULL DEFAULT 'queued',
            progress INTEGER NOT NULL DEFAULT 0 CHECK (progress BETWEEN 0 AND 100),
            force INTEGER NOT NULL DEFAULT 0,
            cancel_requested INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            output_path TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (episode_ref) REFERENCES episodes(episode_ref)
        );

        -- At most one non-terminal job per episode
        CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_one_active_per_episode
            ON jobs(episode_ref) WHERE status IN ('queued', 'running');
        CREATE INDEX IF NOT EXISTS idx_jobs_queue ON jobs(status, priority, seq);
        CREATE INDEX IF NOT EXISTS idx_jobs_finished ON jobs(status, finished_at);

        CREATE TABLE IF NOT EXISTS transcript_segments (
            episode_ref TEXT NOT NULL,
            seq INTEGER NOT NULL CHECK (seq >= 0),
            start_time REAL NOT NULL,
            end_time REAL NOT NULL,
            text TEXT NOT NULL,
            PRIMARY KEY (episode_ref, seq),
            FOREIGN KEY (episode_ref) REFERENCES episodes(episode_ref)
        );

        CREATE TRIGGER IF NOT EXISTS transcript_segments_immutable
            BEFORE UPDATE ON transcript_segments
        BEGIN
            SELECT RAISE(ABORT, 'transcript segments are immutable');
        END;

        -- Every external model invocation, append-only
        CREATE TABLE IF NOT EXISTS model_calls (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT,
            episode_ref TEXT NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('transcription','classification')),
            model_name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending','succeeded','failed')),
            first_seq INTEGER,
            last_seq INTEGER,
            attempts INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            prompt TEXT,
            response TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (episode_ref) REFERENCES episodes(episode_ref)
        );

        CREATE INDEX IF NOT EXISTS idx_model_calls_job ON model_calls(job_id);
        CREATE INDEX IF NOT EXISTS idx_model_calls_episode ON model_calls(episode_ref);

        CREATE TABLE IF NOT EXISTS identifications (
            episode_ref TEXT NOT NULL,
            seq INTEGER NOT NULL,
            model_call_id INTEGER NOT NULL,
            label TEXT NOT NULL CHECK (label IN ('ad','content')),
            confidence REAL
                CHECK (confidence IS NULL OR (confidence >= 0.0 AND confidence <= 1.0)),
            created_at TEXT NOT NULL,
            PRIMARY KEY (episode_ref, seq, model_call_id),
            FOREIGN KEY (episode_ref, seq) REFERENCES transcript_segments(episode_ref, seq),
            FOREIGN KEY (model_call_id) REFERENCES model_calls(id)
        );

        CREATE INDEX IF NOT EXISTS idx_identifications_call ON identifications(model_call_id);
    "#,
    )?;
    Ok(())
}

const JOB_COLUMNS: &str = "id, seq, episode_ref, priority, status, step, step_name, progress, \
     force, cancel_requested, error_message, output_path, created_at, started_at, \
     finished_at, updated_at";

pub(crate) fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        seq: row.get(1)?,
        episode_ref: row.get(2)?,
        priority: row.get(3)?,
        status: row.get(4)?,
        step: row.get(5)?,
        step_name: row.get(6)?,
        progress: row.get(7)?,
        force: row.get::<_, i32>(8)? == 1,
        cancel_requested: row.get::<_, i32>(9)? == 1,
        error_message: row.get(10)?,
        output_path: row.get(11)?,
        created_at: row.get(12)?,
        started_at: row.get(13)?,
        finished_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

pub(crate) fn get_job_with(conn: &Connection, job_id: &str) -> rusqlite::Result<Option<Job>> {
    conn.query_row(
        &format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS),
        params![job_id],
        job_from_row,
    )
    .optional()
}

const MODEL_CALL_COLUMNS: &str = "id, job_id, episode_ref, kind, model_name, status, first_seq, \
     last_seq, attempts, error_message, prompt, response, created_at, updated_at";

fn model_call_from_row(row: &Row<'_>) -> rusqlite::Result<ModelCall> {
    Ok(ModelCall {
        id: row.get(0)?,
        job_id: row.get(1)?,
        episode_ref: row.get(2)?,
        kind: row.get(3)?,
        model_name: row.get(4)?,
        status: row.get(5)?,
        first_seq: row.get(6)?,
        last_seq: row.get(7)?,
        attempts: row.get(8)?,
        error_message: row.get(9)?,
        prompt: row.get(10)?,
        response: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

impl Database {
    /// Open a read-only handle. The schema must already exist, i.e. the
    /// writer service has been started on this path.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA query_only = ON;")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: db_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // Job queries
    // =========================================================================

    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let conn = self.conn();
        Ok(get_job_with(&conn, job_id)?)
    }

    /// Jobs ordered running-first, then queued by priority (ties by creation
    /// order), then terminal by recency.
    pub fn list_jobs(&self, active_only: bool, limit: i64) -> Result<Vec<Job>> {
        let conn = self.conn();
        let where_clause = if active_only {
            "WHERE status IN ('queued', 'running')"
        } else {
            ""
        };
        let sql = format!(
            "SELECT {} FROM jobs {}
             ORDER BY
                CASE status WHEN 'running' THEN 0 WHEN 'queued' THEN 1 ELSE 2 END,
                CASE WHEN status = 'running' THEN started_at END ASC,
                CASE WHEN status = 'queued' THEN priority END ASC,
                CASE WHEN status = 'queued' THEN seq END ASC,
                COALESCE(finished_at, updated_at) DESC,
                seq DESC
             LIMIT ?",
            JOB_COLUMNS, where_clause
        );
        let mut stmt = conn.prepare(&sql)?;
        let jobs = stmt
            .query_map(params![limit], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Highest-priority queued job: lowest priority value, then earliest created.
    pub fn next_queued_job(&self) -> Result<Option<Job>> {
        let conn = self.conn();
        let job = conn
            .query_row(
                &format!(
                    "SELECT {} FROM jobs WHERE status = 'queued'
                     ORDER BY priority ASC, seq ASC LIMIT 1",
                    JOB_COLUMNS
                ),
                [],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    pub fn active_job_for_episode(&self, episode_ref: &str) -> Result<Option<Job>> {
        let conn = self.conn();
        let job = conn
            .query_row(
                &format!(
                    "SELECT {} FROM jobs
                     WHERE episode_ref = ? AND status IN ('queued', 'running')",
                    JOB_COLUMNS
                ),
                params![episode_ref],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    pub fn count_jobs(&self) -> Result<i64> {
        let conn = self.conn();
        Ok(conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?)
    }

    pub fn count_jobs_for_episode(&self, episode_ref: &str) -> Result<i64> {
        let conn = self.conn();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE episode_ref = ?",
            params![episode_ref],
            |row| row.get(0),
        )?)
    }

    /// Job counts keyed by status, for the stats view.
    pub fn count_jobs_by_status(&self) -> Result<Vec<(JobStatus, i64)>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status ORDER BY status")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(counts)
    }

    /// Terminal jobs finished before `cutoff` whose episode is not pinned.
    pub fn cleanup_candidates(&self, cutoff: &str) -> Result<Vec<Job>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM jobs
             WHERE status IN ('completed', 'failed', 'skipped', 'cancelled')
               AND finished_at IS NOT NULL
               AND finished_at < ?
               AND episode_ref NOT IN (SELECT episode_ref FROM episodes WHERE pinned = 1)
             ORDER BY finished_at ASC",
            JOB_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let jobs = stmt
            .query_map(params![cutoff], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    // =========================================================================
    // Episode queries
    // =========================================================================

    pub fn get_episode(&self, episode_ref: &str) -> Result<Option<Episode>> {
        let conn = self.conn();
        let episode = conn
            .query_row(
                "SELECT episode_ref, source_path, source_fingerprint, output_path,
                        output_fingerprint, output_duration, pinned, updated_at
                 FROM episodes WHERE episode_ref = ?",
                params![episode_ref],
                |row| {
                    Ok(Episode {
                        episode_ref: row.get(0)?,
                        source_path: row.get(1)?,
                        source_fingerprint: row.get(2)?,
                        output_path: row.get(3)?,
                        output_fingerprint: row.get(4)?,
                        output_duration: row.get(5)?,
                        pinned: row.get::<_, i32>(6)? == 1,
                        updated_at: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(episode)
    }

    // =========================================================================
    // Transcript and classification queries
    // =========================================================================

    pub fn get_segments(&self, episode_ref: &str) -> Result<Vec<TranscriptSegment>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT episode_ref, seq, start_time, end_time, text
             FROM transcript_segments WHERE episode_ref = ? ORDER BY seq ASC",
        )?;
        let segments = stmt
            .query_map(params![episode_ref], |row| {
                Ok(TranscriptSegment {
                    episode_ref: row.get(0)?,
                    seq: row.get(1)?,
                    start_time: row.get(2)?,
                    end_time: row.get(3)?,
                    text: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(segments)
    }

    pub fn count_segments(&self, episode_ref: &str) -> Result<i64> {
        let conn = self.conn();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM transcript_segments WHERE episode_ref = ?",
            params![episode_ref],
            |row| row.get(0),
        )?)
    }

    pub fn get_identifications(&self, episode_ref: &str) -> Result<Vec<Identification>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT episode_ref, seq, model_call_id, label, confidence
             FROM identifications WHERE episode_ref = ?
             ORDER BY seq ASC, model_call_id ASC",
        )?;
        let items = stmt
            .query_map(params![episode_ref], |row| {
                Ok(Identification {
                    episode_ref: row.get(0)?,
                    seq: row.get(1)?,
                    model_call_id: row.get(2)?,
                    label: row.get(3)?,
                    confidence: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Sequence numbers that already carry at least one identification.
    pub fn identified_seqs(&self, episode_ref: &str) -> Result<HashSet<i64>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT DISTINCT seq FROM identifications WHERE episode_ref = ?")?;
        let seqs = stmt
            .query_map(params![episode_ref], |row| row.get::<_, i64>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(seqs)
    }

    pub fn get_model_call(&self, id: i64) -> Result<Option<ModelCall>> {
        let conn = self.conn();
        let call = conn
            .query_row(
                &format!("SELECT {} FROM model_calls WHERE id = ?", MODEL_CALL_COLUMNS),
                params![id],
                model_call_from_row,
            )
            .optional()?;
        Ok(call)
    }

    pub fn get_model_calls_for_job(&self, job_id: &str) -> Result<Vec<ModelCall>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM model_calls WHERE job_id = ? ORDER BY id ASC",
            MODEL_CALL_COLUMNS
        ))?;
        let calls = stmt
            .query_map(params![job_id], model_call_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(calls)
    }

    pub fn get_model_calls_for_episode(&self, episode_ref: &str) -> Result<Vec<ModelCall>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM model_calls WHERE episode_ref = ? ORDER BY id ASC",
            MODEL_CALL_COLUMNS
        ))?;
        let calls = stmt
            .query_map(params![episode_ref], model_call_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(calls)
    }
}

//! Exclusive ownership of a store by one writer.
//!
//! The lock is a tiny SQLite file opened in exclusive locking mode. Its first
//! transaction takes an OS-level exclusive lock that is held until the
//! connection closes, and the OS drops it when the process dies, so a crash
//! never leaves a stale owner behind.

use crate::database::now_timestamp;
use crate::error::AppError;
use rusqlite::{Connection, ErrorCode};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub struct InstanceLock {
    _conn: Connection,
    path: PathBuf,
}

/// Lock file next to the database: `adsplice.db` → `adsplice.lock`.
pub fn lock_path(db_path: &Path) -> PathBuf {
    db_path.with_extension("lock")
}

impl InstanceLock {
    /// Take the lock or fail immediately with `InstanceLocked`.
    pub fn acquire(path: &Path) -> Result<Self, AppError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::ZERO)?;

        let taken = conn.execute_batch(&format!(
            "PRAGMA locking_mode = EXCLUSIVE;
             BEGIN EXCLUSIVE;
             CREATE TABLE IF NOT EXISTS owner (
                 id INTEGER PRIMARY KEY CHECK (id = 1),
                 pid INTEGER NOT NULL,
                 started_at TEXT NOT NULL
             );
             INSERT INTO owner (id, pid, started_at) VALUES (1, {pid}, '{at}')
                 ON CONFLICT(id) DO UPDATE SET pid = {pid}, started_at = '{at}';
             COMMIT;",
            pid = std::process::id(),
            at = now_timestamp(),
        ));

        match taken {
            Ok(()) => {
                log::info!("Store lock acquired: {:?}", path);
                Ok(Self {
                    _conn: conn,
                    path: path.to_path_buf(),
                })
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                Err(AppError::InstanceLocked(format!("{:?} is held", path)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        log::debug!("Store lock released: {:?}", self.path);
    }
}

//! Writer arbitration service.
//!
//! One blocking task owns the only writable SQLite connection and applies
//! `WriteAction`s one at a time, in the order they are received, each inside
//! its own transaction. Everything else talks to it through a cloneable
//! [`WriterHandle`].

pub mod changelog;
pub mod lock;

use crate::database::actions::{apply, ActionOutcome, WriteAction};
use crate::database::open_writable;
use crate::error::AppError;
use changelog::ChangeLog;
use lock::{lock_path, InstanceLock};
use rusqlite::Connection;
use std::path::Path;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

struct WriteCommand {
    action: WriteAction,
    reply: oneshot::Sender<Result<ActionOutcome, AppError>>,
}

/// Cloneable sender side of the writer queue.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriteCommand>,
}

impl WriterHandle {
    /// Submit an action and wait for its result.
    ///
    /// Fails fast with `WriterUnavailable` when the service is gone; there is
    /// no fallback write path.
    pub async fn apply(&self, action: WriteAction) -> Result<ActionOutcome, AppError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WriteCommand { action, reply })
            .await
            .map_err(|_| AppError::WriterUnavailable)?;
        rx.await.map_err(|_| AppError::WriterUnavailable)?
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct WriterService {
    _lock: InstanceLock,
    conn: Connection,
    changelog: ChangeLog,
    rx: mpsc::Receiver<WriteCommand>,
}

/// Take the store lock, open the writable connection and change log, then
/// start the service on a blocking thread. The service stops, releasing the
/// lock, once every handle is dropped.
///
/// Fails with `InstanceLocked` while another writer owns the store.
pub fn spawn_writer(
    db_path: &Path,
    changelog_path: &Path,
    capacity: usize,
) -> Result<(WriterHandle, JoinHandle<()>), AppError> {
    let lock = InstanceLock::acquire(&lock_path(db_path))?;
    let conn = open_writable(db_path)?;
    let (changelog, abandoned) = ChangeLog::open(changelog_path)?;
    if !abandoned.is_empty() {
        log::warn!(
            "Writer recovery: {} unfinished change(s) from a previous run closed as abandoned",
            abandoned.len()
        );
    }

    let (tx, rx) = mpsc::channel(capacity.max(1));
    let service = WriterService {
        _lock: lock,
        conn,
        changelog,
        rx,
    };
    let join = tokio::task::spawn_blocking(move || service.run());

    Ok((WriterHandle { tx }, join))
}

impl WriterService {
    fn run(mut self) {
        log::info!(
            "Writer service started (change log: {:?})",
            self.changelog.path()
        );
        while let Some(cmd) = self.rx.blocking_recv() {
            let result = self.handle(&cmd.action);
            // The caller may have given up waiting; the change is applied regardless
            let _ = cmd.reply.send(result);
        }
        log::info!("Writer service stopped");
    }

    fn handle(&mut self, action: &WriteAction) -> Result<ActionOutcome, AppError> {
        let started = Instant::now();
        let intent = self
            .changelog
            .intent(action)
            .map_err(|e| AppError::Arbitration(format!("change log unavailable: {}", e)))?;

        let result = self.apply_in_transaction(action);

        if let Err(e) = self.changelog.outcome(intent, result.as_ref().map(|_| ())) {
            log::error!("Failed to record outcome of change #{}: {}", intent, e);
        }

        match &result {
            Ok(_) => log::debug!(
                "Writer applied {} (#{}) in {:?}",
                action.name(),
                intent,
                started.elapsed()
            ),
            Err(e) if e.is_arbitration() => {
                log::warn!("Writer rolled back {} (#{}): {}", action.name(), intent, e)
            }
            Err(e) => log::debug!("Writer rejected {} (#{}): {}", action.name(), intent, e),
        }
        result
    }

    fn apply_in_transaction(&mut self, action: &WriteAction) -> Result<ActionOutcome, AppError> {
        let tx = self.conn.transaction().map_err(rejected)?;
        let outcome = apply(&tx, action).map_err(|e| match e {
            AppError::Database(msg) => AppError::Arbitration(msg),
            other => other,
        })?;
        tx.commit().map_err(rejected)?;
        Ok(outcome)
    }
}

fn rejected(e: rusqlite::Error) -> AppError {
    AppError::Arbitration(e.to_string())
}

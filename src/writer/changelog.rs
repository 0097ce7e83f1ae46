//! Append-only JSON-lines change log kept next to the database.
//!
//! The writer records an `intent` line before applying an action and an
//! `outcome` line after the transaction commits or rolls back. On startup any
//! intent without an outcome is reported and closed with an `abandoned` line,
//! then the file is rotated to `<name>.1`. The log also rotates whenever it
//! grows past its size limit with no intent open. Each new file starts with a
//! `checkpoint` carrying the last id handed out, so ids keep increasing.

use crate::database::actions::WriteAction;
use crate::database::now_timestamp;
use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const DEFAULT_ROTATE_BYTES: u64 = 32 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum ChangeRecord {
    Intent {
        id: u64,
        at: String,
        action: WriteAction,
    },
    Outcome {
        id: u64,
        at: String,
        applied: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Abandoned {
        id: u64,
        at: String,
    },
    /// Last id issued before this file was started.
    Checkpoint {
        id: u64,
        at: String,
    },
}

impl ChangeRecord {
    fn id(&self) -> u64 {
        match self {
            Self::Intent { id, .. }
            | Self::Outcome { id, .. }
            | Self::Abandoned { id, .. }
            | Self::Checkpoint { id, .. } => *id,
        }
    }
}

/// An intent found without a matching outcome on startup.
#[derive(Debug, Clone)]
pub struct AbandonedIntent {
    pub id: u64,
    pub action_name: String,
}

pub struct ChangeLog {
    path: PathBuf,
    out: BufWriter<File>,
    next_id: u64,
    written: u64,
    rotate_bytes: u64,
}

/// `changes.jsonl` → `changes.jsonl.1`
pub fn rotated_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".1");
    PathBuf::from(name)
}

impl ChangeLog {
    pub fn open(path: &Path) -> Result<(Self, Vec<AbandonedIntent>), AppError> {
        Self::open_with_limit(path, DEFAULT_ROTATE_BYTES)
    }

    /// Open the log, close dangling intents in the old file, and start a
    /// fresh one.
    pub fn open_with_limit(
        path: &Path,
        rotate_bytes: u64,
    ) -> Result<(Self, Vec<AbandonedIntent>), AppError> {
        let scanned = if path.exists() {
            Some(scan(path)?)
        } else {
            None
        };

        let mut last_id = 0;
        let mut dangling = Vec::new();
        if let Some(scanned) = scanned {
            last_id = scanned.last_id;
            dangling = scanned.dangling;

            let mut old = BufWriter::new(OpenOptions::new().append(true).open(path)?);
            if scanned.torn {
                old.write_all(b"\n")?;
            }
            for intent in &dangling {
                log::warn!(
                    "Change log: intent #{} ({}) has no outcome, marking abandoned",
                    intent.id,
                    intent.action_name
                );
                write_record(
                    &mut old,
                    &ChangeRecord::Abandoned {
                        id: intent.id,
                        at: now_timestamp(),
                    },
                )?;
            }
            old.flush()?;
            drop(old);
            std::fs::rename(path, rotated_path(path))?;
        }

        let changelog = Self::start(path, last_id, rotate_bytes)?;
        Ok((changelog, dangling))
    }

    /// Create an empty file headed by a checkpoint.
    fn start(path: &Path, last_id: u64, rotate_bytes: u64) -> Result<Self, AppError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut changelog = Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            next_id: last_id + 1,
            written: 0,
            rotate_bytes,
        };
        changelog.write(&ChangeRecord::Checkpoint {
            id: last_id,
            at: now_timestamp(),
        })?;
        Ok(changelog)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record an intent and return its id.
    pub fn intent(&mut self, action: &WriteAction) -> Result<u64, AppError> {
        let id = self.next_id;
        self.next_id += 1;
        self.write(&ChangeRecord::Intent {
            id,
            at: now_timestamp(),
            action: action.clone(),
        })?;
        Ok(id)
    }

    /// Record an outcome. Intents and outcomes alternate, so nothing is open
    /// afterwards and the file may be rotated.
    pub fn outcome(&mut self, id: u64, result: Result<(), &AppError>) -> Result<(), AppError> {
        self.write(&ChangeRecord::Outcome {
            id,
            at: now_timestamp(),
            applied: result.is_ok(),
            error: result.err().map(|e| e.to_string()),
        })?;
        if self.written >= self.rotate_bytes {
            self.rotate()?;
        }
        Ok(())
    }

    fn rotate(&mut self) -> Result<(), AppError> {
        self.out.flush()?;
        std::fs::rename(&self.path, rotated_path(&self.path))?;
        *self = Self::start(&self.path, self.next_id - 1, self.rotate_bytes)?;
        log::info!("Change log rotated at #{}", self.next_id - 1);
        Ok(())
    }

    fn write(&mut self, record: &ChangeRecord) -> Result<(), AppError> {
        self.written += write_record(&mut self.out, record)?;
        self.out.flush()?;
        Ok(())
    }
}

fn write_record(out: &mut impl Write, record: &ChangeRecord) -> Result<u64, AppError> {
    let line = serde_json::to_vec(record)?;
    out.write_all(&line)?;
    out.write_all(b"\n")?;
    Ok(line.len() as u64 + 1)
}

struct Scan {
    last_id: u64,
    dangling: Vec<AbandonedIntent>,
    /// The last line has no terminating newline.
    torn: bool,
}

/// Read the log as raw bytes. A crash can tear the final line anywhere,
/// including inside a multi-byte character, so lines that do not parse are
/// skipped.
fn scan(path: &Path) -> Result<Scan, AppError> {
    let content = std::fs::read(path)?;
    let torn = content.last().is_some_and(|b| *b != b'\n');
    let mut open: BTreeMap<u64, String> = BTreeMap::new();
    let mut last_id = 0;

    for (lineno, line) in content.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let record: ChangeRecord = match serde_json::from_slice(line) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("Change log line {} unreadable, skipping: {}", lineno + 1, e);
                continue;
            }
        };
        last_id = last_id.max(record.id());
        match record {
            ChangeRecord::Intent { id, action, .. } => {
                open.insert(id, action.name().to_string());
            }
            ChangeRecord::Outcome { id, .. } | ChangeRecord::Abandoned { id, .. } => {
                open.remove(&id);
            }
            ChangeRecord::Checkpoint { .. } => {}
        }
    }

    let dangling = open
        .into_iter()
        .map(|(id, action_name)| AbandonedIntent { id, action_name })
        .collect();
    Ok(Scan {
        last_id,
        dangling,
        torn,
    })
}

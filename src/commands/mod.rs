pub mod cleanup;
pub mod episodes;
pub mod jobs;
pub mod stats;

pub use cleanup::*;
pub use episodes::*;
pub use jobs::*;
pub use stats::*;

use crate::config::AppConfig;
use crate::database::Database;
use crate::worker::cleanup::CleanupSweeper;
use crate::worker::SchedulerHandle;
use crate::writer::WriterHandle;
use std::sync::Arc;

/// Everything a command needs: the read-only store, the writer, and the
/// control side of the running scheduler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub writer: WriterHandle,
    pub scheduler: SchedulerHandle,
    pub sweeper: Arc<CleanupSweeper>,
    pub config: Arc<AppConfig>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitOptions {
    /// Re-run every stage even when a current output exists.
    pub force: bool,
}

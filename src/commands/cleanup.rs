use super::AppState;
use crate::error::AppError;
use crate::worker::cleanup::{CleanupPreview, CleanupReport};

/// GET /cleanup -> preview_cleanup command
pub async fn preview_cleanup(state: &AppState) -> Result<CleanupPreview, AppError> {
    state.sweeper.preview()
}

/// POST /cleanup -> run_cleanup command
pub async fn run_cleanup(state: &AppState) -> Result<CleanupReport, AppError> {
    if !state.sweeper.is_enabled() {
        return Err(AppError::Config(
            "cleanup is disabled: set cleanup.retention_days".into(),
        ));
    }
    let report = state.sweeper.run().await?;
    log::info!(
        "Cleanup removed {} job(s), {} remaining",
        report.removed,
        report.remaining
    );
    Ok(report)
}

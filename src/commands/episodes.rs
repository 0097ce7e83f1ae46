use super::AppState;
use crate::database::actions::WriteAction;
use crate::database::{Episode, TranscriptSegment};
use crate::error::AppError;
use crate::resolver::{self, AdInterval};
use crate::worker::splice::wav_duration;
use serde::Serialize;
use std::path::Path;

/// Ad intervals of an episode as the resolver sees them right now
#[derive(Debug, Clone, Serialize)]
pub struct AdIntervalsView {
    pub episode_ref: String,
    pub intervals: Vec<AdInterval>,
    pub removed_duration: f64,
    /// Length of the local source, when one has been prepared.
    pub source_duration: Option<f64>,
    pub segment_count: usize,
    pub identification_count: usize,
}

fn require_episode(state: &AppState, episode_ref: &str) -> Result<Episode, AppError> {
    state
        .db
        .get_episode(episode_ref)?
        .ok_or_else(|| AppError::NotFound(format!("episode {}", episode_ref)))
}

/// GET /episodes/:ref -> get_episode command
pub async fn get_episode(state: &AppState, episode_ref: &str) -> Result<Episode, AppError> {
    require_episode(state, episode_ref)
}

/// GET /episodes/:ref/ads -> get_ad_intervals command
///
/// Recomputed from the stored identifications with the current resolver
/// settings, so it can differ from the intervals the current output was cut
/// with.
pub async fn get_ad_intervals(
    state: &AppState,
    episode_ref: &str,
) -> Result<AdIntervalsView, AppError> {
    let episode = require_episode(state, episode_ref)?;
    let segments = state.db.get_segments(episode_ref)?;
    let identifications = state.db.get_identifications(episode_ref)?;
    let intervals = resolver::resolve(&segments, &identifications, &state.config.resolver);

    let source_duration = episode
        .source_path
        .as_deref()
        .map(Path::new)
        .filter(|p| p.exists())
        .and_then(|p| wav_duration(p).ok());
    let span = source_duration.unwrap_or_else(|| {
        segments
            .iter()
            .map(|s| s.end_time)
            .fold(0.0_f64, f64::max)
    });

    Ok(AdIntervalsView {
        episode_ref: episode.episode_ref,
        removed_duration: resolver::removed_duration(&intervals, span),
        intervals,
        source_duration,
        segment_count: segments.len(),
        identification_count: identifications.len(),
    })
}

/// GET /episodes/:ref/transcript -> get_transcript command
pub async fn get_transcript(
    state: &AppState,
    episode_ref: &str,
) -> Result<Vec<TranscriptSegment>, AppError> {
    require_episode(state, episode_ref)?;
    state.db.get_segments(episode_ref).map_err(AppError::from)
}

/// Pinned episodes are never touched by the cleanup sweeper
pub async fn pin_episode(
    state: &AppState,
    episode_ref: &str,
    pinned: bool,
) -> Result<(), AppError> {
    state
        .writer
        .apply(WriteAction::SetEpisodePinned {
            episode_ref: episode_ref.to_string(),
            pinned,
        })
        .await?;
    log::info!(
        "Episode {} {}",
        episode_ref,
        if pinned { "pinned" } else { "unpinned" }
    );
    Ok(())
}

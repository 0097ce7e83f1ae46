//! Reduces noisy per-segment identifications to a minimal set of ad
//! intervals.
//!
//! Pure and deterministic: the same segments and identifications always give
//! the same intervals, and re-merging the output changes nothing.

use crate::config::ResolverConfig;
use crate::database::{Identification, Label, TranscriptSegment};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Half-open removal range `[start, end)` in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdInterval {
    pub start: f64,
    pub end: f64,
}

impl AdInterval {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn length(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    /// Whether `other` has any overlap with the open gap `(self.end, next.start)`.
    fn gap_touches(&self, next: &AdInterval, other: &AdInterval) -> bool {
        other.start < next.start && other.end > self.end
    }
}

/// Sum of interval lengths, each clamped to `[0, duration]`.
pub fn removed_duration(intervals: &[AdInterval], duration: f64) -> f64 {
    intervals
        .iter()
        .map(|i| (i.end.min(duration) - i.start.max(0.0)).max(0.0))
        .sum()
}

/// Full reduction: winner per segment, ad runs, gap merging, length filter.
///
/// A gap containing a confidently labelled content segment is never bridged.
pub fn resolve(
    segments: &[TranscriptSegment],
    identifications: &[Identification],
    config: &ResolverConfig,
) -> Vec<AdInterval> {
    let decisions = decide(identifications, config.min_confidence);

    let mut ordered: Vec<&TranscriptSegment> = segments.iter().collect();
    ordered.sort_by_key(|s| s.seq);

    let mut runs: Vec<AdInterval> = Vec::new();
    let mut barriers: Vec<AdInterval> = Vec::new();
    let mut last_ad_seq: Option<i64> = None;

    for segment in ordered {
        match decisions.get(&segment.seq) {
            Some(Label::Ad) => {
                let extends = last_ad_seq == Some(segment.seq - 1);
                match runs.last_mut() {
                    Some(run) if extends => run.end = run.end.max(segment.end_time),
                    _ => runs.push(AdInterval::new(segment.start_time, segment.end_time)),
                }
                last_ad_seq = Some(segment.seq);
            }
            Some(Label::Content) => {
                barriers.push(AdInterval::new(segment.start_time, segment.end_time));
                last_ad_seq = None;
            }
            None => last_ad_seq = None,
        }
    }

    merge_close_intervals(&runs, config.min_separation_secs, &barriers)
        .into_iter()
        .filter(|i| i.end > i.start && i.length() >= config.min_ad_length_secs)
        .collect()
}

/// Winning label per segment sequence number.
///
/// Highest confidence wins, ties go to the latest model call. Unknown
/// confidence never wins and a winner below `min_confidence` is dropped.
pub fn decide(identifications: &[Identification], min_confidence: f64) -> BTreeMap<i64, Label> {
    let mut best: BTreeMap<i64, (f64, i64, Label)> = BTreeMap::new();
    for ident in identifications {
        let Some(confidence) = ident.confidence.filter(|c| c.is_finite()) else {
            continue;
        };
        let candidate = (confidence, ident.model_call_id, ident.label);
        best.entry(ident.seq)
            .and_modify(|current| {
                if (candidate.0, candidate.1) > (current.0, current.1) {
                    *current = candidate;
                }
            })
            .or_insert(candidate);
    }

    best.into_iter()
        .filter(|(_, (confidence, _, _))| *confidence >= min_confidence)
        .map(|(seq, (_, _, label))| (seq, label))
        .collect()
}

/// Merge intervals whose gap is shorter than `min_separation`, unless a
/// barrier overlaps the gap. Input order does not matter; output is sorted
/// and non-overlapping.
pub fn merge_close_intervals(
    intervals: &[AdInterval],
    min_separation: f64,
    barriers: &[AdInterval],
) -> Vec<AdInterval> {
    let mut sorted: Vec<AdInterval> = intervals.to_vec();
    sorted.sort_by(|a, b| a.start.total_cmp(&b.start).then(a.end.total_cmp(&b.end)));

    let mut merged: Vec<AdInterval> = Vec::with_capacity(sorted.len());
    for next in sorted {
        match merged.last_mut() {
            Some(current) => {
                let gap = next.start - current.end;
                let overlaps = gap <= 0.0;
                let blocked = barriers.iter().any(|b| current.gap_touches(&next, b));
                if overlaps || (gap < min_separation && !blocked) {
                    current.end = current.end.max(next.end);
                } else {
                    merged.push(next);
                }
            }
            None => merged.push(next),
        }
    }
    merged
}

//! Audio splicing: drop ad intervals from a PCM WAV and write the remaining
//! content regions, with a short linear fade at every cut.

use crate::config::SpliceConfig;
use crate::error::AppError;
use crate::resolver::AdInterval;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use serde::Serialize;
use std::io::{BufReader, BufWriter};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

#[derive(Debug, Clone, Serialize)]
pub struct SpliceReport {
    pub source_duration: f64,
    pub output_duration: f64,
    pub removed_duration: f64,
    pub regions: usize,
}

/// Content regions (complement of `intervals`) within `[0, duration)`.
pub fn content_regions(intervals: &[AdInterval], duration: f64) -> Vec<(f64, f64)> {
    let mut sorted: Vec<AdInterval> = intervals.to_vec();
    sorted.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut regions = Vec::new();
    let mut cursor = 0.0_f64;
    for interval in sorted {
        let start = interval.start.clamp(0.0, duration);
        let end = interval.end.clamp(0.0, duration);
        if start > cursor {
            regions.push((cursor, start));
        }
        cursor = cursor.max(end);
    }
    if cursor < duration {
        regions.push((cursor, duration));
    }
    regions
}

/// Duration of a WAV file in seconds.
pub fn wav_duration(path: &Path) -> Result<f64, AppError> {
    let reader = open_source(path)?;
    let spec = reader.spec();
    Ok(reader.duration() as f64 / spec.sample_rate as f64)
}

fn open_source(path: &Path) -> Result<WavReader<BufReader<File>>, AppError> {
    if !path.exists() {
        return Err(AppError::InputData(format!("Audio file not found: {:?}", path)));
    }
    Ok(WavReader::open(path)?)
}

/// Samples the splicer can fade.
trait PcmSample: hound::Sample + Copy {
    fn scaled(self, gain: f64) -> Self;
}

impl PcmSample for i32 {
    fn scaled(self, gain: f64) -> Self {
        (self as f64 * gain).round() as i32
    }
}

impl PcmSample for f32 {
    fn scaled(self, gain: f64) -> Self {
        (self as f64 * gain) as f32
    }
}

/// Splice `source` into `output`, removing `intervals`.
///
/// Blocking; run it on a blocking thread. The file appears at `output` only
/// once it is complete.
pub fn splice_wav(
    source: &Path,
    intervals: &[AdInterval],
    output: &Path,
    config: &SpliceConfig,
) -> Result<SpliceReport, AppError> {
    let mut reader = open_source(source)?;
    let spec = reader.spec();
    let total_frames = reader.duration() as usize;
    let source_duration = total_frames as f64 / spec.sample_rate as f64;

    if source_duration < config.min_source_secs {
        return Err(AppError::InputData(format!(
            "Source audio too short: {:.2}s (minimum {:.2}s)",
            source_duration, config.min_source_secs
        )));
    }

    let regions = content_regions(intervals, source_duration);
    let partial = partial_path(output);
    let result = match spec.sample_format {
        SampleFormat::Int => write_regions(
            reader.samples::<i32>(),
            spec,
            total_frames,
            &regions,
            &partial,
            config.fade_ms,
        ),
        SampleFormat::Float => write_regions(
            reader.samples::<f32>(),
            spec,
            total_frames,
            &regions,
            &partial,
            config.fade_ms,
        ),
    };

    let written = match result {
        Ok(frames) => frames,
        Err(e) => {
            let _ = std::fs::remove_file(&partial);
            return Err(e);
        }
    };
    std::fs::rename(&partial, output)?;

    let output_duration = written as f64 / spec.sample_rate as f64;
    log::info!(
        "Spliced {:?}: {:.1}s -> {:.1}s ({} region(s))",
        source,
        source_duration,
        output_duration,
        regions.len()
    );

    Ok(SpliceReport {
        source_duration,
        output_duration,
        removed_duration: source_duration - output_duration,
        regions: regions.len(),
    })
}

/// A kept region in frames.
struct Span {
    first: usize,
    last: usize,
    fade: usize,
    fade_in: bool,
    fade_out: bool,
}

impl Span {
    fn gain(&self, frame: usize) -> f64 {
        let len = self.last - self.first;
        let offset = frame - self.first;
        let mut gain = 1.0;
        if self.fade_in && offset < self.fade {
            gain = offset as f64 / self.fade as f64;
        }
        if self.fade_out && len - offset <= self.fade {
            gain = gain.min((len - offset - 1) as f64 / self.fade as f64);
        }
        gain
    }
}

/// Stream `samples` once, writing frames inside `regions` and dropping the
/// rest. Reading stops after the last kept frame.
fn write_regions<S, I>(
    mut samples: I,
    spec: WavSpec,
    total_frames: usize,
    regions: &[(f64, f64)],
    path: &Path,
    fade_ms: u64,
) -> Result<usize, AppError>
where
    S: PcmSample,
    I: Iterator<Item = hound::Result<S>>,
{
    let channels = spec.channels as usize;
    let rate = spec.sample_rate as f64;
    let fade_frames = (fade_ms as f64 * rate / 1000.0).round() as usize;

    let spans: Vec<Span> = regions
        .iter()
        .filter_map(|&(start, end)| {
            let first = ((start * rate).round() as usize).min(total_frames);
            let last = ((end * rate).round() as usize).min(total_frames);
            if last <= first {
                return None;
            }
            let fade = fade_frames.min((last - first) / 2);
            // Only cuts get a fade; the track's own start and end are left alone
            Some(Span {
                first,
                last,
                fade,
                fade_in: first > 0 && fade > 0,
                fade_out: last < total_frames && fade > 0,
            })
        })
        .collect();
    let end = spans.last().map_or(0, |span| span.last);

    let mut writer = WavWriter::new(BufWriter::new(File::create(path)?), spec)?;
    let mut pending = spans.iter().peekable();
    for frame in 0..end {
        while pending.next_if(|span| frame >= span.last).is_some() {}
        let gain = match pending.peek() {
            Some(span) if frame >= span.first => Some(span.gain(frame)),
            _ => None,
        };
        for _ in 0..channels {
            let sample = samples.next().ok_or_else(|| {
                AppError::InputData(format!(
                    "Audio ends at frame {} of {}",
                    frame, total_frames
                ))
            })??;
            match gain {
                Some(gain) if gain < 1.0 => writer.write_sample(sample.scaled(gain))?,
                Some(_) => writer.write_sample(sample)?,
                None => {}
            }
        }
    }

    writer.finalize()?;
    Ok(spans.iter().map(|span| span.last - span.first).sum())
}

fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    output.with_file_name(name)
}

/// Decode any container ffmpeg understands into 16-bit PCM WAV.
pub async fn decode_to_wav(ffmpeg: &Path, source: &Path, dest: &Path) -> Result<(), AppError> {
    let partial = partial_path(dest);
    log::info!("Decoding {:?} to WAV", source);

    let output = Command::new(ffmpeg)
        .arg("-y")
        .args(["-v", "error", "-i"])
        .arg(source)
        .args(["-vn", "-acodec", "pcm_s16le", "-f", "wav"])
        .arg(&partial)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| AppError::Permanent(format!("Failed to spawn ffmpeg: {}", e)))?;

    if !output.status.success() {
        let _ = tokio::fs::remove_file(&partial).await;
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::InputData(format!(
            "ffmpeg could not decode {:?}: {}",
            source,
            stderr.trim()
        )));
    }

    tokio::fs::rename(&partial, dest).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const RATE: u32 = 8_000;

    fn write_tone(path: &Path, seconds: f64, channels: u16) {
        let spec = WavSpec {
            channels,
            sample_rate: RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        let frames = (seconds * RATE as f64) as usize;
        for i in 0..frames {
            let value = ((i as f64 * 0.05).sin() * 10_000.0) as i16;
            for _ in 0..channels {
                writer.write_sample(value).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    fn config() -> SpliceConfig {
        SpliceConfig {
            fade_ms: 20,
            min_source_secs: 1.0,
            ..SpliceConfig::default()
        }
    }

    #[test]
    fn test_content_regions_complement() {
        let regions = content_regions(
            &[AdInterval::new(20.0, 30.0), AdInterval::new(0.0, 5.0)],
            60.0,
        );
        assert_eq!(regions, vec![(5.0, 20.0), (30.0, 60.0)]);

        let regions = content_regions(&[AdInterval::new(50.0, 90.0)], 60.0);
        assert_eq!(regions, vec![(0.0, 50.0)]);

        assert_eq!(content_regions(&[], 10.0), vec![(0.0, 10.0)]);
    }

    #[test]
    fn test_output_duration_matches_removed_length() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.wav");
        let output = dir.path().join("out.wav");
        write_tone(&source, 10.0, 2);

        let intervals = [AdInterval::new(1.0, 3.0), AdInterval::new(7.5, 12.0)];
        let report = splice_wav(&source, &intervals, &output, &config()).unwrap();

        let expected = 10.0 - crate::resolver::removed_duration(&intervals, 10.0);
        assert!((report.output_duration - expected).abs() < 0.01);
        assert!((wav_duration(&output).unwrap() - expected).abs() < 0.01);
        assert_eq!(report.regions, 2);
        assert!(!partial_path(&output).exists());

        let reader = WavReader::open(&output).unwrap();
        assert_eq!(reader.spec().channels, 2);
    }

    #[test]
    fn test_no_intervals_copies_source() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.wav");
        let output = dir.path().join("out.wav");
        write_tone(&source, 2.0, 1);

        let report = splice_wav(&source, &[], &output, &config()).unwrap();
        assert_eq!(report.regions, 1);

        let original: Vec<i32> = WavReader::open(&source)
            .unwrap()
            .samples::<i32>()
            .map(|s| s.unwrap())
            .collect();
        let copied: Vec<i32> = WavReader::open(&output)
            .unwrap()
            .samples::<i32>()
            .map(|s| s.unwrap())
            .collect();
        assert_eq!(original, copied);
    }

    #[test]
    fn test_fade_at_cut_starts_from_silence() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.wav");
        let output = dir.path().join("out.wav");
        let spec = WavSpec {
            channels: 1,
            sample_rate: RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&source, spec).unwrap();
        for _ in 0..(RATE * 4) {
            writer.write_sample(8_000i16).unwrap();
        }
        writer.finalize().unwrap();

        splice_wav(&source, &[AdInterval::new(0.0, 2.0)], &output, &config()).unwrap();
        let samples: Vec<i32> = WavReader::open(&output)
            .unwrap()
            .samples::<i32>()
            .map(|s| s.unwrap())
            .collect();
        assert_eq!(samples[0], 0);
        assert!(samples[80] > 0 && samples[80] < 8_000);
        // Track end is not a cut
        assert_eq!(*samples.last().unwrap(), 8_000);
    }

    #[test]
    fn test_kept_frames_stay_aligned_across_cuts() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.wav");
        let output = dir.path().join("out.wav");
        let spec = WavSpec {
            channels: 2,
            sample_rate: RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        // Left carries the frame number, right its negation
        let mut writer = WavWriter::create(&source, spec).unwrap();
        for frame in 0..(RATE as i32 * 4) {
            writer.write_sample(frame as i16).unwrap();
            writer.write_sample(-(frame as i16)).unwrap();
        }
        writer.finalize().unwrap();

        let intervals = [AdInterval::new(1.0, 2.0), AdInterval::new(3.0, 3.5)];
        splice_wav(&source, &intervals, &output, &config()).unwrap();
        let samples: Vec<i32> = WavReader::open(&output)
            .unwrap()
            .samples::<i32>()
            .map(|s| s.unwrap())
            .collect();
        let frames: Vec<(i32, i32)> = samples.chunks(2).map(|c| (c[0], c[1])).collect();
        assert_eq!(frames.len(), (RATE as usize) * 5 / 2);

        // 0.5s into the second region, well past its fade-in
        let fade = 160;
        let mid_second = RATE as usize + RATE as usize / 2;
        let source_frame = 2 * RATE as i32 + RATE as i32 / 2;
        assert_eq!(frames[mid_second], (source_frame, -source_frame));
        assert!(frames[RATE as usize + fade].0 > 0);

        // Third region resumes at 3.5s, after the fade
        let third = 2 * RATE as usize + fade + 10;
        let expected = (3.5 * RATE as f64) as i32 + fade as i32 + 10;
        assert_eq!(frames[third], (expected, -expected));
    }

    #[test]
    fn test_float_samples_supported() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.wav");
        let output = dir.path().join("out.wav");
        let spec = WavSpec {
            channels: 1,
            sample_rate: RATE,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut writer = WavWriter::create(&source, spec).unwrap();
        for _ in 0..(RATE * 3) {
            writer.write_sample(0.5f32).unwrap();
        }
        writer.finalize().unwrap();

        let report = splice_wav(&source, &[AdInterval::new(1.0, 2.0)], &output, &config()).unwrap();
        assert!((report.output_duration - 2.0).abs() < 0.01);
    }

    #[test]
    fn test_bad_sources_are_input_errors() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.wav");

        let missing = splice_wav(&dir.path().join("nope.wav"), &[], &output, &config());
        assert!(matches!(missing, Err(AppError::InputData(_))));

        let garbage = dir.path().join("garbage.wav");
        std::fs::write(&garbage, b"not a wav file at all").unwrap();
        let malformed = splice_wav(&garbage, &[], &output, &config());
        assert!(matches!(malformed, Err(AppError::InputData(_))));

        let short = dir.path().join("short.wav");
        write_tone(&short, 0.5, 1);
        let too_short = splice_wav(&short, &[], &output, &config());
        assert!(matches!(too_short, Err(AppError::InputData(_))));
        assert!(!output.exists());
    }
}

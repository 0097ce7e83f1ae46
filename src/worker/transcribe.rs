use crate::config::TranscriptionConfig;
use crate::database::NewSegment;
use crate::error::AppError;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::ProgressReporter;

/// Speech-to-text collaborator: audio in, ordered timestamped spans out.
#[async_trait]
pub trait Transcriber: Send + Sync {
    fn model_name(&self) -> &str;

    async fn transcribe(
        &self,
        audio: &Path,
        language: Option<&str>,
        progress: &ProgressReporter,
    ) -> Result<Vec<NewSegment>, AppError>;
}

/// Runs the `whisper-cli` binary from whisper.cpp
pub struct WhisperCliTranscriber {
    cli_path: PathBuf,
    model_path: PathBuf,
    work_dir: PathBuf,
    model_name: String,
}

impl WhisperCliTranscriber {
    pub fn new(config: &TranscriptionConfig, work_dir: PathBuf) -> Self {
        let model_name = config
            .model_path
            .file_stem()
            .map(|s| s.to_string_lossy().trim_start_matches("ggml-").to_string())
            .unwrap_or_else(|| "whisper".to_string());
        Self {
            cli_path: config.whisper_cli_path.clone(),
            model_path: config.model_path.clone(),
            work_dir,
            model_name: format!("whisper.cpp/{}", model_name),
        }
    }
}

#[async_trait]
impl Transcriber for WhisperCliTranscriber {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn transcribe(
        &self,
        audio: &Path,
        language: Option<&str>,
        progress: &ProgressReporter,
    ) -> Result<Vec<NewSegment>, AppError> {
        if !audio.exists() {
            return Err(AppError::InputData(format!("Audio file not found: {:?}", audio)));
        }
        if !self.model_path.exists() {
            return Err(AppError::Permanent(format!(
                "Whisper model not found: {:?}",
                self.model_path
            )));
        }

        let stem = audio
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "audio".to_string());
        let output_base = self
            .work_dir
            .join(format!("{}-{}", stem, uuid::Uuid::new_v4()));

        log::info!("Running whisper-cli with progress tracking: {:?}", audio);

        let mut command = Command::new(&self.cli_path);
        command
            .arg("-m")
            .arg(&self.model_path)
            .arg("-f")
            .arg(audio)
            .arg("-oj")
            .arg("-of")
            .arg(&output_base)
            .arg("-pp");
        if let Some(lang) = language {
            command.args(["-l", lang]);
        }

        let mut child = command
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AppError::Permanent(format!(
                    "Failed to spawn whisper-cli at {:?}: {}",
                    self.cli_path, e
                ))
            })?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Other("whisper-cli stderr not captured".into()))?;
        let mut lines = BufReader::new(stderr).lines();
        let mut last_lines: Vec<String> = Vec::new();

        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(percent) = parse_progress(&line) {
                progress.report(percent as f64 / 100.0);
            } else if !line.trim().is_empty() {
                last_lines.push(line);
                if last_lines.len() > 5 {
                    last_lines.remove(0);
                }
            }
        }

        let status = child.wait().await?;
        let json_path = output_base.with_extension("json");
        if !status.success() {
            let _ = tokio::fs::remove_file(&json_path).await;
            return Err(AppError::Transient(format!(
                "whisper-cli exited with {}: {}",
                status,
                last_lines.join(" | ")
            )));
        }

        let bytes = tokio::fs::read(&json_path).await.map_err(|e| {
            AppError::Transient(format!("whisper-cli produced no output {:?}: {}", json_path, e))
        })?;
        let _ = tokio::fs::remove_file(&json_path).await;

        let segments = parse_whisper_json(&String::from_utf8_lossy(&bytes))?;
        log::info!("Transcription produced {} segment(s)", segments.len());
        Ok(segments)
    }
}

#[derive(Deserialize)]
struct WhisperOutput {
    transcription: Vec<WhisperSpan>,
}

#[derive(Deserialize)]
struct WhisperSpan {
    offsets: WhisperOffsets,
    text: String,
}

#[derive(Deserialize)]
struct WhisperOffsets {
    from: i64,
    to: i64,
}

/// Convert whisper-cli `-oj` output into segments, dropping empty spans.
pub fn parse_whisper_json(content: &str) -> Result<Vec<NewSegment>, AppError> {
    let output: WhisperOutput = serde_json::from_str(content)
        .map_err(|e| AppError::InputData(format!("Malformed transcript JSON: {}", e)))?;

    Ok(output
        .transcription
        .into_iter()
        .filter_map(|span| {
            let text = span.text.trim().to_string();
            if text.is_empty() {
                return None;
            }
            let start = span.offsets.from.max(0) as f64 / 1000.0;
            let end = (span.offsets.to.max(0) as f64 / 1000.0).max(start);
            Some(NewSegment {
                start_time: start,
                end_time: end,
                text,
            })
        })
        .collect())
}

/// Parse progress percentage from a whisper-cli stderr line
fn parse_progress(line: &str) -> Option<i32> {
    static PROGRESS: OnceLock<Option<Regex>> = OnceLock::new();
    let re = PROGRESS
        .get_or_init(|| Regex::new(r"progress\s*=\s*(\d{1,3})\s*%").ok())
        .as_ref()?;
    let caps = re.captures(line)?;
    caps[1].parse::<i32>().ok().map(|p| p.clamp(0, 100))
}

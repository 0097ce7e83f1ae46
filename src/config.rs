//! Service configuration.
//!
//! Loaded from a YAML file; every section has defaults so an empty file (or
//! no file at all) yields a working local setup under the user's data
//! directory. Secrets come from a `.env` file next to the data directory.

use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub scheduler: SchedulerConfig,
    pub transcription: TranscriptionConfig,
    pub classification: ClassificationConfig,
    pub resolver: ResolverConfig,
    pub splice: SpliceConfig,
    pub cleanup: CleanupConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
}

impl PathsConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("adsplice.db")
    }

    pub fn changelog_path(&self) -> PathBuf {
        self.data_dir.join("writer-changes.jsonl")
    }

    /// Downloaded / decoded source audio.
    pub fn episodes_dir(&self) -> PathBuf {
        self.data_dir.join("episodes")
    }

    /// Ad-free output audio.
    pub fn output_dir(&self) -> PathBuf {
        self.data_dir.join("output")
    }

    /// Transcriber scratch files.
    pub fn work_dir(&self) -> PathBuf {
        self.data_dir.join("work")
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            data_dir: base.join("adsplice"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Jobs executed at once.
    pub concurrency: usize,
    pub poll_interval_secs: u64,
    /// Times a stage is re-run after a rejected write.
    pub stage_retry_limit: u32,
    /// Capacity of the writer's command queue.
    pub writer_queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_interval_secs: 10,
            stage_retry_limit: 2,
            writer_queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub whisper_cli_path: PathBuf,
    pub model_path: PathBuf,
    pub language: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let whisper = home.join("bin").join("whisper-cpp").join("whisper.cpp");
        Self {
            whisper_cli_path: whisper.join("build").join("bin").join("whisper-cli"),
            model_path: whisper.join("models").join("ggml-medium.bin"),
            language: Some("en".to_string()),
            timeout_secs: 3 * 3600,
            max_retries: 2,
            initial_backoff_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    pub base_url: String,
    pub model: String,
    /// Segments per classification prompt.
    pub batch_size: usize,
    /// In-flight classification calls across all jobs.
    pub max_concurrency: usize,
    /// Rolling budget per `window_secs`; 0 disables the budget.
    pub tokens_per_window: u32,
    pub window_secs: u64,
    /// Optional ceiling for a single call's estimated cost.
    pub max_tokens_per_call: Option<u32>,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub timeout_secs: u64,
    /// Populated from `.env` (`ADSPLICE_API_KEY`), never from YAML.
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl ClassificationConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.max(1))
    }
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            batch_size: 25,
            max_concurrency: 2,
            tokens_per_window: 60_000,
            window_secs: 60,
            max_tokens_per_call: Some(8_000),
            max_retries: 4,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            timeout_secs: 120,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResolverConfig {
    pub min_confidence: f64,
    /// Intervals shorter than this are dropped.
    pub min_ad_length_secs: f64,
    /// Ad intervals closer than this are merged.
    pub min_separation_secs: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.8,
            min_ad_length_secs: 10.0,
            min_separation_secs: 60.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpliceConfig {
    pub fade_ms: u64,
    /// Sources shorter than this are rejected as input errors.
    pub min_source_secs: f64,
    pub ffmpeg_path: PathBuf,
}

impl Default for SpliceConfig {
    fn default() -> Self {
        Self {
            fade_ms: 50,
            min_source_secs: 1.0,
            ffmpeg_path: PathBuf::from("ffmpeg"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Unset or <= 0 disables the sweeper.
    pub retention_days: Option<i64>,
    pub interval_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            retention_days: None,
            interval_secs: 6 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            scheduler: SchedulerConfig::default(),
            transcription: TranscriptionConfig::default(),
            classification: ClassificationConfig::default(),
            resolver: ResolverConfig::default(),
            splice: SpliceConfig::default(),
            cleanup: CleanupConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from a YAML file (missing file → defaults), then pull secrets
    /// from `.env` and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(p)?;
                Self::from_yaml(&content)?
            }
            Some(p) => {
                log::warn!("Config file {:?} not found, using defaults", p);
                Self::default()
            }
            None => Self::default(),
        };

        let env_dir = config
            .paths
            .data_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| config.paths.data_dir.clone());
        config.classification.api_key = load_env_value(&config.paths.data_dir, "ADSPLICE_API_KEY")
            .or_else(|| load_env_value(&env_dir, "ADSPLICE_API_KEY"));

        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, AppError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.scheduler.concurrency == 0 {
            return Err(AppError::Config("scheduler.concurrency must be > 0".into()));
        }
        if self.classification.max_concurrency == 0 {
            return Err(AppError::Config(
                "classification.max_concurrency must be > 0".into(),
            ));
        }
        if self.classification.batch_size == 0 {
            return Err(AppError::Config("classification.batch_size must be > 0".into()));
        }
        let r = &self.resolver;
        if !(0.0..=1.0).contains(&r.min_confidence) {
            return Err(AppError::Config(
                "resolver.min_confidence must be within [0, 1]".into(),
            ));
        }
        if r.min_ad_length_secs < 0.0 || r.min_separation_secs < 0.0 {
            return Err(AppError::Config("resolver thresholds must be >= 0".into()));
        }
        Ok(())
    }

    /// Create the data, episode, output and work directories.
    pub fn ensure_dirs(&self) -> Result<(), AppError> {
        for dir in [
            self.paths.data_dir.clone(),
            self.paths.episodes_dir(),
            self.paths.output_dir(),
            self.paths.work_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Load a value from the .env file by key name
pub fn load_env_value(dir: &Path, key: &str) -> Option<String> {
    let env_path = dir.join(".env");
    let prefix = format!("{}=", key);
    if let Ok(content) = std::fs::read_to_string(&env_path) {
        for line in content.lines() {
            let trimmed = line.trim();
            if let Some(rest) = trimmed.strip_prefix(&prefix) {
                let value = rest.trim().trim_matches('"').trim_matches('\'');
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

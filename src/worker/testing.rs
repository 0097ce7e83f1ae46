//! Mock collaborators and a wired-up store for worker tests.

use super::pipeline::JobExecutor;
use super::transcribe::Transcriber;
use super::{JobScheduler, ProgressReporter, SchedulerHandle};
use crate::classifier::limiter::RateLimitedCaller;
use crate::classifier::ClassificationBackend;
use crate::config::AppConfig;
use crate::database::actions::WriteAction;
use crate::database::{Database, Job, JobStatus, NewSegment};
use crate::error::AppError;
use crate::writer::{spawn_writer, WriterHandle};
use async_trait::async_trait;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const SEGMENT_SECS: f64 = 5.0;

/// One segment per five seconds; the listed segments read like ads.
pub struct MockTranscriber {
    pub ad_segments: Vec<usize>,
    pub delay: Duration,
    pub failures_left: AtomicU32,
    pub calls: AtomicU32,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl MockTranscriber {
    pub fn new(ad_segments: Vec<usize>) -> Self {
        Self {
            ad_segments,
            delay: Duration::from_millis(10),
            failures_left: AtomicU32::new(0),
            calls: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Transcriber for MockTranscriber {
    fn model_name(&self) -> &str {
        "mock-whisper"
    }

    async fn transcribe(
        &self,
        audio: &Path,
        _language: Option<&str>,
        progress: &ProgressReporter,
    ) -> Result<Vec<NewSegment>, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        progress.report(0.5);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AppError::Transient("model busy".into()));
        }

        let duration = super::splice::wav_duration(audio)?;
        let count = (duration / SEGMENT_SECS).floor() as usize;
        Ok((0..count)
            .map(|i| NewSegment {
                start_time: i as f64 * SEGMENT_SECS,
                end_time: (i + 1) as f64 * SEGMENT_SECS,
                text: if self.ad_segments.contains(&i) {
                    "This episode is brought to you by our sponsor".to_string()
                } else {
                    "Back to the interview".to_string()
                },
            })
            .collect())
    }
}

/// Labels segments mentioning a sponsor as ads.
pub struct MockBackend {
    pub calls: AtomicU32,
    fail_seq: Mutex<Option<i64>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_seq: Mutex::new(None),
        }
    }

    pub fn fail_on_seq(&self, seq: Option<i64>) {
        *self.fail_seq.lock().unwrap() = seq;
    }
}

#[async_trait]
impl ClassificationBackend for MockBackend {
    fn model_name(&self) -> &str {
        "mock-llm"
    }

    async fn classify(&self, prompt: &str) -> Result<String, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let fail_seq = *self.fail_seq.lock().unwrap();

        let mut entries = Vec::new();
        for line in prompt.lines() {
            let Some(rest) = line.strip_prefix('[') else {
                continue;
            };
            let Some((seq, text)) = rest.split_once(']') else {
                continue;
            };
            let Ok(seq) = seq.parse::<i64>() else {
                continue;
            };
            if fail_seq == Some(seq) {
                return Err(AppError::Permanent("model refused the request".into()));
            }
            let (label, confidence) = if text.contains("sponsor") {
                ("ad", 0.95)
            } else {
                ("content", 0.9)
            };
            entries.push(serde_json::json!({
                "seq": seq, "label": label, "confidence": confidence
            }));
        }
        Ok(serde_json::json!({ "segments": entries }).to_string())
    }
}

pub struct HarnessOptions {
    pub ad_segments: Vec<usize>,
    pub transcribe_delay: Duration,
    pub transcribe_failures: u32,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            ad_segments: vec![1, 2],
            transcribe_delay: Duration::from_millis(10),
            transcribe_failures: 0,
        }
    }
}

/// Mono 8 kHz 16-bit tone of the given length.
pub fn write_tone(path: &Path, seconds: f64) {
    let spec = WavSpec {
        channels: 1,
        sample_rate: 8_000,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec).unwrap();
    for i in 0..(seconds * 8_000.0) as usize {
        writer
            .write_sample(((i as f64 * 0.03).sin() * 12_000.0) as i16)
            .unwrap();
    }
    writer.finalize().unwrap();
}

pub struct Harness {
    pub config: Arc<AppConfig>,
    pub db: Arc<Database>,
    pub writer: WriterHandle,
    pub transcriber: Arc<MockTranscriber>,
    pub backend: Arc<MockBackend>,
    pub executor: Arc<JobExecutor>,
    audio_dir: std::path::PathBuf,
}

pub fn test_config(dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.paths.data_dir = dir.path().join("data");
    config.scheduler.poll_interval_secs = 1;
    config.transcription.initial_backoff_ms = 1;
    config.transcription.timeout_secs = 60;
    config.classification.batch_size = 4;
    config.classification.max_concurrency = 2;
    config.classification.tokens_per_window = 0;
    config.classification.max_tokens_per_call = None;
    config.classification.initial_backoff_ms = 1;
    config.classification.max_backoff_ms = 2;
    config.splice.fade_ms = 10;
    config
}

impl Harness {
    pub async fn new(dir: &TempDir, options: HarnessOptions) -> Self {
        let config = test_config(dir);
        config.ensure_dirs().unwrap();
        let audio_dir = dir.path().join("audio");
        std::fs::create_dir_all(&audio_dir).unwrap();

        let (writer, _join) = spawn_writer(
            &config.paths.database_path(),
            &config.paths.changelog_path(),
            64,
        )
        .unwrap();
        let db = Arc::new(Database::open(&config.paths.database_path()).unwrap());

        let transcriber = Arc::new(MockTranscriber {
            delay: options.transcribe_delay,
            failures_left: AtomicU32::new(options.transcribe_failures),
            ..MockTranscriber::new(options.ad_segments)
        });
        let backend = Arc::new(MockBackend::new());
        let caller = Arc::new(RateLimitedCaller::new(
            backend.clone(),
            writer.clone(),
            &config.classification,
        ));
        let config = Arc::new(config);
        let executor = Arc::new(
            JobExecutor::new(
                db.clone(),
                writer.clone(),
                transcriber.clone(),
                caller,
                config.clone(),
            )
            .unwrap(),
        );

        Self {
            config,
            db,
            writer,
            transcriber,
            backend,
            executor,
            audio_dir,
        }
    }

    /// Write a mono 8 kHz tone and return its path as the episode reference.
    pub fn write_episode(&self, name: &str, seconds: f64) -> String {
        let path = self.audio_dir.join(format!("{}.wav", name));
        write_tone(&path, seconds);
        path.to_string_lossy().to_string()
    }

    pub async fn submit(&self, job_id: &str, episode_ref: &str, priority: i32) {
        self.create(job_id, episode_ref, priority, false).await;
    }

    pub async fn submit_forced(&self, job_id: &str, episode_ref: &str) {
        self.create(job_id, episode_ref, 0, true).await;
    }

    async fn create(&self, job_id: &str, episode_ref: &str, priority: i32, force: bool) {
        self.writer
            .apply(WriteAction::CreateJob {
                job_id: job_id.to_string(),
                episode_ref: episode_ref.to_string(),
                priority,
                force,
            })
            .await
            .unwrap();
    }

    pub fn scheduler(&self, concurrency: usize) -> (JobScheduler, SchedulerHandle) {
        JobScheduler::new(
            self.db.clone(),
            self.writer.clone(),
            self.executor.clone(),
            concurrency,
            Duration::from_millis(50),
        )
    }

    /// Start and execute one job directly, without the scheduler.
    pub async fn run_one(&self, job_id: &str) -> (Job, JobStatus) {
        self.run_one_with(CancellationToken::new(), job_id).await
    }

    pub async fn run_one_with(&self, shutdown: CancellationToken, job_id: &str) -> (Job, JobStatus) {
        self.writer
            .apply(WriteAction::StartJob {
                job_id: job_id.to_string(),
            })
            .await
            .unwrap();
        let job = self.db.get_job(job_id).unwrap().unwrap();
        let (tx, _rx) = tokio::sync::mpsc::channel(64);
        let status = self
            .executor
            .execute(job, shutdown.child_token(), shutdown, tx)
            .await;
        (self.db.get_job(job_id).unwrap().unwrap(), status)
    }

    pub async fn wait_terminal(&self, job_id: &str) -> Job {
        self.wait_until(job_id, |job| job.status.is_terminal()).await
    }

    pub async fn wait_for_step(&self, job_id: &str, step_name: &str) -> Job {
        self.wait_until(job_id, |job| job.step_name == step_name).await
    }

    async fn wait_until(&self, job_id: &str, done: impl Fn(&Job) -> bool) -> Job {
        for _ in 0..500 {
            if let Some(job) = self.db.get_job(job_id).unwrap() {
                if done(&job) {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {} did not reach the expected state", job_id);
    }
}

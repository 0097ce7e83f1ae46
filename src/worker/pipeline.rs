//! Job execution: runs one job through every stage and records its outcome.

use super::source::{fingerprint_file, is_remote, safe_file_stem, source_extension, Downloader};
use super::splice::{decode_to_wav, splice_wav};
use super::transcribe::Transcriber;
use super::{ProgressReporter, ProgressUpdate, Stage};
use crate::classifier::limiter::{ClassificationRequest, RateLimitedCaller, RetryPolicy};
use crate::classifier::build_prompt;
use crate::config::AppConfig;
use crate::database::actions::{ActionOutcome, WriteAction};
use crate::database::{
    Database, Job, JobOutcome, JobStatus, ModelCallKind, ModelCallStatus, NewSegment,
    SegmentRange, TranscriptSegment,
};
use crate::error::AppError;
use crate::resolver::{self, AdInterval};
use crate::writer::WriterHandle;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

enum StageFlow {
    Continue,
    Skip(String),
}

/// State carried from one stage to the next.
#[derive(Default)]
struct JobRun {
    source: Option<PathBuf>,
    fingerprint: Option<String>,
    segments: Vec<TranscriptSegment>,
    intervals: Vec<AdInterval>,
}

struct JobContext<'a> {
    job: &'a Job,
    cancel: &'a CancellationToken,
    shutdown: &'a CancellationToken,
    progress_tx: &'a mpsc::Sender<ProgressUpdate>,
}

pub struct JobExecutor {
    db: Arc<Database>,
    writer: WriterHandle,
    transcriber: Arc<dyn Transcriber>,
    caller: Arc<RateLimitedCaller>,
    downloader: Downloader,
    config: Arc<AppConfig>,
}

impl JobExecutor {
    pub fn new(
        db: Arc<Database>,
        writer: WriterHandle,
        transcriber: Arc<dyn Transcriber>,
        caller: Arc<RateLimitedCaller>,
        config: Arc<AppConfig>,
    ) -> Result<Self, AppError> {
        Ok(Self {
            db,
            writer,
            transcriber,
            caller,
            downloader: Downloader::new()?,
            config,
        })
    }

    /// Run a job that has already been started and record how it ended.
    pub async fn execute(
        &self,
        job: Job,
        cancel: CancellationToken,
        shutdown: CancellationToken,
        progress_tx: mpsc::Sender<ProgressUpdate>,
    ) -> JobStatus {
        let span = tracing::info_span!("job", job_id = %job.id, episode = %job.episode_ref);
        self.run_job(job, cancel, shutdown, progress_tx)
            .instrument(span)
            .await
    }

    async fn run_job(
        &self,
        job: Job,
        cancel: CancellationToken,
        shutdown: CancellationToken,
        progress_tx: mpsc::Sender<ProgressUpdate>,
    ) -> JobStatus {
        let started = Instant::now();
        log::info!("Job {} started for {}", job.id, job.episode_ref);

        let ctx = JobContext {
            job: &job,
            cancel: &cancel,
            shutdown: &shutdown,
            progress_tx: &progress_tx,
        };
        let outcome = match self.run_stages(&ctx).await {
            Ok(None) => JobOutcome::Completed,
            Ok(Some(reason)) => JobOutcome::Skipped { reason },
            Err(AppError::Cancelled) if shutdown.is_cancelled() => JobOutcome::Failed {
                error: "interrupted: service shutting down".to_string(),
            },
            Err(AppError::Cancelled) => JobOutcome::Cancelled,
            Err(e) => JobOutcome::Failed {
                error: e.to_string(),
            },
        };
        let status = outcome.status();

        let finish = WriteAction::FinishJob {
            job_id: job.id.clone(),
            outcome: outcome.clone(),
        };
        if let Err(e) = self.apply_with_retry(finish).await {
            log::error!("Failed to record outcome of job {}: {}", job.id, e);
        }

        match &outcome {
            JobOutcome::Failed { error } => log::warn!(
                "Job {} failed after {:.1}s: {}",
                job.id,
                started.elapsed().as_secs_f64(),
                error
            ),
            other => log::info!(
                "Job {} {} in {:.1}s{}",
                job.id,
                status,
                started.elapsed().as_secs_f64(),
                other.message().map(|m| format!(" ({})", m)).unwrap_or_default()
            ),
        }
        status
    }

    /// `Ok(Some(reason))` means the job was skipped.
    async fn run_stages(&self, ctx: &JobContext<'_>) -> Result<Option<String>, AppError> {
        let mut run = JobRun::default();
        let retry_limit = self.config.scheduler.stage_retry_limit;

        for stage in Stage::ALL {
            self.check_cancel(ctx)?;
            self.apply_with_retry(WriteAction::UpdateJobProgress {
                job_id: ctx.job.id.clone(),
                step: stage.step(),
                step_name: stage.name().to_string(),
                progress: stage.band().0,
            })
            .await?;
            let reporter = ProgressReporter::new(&ctx.job.id, stage, ctx.progress_tx.clone());
            reporter.report(0.0);

            let mut attempt = 0;
            let flow = loop {
                match self.run_stage(stage, ctx, &mut run, &reporter).await {
                    Err(e) if e.is_arbitration() && attempt < retry_limit => {
                        attempt += 1;
                        log::warn!(
                            "Stage {} hit a rejected write, re-running ({}/{}): {}",
                            stage.name(),
                            attempt,
                            retry_limit,
                            e
                        );
                    }
                    other => break other?,
                }
            };

            if let StageFlow::Skip(reason) = flow {
                return Ok(Some(reason));
            }
        }
        Ok(None)
    }

    async fn run_stage(
        &self,
        stage: Stage,
        ctx: &JobContext<'_>,
        run: &mut JobRun,
        reporter: &ProgressReporter,
    ) -> Result<StageFlow, AppError> {
        match stage {
            Stage::Preparing => self.prepare(ctx, run).await,
            Stage::Transcribing => self.transcribe(ctx, run, reporter).await,
            Stage::Classifying => self.classify(ctx, run, reporter).await,
            Stage::Resolving => self.resolve(ctx, run),
            Stage::Splicing => self.splice(ctx, run).await,
        }
    }

    /// Cancellation is observed from the token or from a flag raised in the
    /// store by another process.
    fn check_cancel(&self, ctx: &JobContext<'_>) -> Result<(), AppError> {
        if ctx.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        match self.db.get_job(&ctx.job.id)? {
            Some(job) if job.cancel_requested => Err(AppError::Cancelled),
            Some(_) => Ok(()),
            None => Err(AppError::NotFound(format!("job {}", ctx.job.id))),
        }
    }

    async fn apply_with_retry(&self, action: WriteAction) -> Result<ActionOutcome, AppError> {
        let limit = self.config.scheduler.stage_retry_limit;
        let mut attempt = 0;
        loop {
            match self.writer.apply(action.clone()).await {
                Err(e) if e.is_arbitration() && attempt < limit => {
                    attempt += 1;
                    log::warn!("Retrying {} after rejected write: {}", action.name(), e);
                    tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
                }
                other => return other,
            }
        }
    }

    // ── Stage 0: preparing ─────────────────────────────────────────────────

    async fn prepare(&self, ctx: &JobContext<'_>, run: &mut JobRun) -> Result<StageFlow, AppError> {
        let episode_ref = &ctx.job.episode_ref;
        let paths = &self.config.paths;
        let stem = safe_file_stem(episode_ref);

        let original = if is_remote(episode_ref) {
            let ext = source_extension(episode_ref).unwrap_or_else(|| "mp3".to_string());
            let dest = paths.episodes_dir().join(format!("{}.{}", stem, ext));
            if dest.exists() {
                log::info!("Using cached download {:?}", dest);
            } else {
                tokio::fs::create_dir_all(paths.episodes_dir()).await?;
                self.downloader.fetch(episode_ref, &dest, ctx.cancel).await?;
            }
            dest
        } else {
            let path = PathBuf::from(episode_ref.strip_prefix("file://").unwrap_or(episode_ref));
            if !path.is_file() {
                return Err(AppError::InputData(format!(
                    "Source audio not found: {}",
                    episode_ref
                )));
            }
            path
        };

        let fingerprint = fingerprint_file(&original).await?;
        let episode = self.db.get_episode(episode_ref)?;

        let source = if is_wav(&original) {
            original
        } else {
            let decoded = paths.episodes_dir().join(format!("{}.wav", stem));
            let stale = episode
                .as_ref()
                .map(|e| e.source_fingerprint.as_deref() != Some(fingerprint.as_str()))
                .unwrap_or(true);
            if stale || !decoded.exists() {
                tokio::fs::create_dir_all(paths.episodes_dir()).await?;
                decode_to_wav(&self.config.splice.ffmpeg_path, &original, &decoded).await?;
            }
            decoded
        };

        self.writer
            .apply(WriteAction::SetEpisodeSource {
                episode_ref: episode_ref.clone(),
                source_path: source.to_string_lossy().to_string(),
                fingerprint: fingerprint.clone(),
            })
            .await?;

        run.source = Some(source);
        run.fingerprint = Some(fingerprint.clone());

        if !ctx.job.force {
            if let Some(episode) = episode {
                let same_source = episode.output_fingerprint.as_deref() == Some(fingerprint.as_str());
                let output_exists = episode
                    .output_path
                    .as_deref()
                    .map(|p| Path::new(p).exists())
                    .unwrap_or(false);
                if same_source && output_exists {
                    return Ok(StageFlow::Skip(
                        "output already produced from an identical source".to_string(),
                    ));
                }
            }
        }
        Ok(StageFlow::Continue)
    }

    // ── Stage 1: transcribing ──────────────────────────────────────────────

    async fn transcribe(
        &self,
        ctx: &JobContext<'_>,
        run: &mut JobRun,
        reporter: &ProgressReporter,
    ) -> Result<StageFlow, AppError> {
        let episode_ref = &ctx.job.episode_ref;
        let existing = self.db.get_segments(episode_ref)?;
        if !existing.is_empty() {
            log::info!("Reusing {} persisted transcript segment(s)", existing.len());
            run.segments = existing;
            return Ok(StageFlow::Continue);
        }

        let source = prepared_source(run)?;
        let call_id = match self
            .writer
            .apply(WriteAction::BeginModelCall {
                job_id: Some(ctx.job.id.clone()),
                episode_ref: episode_ref.clone(),
                kind: ModelCallKind::Transcription,
                model_name: self.transcriber.model_name().to_string(),
                range: None,
                prompt: None,
            })
            .await?
        {
            ActionOutcome::ModelCallStarted { call_id } => call_id,
            other => {
                return Err(AppError::Arbitration(format!(
                    "unexpected outcome for begin_model_call: {:?}",
                    other
                )))
            }
        };

        let (segments, attempts) = match self.transcribe_with_retry(ctx, &source, call_id, reporter).await {
            Ok(result) => result,
            Err((attempts, e)) => {
                let message = match &e {
                    AppError::Cancelled => "interrupted: service shutting down".to_string(),
                    other => other.to_string(),
                };
                self.complete_call(call_id, ModelCallStatus::Failed, attempts, None, Some(message.clone()))
                    .await?;
                return Err(match e {
                    AppError::Cancelled => AppError::Cancelled,
                    AppError::InputData(_) => e,
                    _ => AppError::ModelCall { call_id, message },
                });
            }
        };

        if segments.is_empty() {
            let message = "transcriber returned no segments".to_string();
            self.complete_call(call_id, ModelCallStatus::Failed, attempts, None, Some(message.clone()))
                .await?;
            return Err(AppError::InputData(message));
        }

        let count = segments.len();
        if let Err(e) = self
            .writer
            .apply(WriteAction::AppendSegments {
                episode_ref: episode_ref.clone(),
                first_seq: 0,
                segments,
            })
            .await
        {
            self.complete_call(call_id, ModelCallStatus::Failed, attempts, None, Some(e.to_string()))
                .await?;
            return Err(e);
        }
        self.complete_call(
            call_id,
            ModelCallStatus::Succeeded,
            attempts,
            Some(format!("{} segments", count)),
            None,
        )
        .await?;

        run.segments = self.db.get_segments(episode_ref)?;
        Ok(StageFlow::Continue)
    }

    /// Returns the segments and attempt count, or the attempt count and the
    /// final error.
    async fn transcribe_with_retry(
        &self,
        ctx: &JobContext<'_>,
        source: &Path,
        call_id: i64,
        reporter: &ProgressReporter,
    ) -> Result<(Vec<NewSegment>, u32), (u32, AppError)> {
        let cfg = &self.config.transcription;
        let policy = RetryPolicy {
            max_retries: cfg.max_retries,
            initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.initial_backoff_ms.saturating_mul(8)),
        };
        let timeout = Duration::from_secs(cfg.timeout_secs.max(1));
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let call = tokio::time::timeout(
                timeout,
                self.transcriber
                    .transcribe(source, cfg.language.as_deref(), reporter),
            );
            // Cancelling a job lets the call finish; shutting down does not
            let result = tokio::select! {
                r = call => match r {
                    Ok(inner) => inner,
                    Err(_) => Err(AppError::Transient(format!("transcription timed out after {:?}", timeout))),
                },
                _ = ctx.shutdown.cancelled() => Err(AppError::Cancelled),
            };

            match result {
                Ok(segments) => return Ok((segments, attempts)),
                Err(e) if e.is_transient() && attempts <= policy.max_retries => {
                    let delay = policy.delay(attempts - 1);
                    log::warn!(
                        "Transcription attempt {} failed, retrying in {:?}: {}",
                        attempts,
                        delay,
                        e
                    );
                    if let Err(write_err) = self
                        .writer
                        .apply(WriteAction::RecordModelCallRetry {
                            call_id,
                            attempts,
                            error: e.to_string(),
                        })
                        .await
                    {
                        return Err((attempts, write_err));
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.shutdown.cancelled() => return Err((attempts, AppError::Cancelled)),
                    }
                }
                Err(e) if e.is_transient() => {
                    return Err((
                        attempts,
                        AppError::RetriesExhausted {
                            attempts,
                            last_error: e.to_string(),
                        },
                    ))
                }
                Err(e) => return Err((attempts, e)),
            }
        }
    }

    async fn complete_call(
        &self,
        call_id: i64,
        status: ModelCallStatus,
        attempts: u32,
        response: Option<String>,
        error: Option<String>,
    ) -> Result<(), AppError> {
        self.writer
            .apply(WriteAction::CompleteModelCall {
                call_id,
                status,
                attempts,
                response,
                error,
            })
            .await?;
        Ok(())
    }

    // ── Stage 2: classifying ───────────────────────────────────────────────

    async fn classify(
        &self,
        ctx: &JobContext<'_>,
        run: &mut JobRun,
        reporter: &ProgressReporter,
    ) -> Result<StageFlow, AppError> {
        let episode_ref = &ctx.job.episode_ref;
        let cfg = &self.config.classification;
        let identified = self.db.identified_seqs(episode_ref)?;

        let batches: Vec<&[TranscriptSegment]> = run.segments.chunks(cfg.batch_size.max(1)).collect();
        let total = batches.len();
        let pending: Vec<ClassificationRequest> = batches
            .iter()
            .filter(|batch| !batch.iter().all(|s| identified.contains(&s.seq)))
            .filter_map(|batch| {
                let first = batch.first()?;
                let last = batch.last()?;
                Some(ClassificationRequest {
                    job_id: Some(ctx.job.id.clone()),
                    episode_ref: episode_ref.clone(),
                    range: SegmentRange::new(first.seq, last.seq),
                    prompt: build_prompt(batch),
                })
            })
            .collect();

        let mut done = total - pending.len();
        if pending.is_empty() {
            log::info!("All {} classification batch(es) already identified", total);
            return Ok(StageFlow::Continue);
        }
        log::info!(
            "Classifying {} of {} batch(es) with {}",
            pending.len(),
            total,
            self.caller.model_name()
        );

        // Stops further dispatch on cancellation or the first failure
        let halt = ctx.cancel.child_token();
        let halt_ref = &halt;
        let caller: &RateLimitedCaller = &self.caller;
        let mut results = futures_util::stream::iter(pending)
            .map(move |request| async move {
                if halt_ref.is_cancelled() {
                    return None;
                }
                Some(caller.call(request, halt_ref).await)
            })
            .buffered(cfg.max_concurrency.max(1));

        let mut first_error: Option<AppError> = None;
        while let Some(result) = results.next().await {
            let persisted = match result {
                None => continue,
                Some(Ok(classified)) => {
                    done += 1;
                    let insert = WriteAction::InsertIdentifications {
                        call_id: classified.call_id,
                        episode_ref: episode_ref.clone(),
                        identifications: classified.identifications,
                    };
                    let progress = WriteAction::UpdateJobProgress {
                        job_id: ctx.job.id.clone(),
                        step: Stage::Classifying.step(),
                        step_name: Stage::Classifying.name().to_string(),
                        progress: Stage::Classifying.percent(done as f64 / total as f64),
                    };
                    reporter.report(done as f64 / total as f64);
                    match self.writer.apply(insert).await {
                        Ok(_) => self.apply_with_retry(progress).await.map(|_| ()),
                        Err(e) => Err(e),
                    }
                }
                // Released before dispatch by the halt
                Some(Err(AppError::Cancelled)) => continue,
                Some(Err(e)) => Err(e),
            };

            if let Err(e) = persisted {
                halt.cancel();
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        drop(results);

        if let Some(e) = first_error {
            return Err(e);
        }
        if ctx.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        Ok(StageFlow::Continue)
    }

    // ── Stage 3: resolving ─────────────────────────────────────────────────

    fn resolve(&self, ctx: &JobContext<'_>, run: &mut JobRun) -> Result<StageFlow, AppError> {
        let identifications = self.db.get_identifications(&ctx.job.episode_ref)?;
        run.intervals = resolver::resolve(&run.segments, &identifications, &self.config.resolver);
        let total: f64 = run.intervals.iter().map(AdInterval::length).sum();
        log::info!(
            "Resolved {} ad interval(s) covering {:.1}s",
            run.intervals.len(),
            total
        );
        Ok(StageFlow::Continue)
    }

    // ── Stage 4: splicing ──────────────────────────────────────────────────

    async fn splice(&self, ctx: &JobContext<'_>, run: &mut JobRun) -> Result<StageFlow, AppError> {
        let source = prepared_source(run)?;
        let output_dir = self.config.paths.output_dir();
        tokio::fs::create_dir_all(&output_dir).await?;
        let output = output_dir.join(format!(
            "{}-{}.wav",
            safe_file_stem(&ctx.job.episode_ref),
            ctx.job.id
        ));

        let intervals = run.intervals.clone();
        let splice_config = self.config.splice.clone();
        let out = output.clone();
        let report = tokio::task::spawn_blocking(move || {
            splice_wav(&source, &intervals, &out, &splice_config)
        })
        .await
        .map_err(|e| AppError::Other(format!("Splice task failed: {}", e)))??;

        let swap = WriteAction::SwapEpisodeOutput {
            episode_ref: ctx.job.episode_ref.clone(),
            job_id: ctx.job.id.clone(),
            output_path: output.to_string_lossy().to_string(),
            fingerprint: run.fingerprint.clone(),
            duration: report.output_duration,
        };
        match self.writer.apply(swap).await {
            Ok(ActionOutcome::OutputSwapped { previous }) => {
                log::info!(
                    "Output swapped to {:?} (previous: {:?}), removed {:.1}s",
                    output,
                    previous,
                    report.removed_duration
                );
                Ok(StageFlow::Continue)
            }
            Ok(other) => Err(AppError::Arbitration(format!(
                "unexpected outcome for swap_episode_output: {:?}",
                other
            ))),
            Err(e) => {
                if !e.is_arbitration() {
                    let _ = tokio::fs::remove_file(&output).await;
                }
                Err(e)
            }
        }
    }
}

fn prepared_source(run: &JobRun) -> Result<PathBuf, AppError> {
    run.source
        .clone()
        .ok_or_else(|| AppError::Other("source audio was not prepared".into()))
}

fn is_wav(path: &Path) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case("wav"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_full_pipeline_removes_ads() {
        let dir = TempDir::new().unwrap();
        let harness = Harness::new(&dir, HarnessOptions::default()).await;
        let episode = harness.write_episode("ep-1", 30.0);
        harness.submit("job-1", &episode, 0).await;

        let (job, status) = harness.run_one("job-1").await;
        assert_eq!(status, JobStatus::Completed, "{:?}", job.error_message);
        assert_eq!(job.progress, 100);
        assert_eq!(job.step_name, "done");

        let ep = harness.db.get_episode(&episode).unwrap().unwrap();
        let output = ep.output_path.unwrap();
        assert_eq!(job.output_path.as_deref(), Some(output.as_str()));
        // Segments 1 and 2 (5s-15s) are ads
        let duration = crate::worker::splice::wav_duration(Path::new(&output)).unwrap();
        assert!((duration - 20.0).abs() < 0.01, "duration {}", duration);
        assert!(ep.output_fingerprint.is_some());

        let calls = harness.db.get_model_calls_for_job("job-1").unwrap();
        let transcriptions = calls
            .iter()
            .filter(|c| c.kind == ModelCallKind::Transcription)
            .count();
        let classifications = calls
            .iter()
            .filter(|c| c.kind == ModelCallKind::Classification)
            .count();
        assert_eq!(transcriptions, 1);
        assert_eq!(classifications, 2);
        assert!(calls.iter().all(|c| c.status == ModelCallStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_unchanged_source_is_skipped_unless_forced() {
        let dir = TempDir::new().unwrap();
        let harness = Harness::new(&dir, HarnessOptions::default()).await;
        let episode = harness.write_episode("ep-1", 30.0);

        harness.submit("job-1", &episode, 0).await;
        assert_eq!(harness.run_one("job-1").await.1, JobStatus::Completed);

        harness.submit("job-2", &episode, 0).await;
        let (job, status) = harness.run_one("job-2").await;
        assert_eq!(status, JobStatus::Skipped);
        assert!(job.error_message.unwrap().contains("identical source"));

        harness.submit_forced("job-3", &episode).await;
        let (_, status) = harness.run_one("job-3").await;
        assert_eq!(status, JobStatus::Completed);
        // Transcript and identifications were reused
        assert_eq!(harness.transcriber.calls.load(Ordering::SeqCst), 1);
        assert_eq!(harness.backend.calls.load(Ordering::SeqCst), 2);
        assert!(harness.db.get_model_calls_for_job("job-3").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_source_fails_without_model_calls() {
        let dir = TempDir::new().unwrap();
        let harness = Harness::new(&dir, HarnessOptions::default()).await;
        let missing = dir.path().join("missing.wav").to_string_lossy().to_string();
        harness.submit("job-1", &missing, 0).await;

        let (job, status) = harness.run_one("job-1").await;
        assert_eq!(status, JobStatus::Failed);
        assert!(job.error_message.unwrap().starts_with("Invalid input"));
        assert_eq!(harness.transcriber.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transient_transcription_failures_are_retried() {
        let dir = TempDir::new().unwrap();
        let harness = Harness::new(
            &dir,
            HarnessOptions {
                transcribe_failures: 2,
                ..HarnessOptions::default()
            },
        )
        .await;
        let episode = harness.write_episode("ep-1", 30.0);
        harness.submit("job-1", &episode, 0).await;

        let (_, status) = harness.run_one("job-1").await;
        assert_eq!(status, JobStatus::Completed);

        let calls = harness.db.get_model_calls_for_job("job-1").unwrap();
        let transcription = calls
            .iter()
            .find(|c| c.kind == ModelCallKind::Transcription)
            .unwrap();
        assert_eq!(transcription.attempts, 3);
        assert_eq!(transcription.status, ModelCallStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_failed_classification_resumes_on_next_job() {
        let dir = TempDir::new().unwrap();
        let harness = Harness::new(&dir, HarnessOptions::default()).await;
        let episode = harness.write_episode("ep-1", 30.0);
        // Segment 5 lives in the second batch
        harness.backend.fail_on_seq(Some(5));

        harness.submit("job-1", &episode, 0).await;
        let (job, status) = harness.run_one("job-1").await;
        assert_eq!(status, JobStatus::Failed);
        let error = job.error_message.unwrap();
        assert!(error.starts_with("Model call"), "{}", error);

        let failed: Vec<_> = harness
            .db
            .get_model_calls_for_job("job-1")
            .unwrap()
            .into_iter()
            .filter(|c| c.status == ModelCallStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert!(error.contains(&format!("Model call {} failed", failed[0].id)));
        assert_eq!(harness.db.count_segments(&episode).unwrap(), 6);

        harness.backend.fail_on_seq(None);
        let before = harness.backend.calls.load(Ordering::SeqCst);
        harness.submit("job-2", &episode, 0).await;
        let (_, status) = harness.run_one("job-2").await;
        assert_eq!(status, JobStatus::Completed);
        // Only the failed batch is sent again
        assert_eq!(harness.backend.calls.load(Ordering::SeqCst), before + 1);
        assert_eq!(harness.transcriber.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_transcription() {
        let dir = TempDir::new().unwrap();
        let harness = Harness::new(
            &dir,
            HarnessOptions {
                transcribe_delay: Duration::from_secs(30),
                ..HarnessOptions::default()
            },
        )
        .await;
        let episode = harness.write_episode("ep-1", 30.0);
        harness.submit("job-1", &episode, 0).await;

        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            stopper.cancel();
        });
        let (job, status) = harness.run_one_with(shutdown, "job-1").await;
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(
            job.error_message.as_deref(),
            Some("interrupted: service shutting down")
        );
        let calls = harness.db.get_model_calls_for_job("job-1").unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].status, ModelCallStatus::Failed);
    }
}

//! Rate-limited model caller.
//!
//! Bounds in-flight classification calls with a fair semaphore, admits each
//! attempt against a token budget, retries transient failures with
//! exponential backoff and records exactly one `ModelCall` per call. Waiting
//! for a slot, for budget or for a backoff ends early on cancellation.

use super::{parse_classification, ClassificationBackend, OUTPUT_TOKENS_PER_SEGMENT};
use crate::config::ClassificationConfig;
use crate::database::actions::{ActionOutcome, WriteAction};
use crate::database::{ModelCallKind, ModelCallStatus, NewIdentification, SegmentRange};
use crate::error::AppError;
use crate::writer::WriterHandle;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

/// Recorded on calls abandoned while queued.
pub const CANCELLED_BEFORE_DISPATCH: &str = "cancelled before dispatch";

/// Exponential backoff: `initial * 2^n`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Token budget of `capacity` per `window`, refilled continuously.
///
/// Waiters queue on a fair mutex, so admission follows submission order.
pub struct TokenWindow {
    capacity: NonZeroU32,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    queue: Mutex<()>,
}

impl TokenWindow {
    /// `None` when `capacity` is zero, i.e. the budget is disabled.
    pub fn new(capacity: u32, window: Duration) -> Option<Self> {
        let burst = NonZeroU32::new(capacity)?;
        let period = (window / capacity).max(Duration::from_nanos(1));
        let quota = Quota::with_period(period)?.allow_burst(burst);
        Some(Self {
            capacity: burst,
            limiter: RateLimiter::direct(quota),
            queue: Mutex::new(()),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity.get()
    }

    /// Wait until `tokens` are available, then spend them.
    pub async fn reserve(&self, tokens: u32) -> Result<(), AppError> {
        if tokens > self.capacity.get() {
            return Err(AppError::Permanent(format!(
                "estimated {} tokens exceeds the window budget of {}",
                tokens, self.capacity
            )));
        }
        let Some(tokens) = NonZeroU32::new(tokens) else {
            return Ok(());
        };

        // Held across the wait so later callers queue behind us
        let _turn = self.queue.lock().await;
        self.limiter
            .until_n_ready(tokens)
            .await
            .map_err(|e| AppError::Permanent(e.to_string()))
    }
}

/// One classification request for a contiguous range of segments.
#[derive(Debug, Clone)]
pub struct ClassificationRequest {
    pub job_id: Option<String>,
    pub episode_ref: String,
    pub range: SegmentRange,
    pub prompt: String,
}

#[derive(Debug, Clone)]
pub struct ClassificationResult {
    pub call_id: i64,
    pub range: SegmentRange,
    pub attempts: u32,
    pub identifications: Vec<NewIdentification>,
}

/// Token estimate: prompt chars / 4 plus expected output per segment.
pub fn estimate_tokens(prompt: &str, range: SegmentRange) -> u32 {
    let prompt_tokens = (prompt.chars().count() as u32).div_ceil(4);
    prompt_tokens + range.len() as u32 * OUTPUT_TOKENS_PER_SEGMENT
}

pub struct RateLimitedCaller {
    backend: Arc<dyn ClassificationBackend>,
    writer: WriterHandle,
    permits: Semaphore,
    budget: Option<TokenWindow>,
    max_tokens_per_call: Option<u32>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl RateLimitedCaller {
    pub fn new(
        backend: Arc<dyn ClassificationBackend>,
        writer: WriterHandle,
        config: &ClassificationConfig,
    ) -> Self {
        let budget = TokenWindow::new(config.tokens_per_window, config.window());
        Self {
            backend,
            writer,
            permits: Semaphore::new(config.max_concurrency.max(1)),
            budget,
            max_tokens_per_call: config.max_tokens_per_call,
            policy: RetryPolicy {
                max_retries: config.max_retries,
                initial_backoff: Duration::from_millis(config.initial_backoff_ms),
                max_backoff: Duration::from_millis(config.max_backoff_ms),
            },
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    /// Classify one range.
    ///
    /// Model failures come back as `AppError::ModelCall` carrying the record
    /// id; writer errors are returned unchanged so the stage can be re-run.
    /// If `cancel` fires before the request is sent, the record is closed as
    /// failed and `AppError::Cancelled` is returned. A request already sent
    /// is allowed to finish.
    pub async fn call(
        &self,
        request: ClassificationRequest,
        cancel: &CancellationToken,
    ) -> Result<ClassificationResult, AppError> {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        let call_id = match self
            .writer
            .apply(WriteAction::BeginModelCall {
                job_id: request.job_id.clone(),
                episode_ref: request.episode_ref.clone(),
                kind: ModelCallKind::Classification,
                model_name: self.backend.model_name().to_string(),
                range: Some(request.range),
                prompt: Some(request.prompt.clone()),
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

        let estimate = estimate_tokens(&request.prompt, request.range);
        if let Some(ceiling) = self.max_tokens_per_call {
            if estimate > ceiling {
                let err = AppError::Permanent(format!(
                    "estimated {} tokens exceeds the per-call ceiling of {}",
                    estimate, ceiling
                ));
                return self.fail(call_id, 0, err).await;
            }
        }
        if let Some(budget) = &self.budget {
            if estimate > budget.capacity() {
                let err = AppError::Permanent(format!(
                    "estimated {} tokens exceeds the window budget of {}",
                    estimate,
                    budget.capacity()
                ));
                return self.fail(call_id, 0, err).await;
            }
        }

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.abandon(call_id, 0).await,
            permit = self.permits.acquire() => {
                permit.map_err(|_| AppError::Other("model caller closed".into()))?
            }
        };

        let mut attempts = 0u32;
        loop {
            if let Some(budget) = &self.budget {
                let admitted = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return self.abandon(call_id, attempts).await,
                    admitted = budget.reserve(estimate) => admitted,
                };
                if let Err(e) = admitted {
                    return self.fail(call_id, attempts, e).await;
                }
            }
            attempts += 1;

            let outcome = match tokio::time::timeout(self.timeout, self.backend.classify(&request.prompt)).await {
                Ok(result) => result,
                Err(_) => Err(AppError::Transient(format!(
                    "classification timed out after {:?}",
                    self.timeout
                ))),
            };

            match outcome {
                Ok(raw) => match parse_classification(&raw, request.range) {
                    Ok(identifications) => {
                        self.writer
                            .apply(WriteAction::CompleteModelCall {
                                call_id,
                                status: ModelCallStatus::Succeeded,
                                attempts,
                                response: Some(raw),
                                error: None,
                            })
                            .await?;
                        return Ok(ClassificationResult {
                            call_id,
                            range: request.range,
                            attempts,
                            identifications,
                        });
                    }
                    Err(e) => return self.fail(call_id, attempts, e).await,
                },
                Err(e) if e.is_transient() && attempts <= self.policy.max_retries => {
                    let delay = self.policy.delay(attempts - 1);
                    log::warn!(
                        "Model call {} attempt {} failed, retrying in {:?}: {}",
                        call_id,
                        attempts,
                        delay,
                        e
                    );
                    self.writer
                        .apply(WriteAction::RecordModelCallRetry {
                            call_id,
                            attempts,
                            error: e.to_string(),
                        })
                        .await?;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return self.abandon(call_id, attempts).await,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) if e.is_transient() => {
                    let exhausted = AppError::RetriesExhausted {
                        attempts,
                        last_error: e.to_string(),
                    };
                    return self.fail(call_id, attempts, exhausted).await;
                }
                Err(e) => return self.fail(call_id, attempts, e).await,
            }
        }
    }

    async fn fail(
        &self,
        call_id: i64,
        attempts: u32,
        error: AppError,
    ) -> Result<ClassificationResult, AppError> {
        let message = error.to_string();
        log::warn!("Model call {} failed: {}", call_id, message);
        self.writer
            .apply(WriteAction::CompleteModelCall {
                call_id,
                status: ModelCallStatus::Failed,
                attempts,
                response: None,
                error: Some(message.clone()),
            })
            .await?;
        Err(AppError::ModelCall { call_id, message })
    }

    async fn abandon(&self, call_id: i64, attempts: u32) -> Result<ClassificationResult, AppError> {
        log::info!("Model call {} {}", call_id, CANCELLED_BEFORE_DISPATCH);
        self.writer
            .apply(WriteAction::CompleteModelCall {
                call_id,
                status: ModelCallStatus::Failed,
                attempts,
                response: None,
                error: Some(CANCELLED_BEFORE_DISPATCH.to_string()),
            })
            .await?;
        Err(AppError::Cancelled)
    }
}

pub mod classifier;
pub mod commands;
pub mod config;
pub mod database;
pub mod error;
pub mod resolver;
pub mod worker;
pub mod writer;

use classifier::limiter::RateLimitedCaller;
use classifier::{ClassificationBackend, OllamaClassifier};
use commands::AppState;
use config::AppConfig;
use database::Database;
use error::AppError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use worker::cleanup::{cleanup_agent, CleanupSweeper};
use worker::pipeline::JobExecutor;
use worker::transcribe::{Transcriber, WhisperCliTranscriber};
use worker::JobScheduler;
use writer::{spawn_writer, WriterHandle};

/// How long shutdown waits for background tasks before giving up on them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Install the global subscriber. `RUST_LOG` wins over `level`; `log`
/// records are forwarded into tracing.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    // A second call (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Start the writer on the configured store and open a read-only handle
/// next to it.
pub fn open_store(
    config: &AppConfig,
) -> Result<(WriterHandle, JoinHandle<()>, Arc<Database>), AppError> {
    config.ensure_dirs()?;
    let db_path = config.paths.database_path();
    let (writer, writer_task) = spawn_writer(
        &db_path,
        &config.paths.changelog_path(),
        config.scheduler.writer_queue_capacity,
    )?;
    let db = Arc::new(Database::open(&db_path)?);
    log::info!("Store opened at {:?}", db_path);
    Ok((writer, writer_task, db))
}

/// A booted service: command state plus the background tasks behind it.
pub struct Service {
    pub state: AppState,
    shutdown: CancellationToken,
    scheduler_task: JoinHandle<()>,
    cleanup_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

/// Boot with the whisper-cli transcriber and the Ollama classifier.
pub async fn boot(config: AppConfig) -> Result<Service, AppError> {
    let transcriber = Arc::new(WhisperCliTranscriber::new(
        &config.transcription,
        config.paths.work_dir(),
    ));
    let backend = Arc::new(OllamaClassifier::new(&config.classification)?);
    match backend.health_check().await {
        Ok(true) => log::info!("Classifier {} is available", config.classification.model),
        Ok(false) => log::warn!(
            "Classifier model {} not found on {}; classification will fail until it is pulled",
            config.classification.model,
            config.classification.base_url
        ),
        Err(e) => log::warn!("Classifier health check failed: {}", e),
    }
    boot_with(config, transcriber, backend).await
}

/// Boot with caller-supplied collaborators.
pub async fn boot_with(
    config: AppConfig,
    transcriber: Arc<dyn Transcriber>,
    backend: Arc<dyn ClassificationBackend>,
) -> Result<Service, AppError> {
    config.validate()?;
    let (writer, writer_task, db) = open_store(&config)?;
    let config = Arc::new(config);

    let caller = Arc::new(RateLimitedCaller::new(
        backend,
        writer.clone(),
        &config.classification,
    ));
    let executor = Arc::new(JobExecutor::new(
        db.clone(),
        writer.clone(),
        transcriber,
        caller,
        config.clone(),
    )?);
    let (scheduler, handle) = JobScheduler::new(
        db.clone(),
        writer.clone(),
        executor,
        config.scheduler.concurrency,
        Duration::from_secs(config.scheduler.poll_interval_secs.max(1)),
    );
    let sweeper = Arc::new(CleanupSweeper::new(
        db.clone(),
        writer.clone(),
        config.cleanup.retention_days,
    ));

    let shutdown = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));
    let cleanup_task = tokio::spawn(cleanup_agent(
        sweeper.clone(),
        Duration::from_secs(config.cleanup.interval_secs.max(1)),
        shutdown.clone(),
    ));

    log::info!(
        "Service started: {} worker slot(s), data in {:?}",
        config.scheduler.concurrency,
        config.paths.data_dir
    );

    Ok(Service {
        state: AppState {
            db,
            writer,
            scheduler: handle,
            sweeper,
            config,
        },
        shutdown,
        scheduler_task,
        cleanup_task,
        writer_task,
    })
}

impl Service {
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Run until `stop` resolves, then shut down. Losing the writer is fatal:
    /// every task is stopped and `WriterUnavailable` is returned.
    pub async fn run_until<F, T>(mut self, stop: F) -> Result<T, AppError>
    where
        F: Future<Output = T>,
    {
        let value = tokio::select! {
            value = stop => value,
            result = &mut self.writer_task => {
                match result {
                    Ok(()) => log::error!("Writer service stopped unexpectedly"),
                    Err(e) => log::error!("Writer service crashed: {}", e),
                }
                self.shutdown.cancel();
                let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
                    let _ = (&mut self.scheduler_task).await;
                    let _ = (&mut self.cleanup_task).await;
                })
                .await;
                return Err(AppError::WriterUnavailable);
            }
        };
        self.shutdown().await;
        Ok(value)
    }

    /// Stop scheduling, interrupt running transcriptions, and wait for the
    /// background tasks to finish.
    pub async fn shutdown(self) {
        log::info!("Shutting down");
        self.shutdown.cancel();
        // The writer is left running: it drains and stops once the last
        // handle, including clones held by callers, is dropped
        let Service {
            scheduler_task,
            cleanup_task,
            ..
        } = self;

        let tasks = async {
            if let Err(e) = scheduler_task.await {
                log::error!("Scheduler task failed: {}", e);
            }
            if let Err(e) = cleanup_task.await {
                log::error!("Cleanup task failed: {}", e);
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, tasks).await.is_err() {
            log::warn!("Background tasks did not stop within {:?}", SHUTDOWN_GRACE);
        }
        log::info!("Shutdown complete");
    }
}

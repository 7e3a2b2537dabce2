//! Daemon startup and main loop
//!
//! Wires the configuration into a queue, a limiter, a pipeline and a worker
//! pool, and runs them next to the metrics endpoint.

use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError};
use crate::encode::{encoder_from_config, RenditionEncoder};
use crate::jobs::JobDescriptor;
use crate::limiter::ConcurrencyLimiter;
use crate::metrics::{collect_system_metrics, new_shared_metrics, SharedMetrics};
use crate::metrics_server::run_metrics_server;
use crate::pipeline::{cancel_grace_for, PipelineSettings, TranscodePipeline};
use crate::queue::{FileQueue, JobQueue, QueueError, QueueSettings};
use crate::startup::{run_startup_checks, StartupError};
use crate::worker::{WorkerPool, WorkerSettings};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Interval between metrics snapshot refreshes.
const METRICS_REFRESH: Duration = Duration::from_millis(500);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Job queue error
    #[error("Job queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Derived concurrency plan
    pub concurrency_plan: ConcurrencyPlan,
    /// Shared metrics state
    pub metrics: SharedMetrics,
    queue: Arc<FileQueue>,
    limiter: ConcurrencyLimiter,
    pipeline: Arc<TranscodePipeline>,
}

impl Daemon {
    /// Initialize the daemon with configuration from file
    ///
    /// Loads the config (file, then environment overrides), runs the startup
    /// checks and opens the job queue.
    pub async fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::with_config(config).await
    }

    /// Initialize the daemon with an existing configuration
    pub async fn with_config(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Self::new_without_checks(config)
    }

    /// Initialize the daemon without running startup checks
    ///
    /// Useful when the encoder binary is not installed on this host.
    pub fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        let encoder = encoder_from_config(&config.encoder);
        Self::with_encoder(config, encoder)
    }

    /// Initialize the daemon around a specific encoder strategy.
    pub fn with_encoder(
        config: Config,
        encoder: Arc<dyn RenditionEncoder>,
    ) -> Result<Self, DaemonError> {
        let concurrency_plan = derive_plan(&config);
        info!(
            cores = concurrency_plan.total_cores,
            target_threads = concurrency_plan.target_threads,
            job_slots = concurrency_plan.job_slots,
            encoder_processes = concurrency_plan.encoder_processes,
            encoder = encoder.name(),
            "concurrency plan"
        );

        let queue_settings = QueueSettings::from_config(&config);
        let cancel_grace = cancel_grace_for(queue_settings.lease_timeout);
        let queue = Arc::new(FileQueue::open(queue_settings)?);
        let limiter = ConcurrencyLimiter::new(concurrency_plan.encoder_processes as usize);
        let pipeline = Arc::new(TranscodePipeline::new(
            limiter.clone(),
            encoder,
            PipelineSettings {
                output_root: config.paths.output_dir.clone(),
                min_progress_delta: config.progress.min_delta_percent,
                cancel_grace,
            },
        ));

        Ok(Self {
            config,
            concurrency_plan,
            metrics: new_shared_metrics(),
            queue,
            limiter,
            pipeline,
        })
    }

    /// Submit a job to the queue; returns its id.
    pub async fn submit_job(&self, descriptor: JobDescriptor) -> Result<String, DaemonError> {
        Ok(self.queue.enqueue(descriptor).await?)
    }

    pub fn queue(&self) -> Arc<FileQueue> {
        self.queue.clone()
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Get the shared metrics
    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(
            self.queue.clone(),
            self.pipeline.clone(),
            WorkerSettings {
                job_slots: self.concurrency_plan.job_slots as usize,
                input_dir: self.config.paths.input_dir.clone(),
                retry_failed_jobs: self.config.workers.retry_failed_jobs,
            },
        )
    }

    /// Rebuild the job and limiter parts of the metrics snapshot.
    pub async fn refresh_metrics(&self) -> Result<(), DaemonError> {
        refresh_snapshot(&self.metrics, self.queue.as_ref(), &self.limiter).await?;
        Ok(())
    }

    /// Start the metrics HTTP server
    ///
    /// Spawns the HTTP server as a background task.
    pub fn start_metrics_server(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let metrics = self.metrics.clone();
        let bind = self.config.server.bind.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(metrics, &bind, shutdown).await {
                error!(bind = %bind, error = %e, "metrics server failed");
            }
        })
    }

    /// Start the metrics update task
    ///
    /// Periodically refreshes job, limiter and system metrics in the shared state.
    pub fn start_metrics_updater(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let metrics = self.metrics.clone();
        let queue = self.queue.clone();
        let limiter = self.limiter.clone();
        tokio::spawn(async move {
            loop {
                let system = collect_system_metrics();
                metrics.write().await.system = system;
                if let Err(e) = refresh_snapshot(&metrics, queue.as_ref(), &limiter).await {
                    warn!(error = %e, "failed to refresh job metrics");
                }

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(METRICS_REFRESH) => {}
                }
            }
        })
    }

    /// Run the worker pool until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), DaemonError> {
        info!(
            input_dir = %self.config.paths.input_dir.display(),
            output_dir = %self.config.paths.output_dir.display(),
            state_dir = %self.config.queue.state_dir.display(),
            "daemon running"
        );
        self.worker_pool().run(shutdown).await;
        info!("daemon stopped");
        Ok(())
    }

    /// Run the daemon with all background tasks
    ///
    /// Starts the metrics server (when enabled), the metrics updater and the
    /// worker pool, and waits for all of them after `shutdown` fires.
    pub async fn run_with_server(&self, shutdown: CancellationToken) -> Result<(), DaemonError> {
        let server = self
            .config
            .server
            .enabled
            .then(|| self.start_metrics_server(shutdown.clone()));
        let updater = self.start_metrics_updater(shutdown.clone());

        let result = self.run(shutdown.clone()).await;

        shutdown.cancel();
        let _ = updater.await;
        if let Some(server) = server {
            let _ = server.await;
        }
        result
    }
}

async fn refresh_snapshot(
    metrics: &SharedMetrics,
    queue: &dyn JobQueue,
    limiter: &ConcurrencyLimiter,
) -> Result<(), QueueError> {
    let jobs = queue.list().await?;
    let mut snapshot = metrics.write().await;
    snapshot.refresh_jobs(&jobs);
    snapshot.refresh_limiter(limiter);
    Ok(())
}

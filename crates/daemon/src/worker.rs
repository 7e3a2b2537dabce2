//! Worker pool consuming leased jobs.
//!
//! Each job slot runs a loop: lease a job, run it through the pipeline while
//! a heartbeat keeps the lease alive, then acknowledge the outcome. When the
//! lease cannot be kept the pipeline is cancelled and the attempt is
//! abandoned without an acknowledgement; the queue redelivers the job once
//! the lease has expired.

use crate::pipeline::{PipelineError, PipelineJob, TranscodePipeline};
use crate::queue::{JobQueue, Lease, LeasedJob, QueueError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after a failed lease call before trying again.
const LEASE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Settings for the worker pool
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Jobs processed concurrently.
    pub job_slots: usize,
    /// Relative input paths are resolved against this directory.
    pub input_dir: PathBuf,
    /// Ask the queue to redeliver jobs whose failure may be transient.
    pub retry_failed_jobs: bool,
}

/// Pool of job slots sharing one queue and one pipeline.
#[derive(Clone)]
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    pipeline: Arc<TranscodePipeline>,
    settings: WorkerSettings,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        pipeline: Arc<TranscodePipeline>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            pipeline,
            settings,
        }
    }

    /// Run all job slots until `shutdown` fires.
    ///
    /// Jobs in flight at shutdown are cancelled and left unacknowledged.
    pub async fn run(&self, shutdown: CancellationToken) {
        let slots = self.settings.job_slots.max(1);
        info!(slots, input_dir = %self.settings.input_dir.display(), "worker pool started");

        let mut tasks = JoinSet::new();
        for slot in 0..slots {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move { worker.slot_loop(slot, shutdown).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker slot panicked");
            }
        }

        info!("worker pool stopped");
    }

    async fn slot_loop(&self, slot: usize, shutdown: CancellationToken) {
        debug!(slot, "worker slot started");
        loop {
            let leased = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                leased = self.queue.lease() => leased,
            };

            match leased {
                Ok(leased) => self.process(slot, leased, &shutdown).await,
                Err(e) => {
                    error!(slot, error = %e, "failed to lease a job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(LEASE_RETRY_DELAY) => {}
                    }
                }
            }
        }
        debug!(slot, "worker slot stopped");
    }

    /// How far ahead of the lease deadline an unrenewed attempt is cancelled:
    /// the pipeline's cancel grace plus a tenth of the lease for slack.
    fn stop_margin(&self) -> Duration {
        self.pipeline.settings().cancel_grace + self.queue.lease_timeout() / 10
    }

    fn resolve_input(&self, input: &Path) -> PathBuf {
        if input.is_absolute() {
            input.to_path_buf()
        } else {
            self.settings.input_dir.join(input)
        }
    }

    async fn process(&self, slot: usize, leased: LeasedJob, shutdown: &CancellationToken) {
        let LeasedJob { job, lease } = leased;
        let input = self.resolve_input(&job.input_path);
        info!(slot, job_id = %job.id, attempt = lease.attempt, input = %input.display(), "job started");

        if !input.is_file() {
            let reason = format!("input not found: {}", input.display());
            self.acknowledge_failure(&lease, &reason, false).await;
            return;
        }

        let job_cancel = shutdown.child_token();
        let lease_lost = CancellationToken::new();

        let heartbeat = tokio::spawn(keep_lease(
            self.queue.clone(),
            lease.clone(),
            self.stop_margin(),
            job_cancel.clone(),
            lease_lost.clone(),
        ));

        let (progress_tx, progress_rx) = mpsc::unbounded_channel::<u8>();
        let forwarder = tokio::spawn(forward_progress(
            self.queue.clone(),
            lease.clone(),
            progress_rx,
            job_cancel.clone(),
            lease_lost.clone(),
        ));

        let pipeline_job = PipelineJob {
            id: job.id.clone(),
            input,
            renditions: job.renditions.clone(),
        };
        let outcome = self
            .pipeline
            .run(
                &pipeline_job,
                move |percent| {
                    let _ = progress_tx.send(percent);
                },
                job_cancel.clone(),
            )
            .await;

        // The progress sender went away with the callback; flush what is left
        // before acknowledging so no report can land after the ack.
        if let Err(e) = forwarder.await {
            warn!(job_id = %job.id, error = %e, "progress forwarder failed");
        }
        heartbeat.abort();
        let _ = heartbeat.await;

        if lease_lost.is_cancelled() {
            warn!(job_id = %job.id, attempt = lease.attempt, "lease lost, attempt abandoned");
            return;
        }

        match outcome {
            Ok(result) => match self.queue.ack_success(&lease, result).await {
                Ok(()) => info!(slot, job_id = %job.id, attempt = lease.attempt, "job completed"),
                Err(e) => warn!(job_id = %job.id, error = %e, "could not acknowledge success"),
            },
            Err(PipelineError::Cancelled) if shutdown.is_cancelled() => {
                info!(job_id = %job.id, "job interrupted by shutdown, left for redelivery");
            }
            Err(e) => {
                let retry = self.settings.retry_failed_jobs && e.is_retryable();
                self.acknowledge_failure(&lease, &e.to_string(), retry).await;
            }
        }
    }

    async fn acknowledge_failure(&self, lease: &Lease, reason: &str, retry: bool) {
        match self.queue.ack_failure(lease, reason, retry).await {
            Ok(status) => {
                warn!(job_id = %lease.job_id, attempt = lease.attempt, status = %status, error = reason, "job attempt failed")
            }
            Err(e) => warn!(job_id = %lease.job_id, error = %e, "could not acknowledge failure"),
        }
    }
}

/// Renew `lease` every third of the lease timeout.
///
/// The attempt is given up `stop_margin` ahead of the queue's deadline: when a
/// renewal is refused or has not completed by then, `lease_lost` is marked and
/// `job_cancel` fires, leaving the pipeline that much time to stop its
/// encoders before the job can be delivered again.
async fn keep_lease(
    queue: Arc<dyn JobQueue>,
    lease: Lease,
    stop_margin: Duration,
    job_cancel: CancellationToken,
    lease_lost: CancellationToken,
) {
    let interval = (queue.lease_timeout() / 3).max(Duration::from_millis(1));
    let mut deadline = lease.deadline;

    loop {
        let stop_at = deadline.checked_sub(stop_margin).unwrap_or_else(Instant::now);
        let wake = (Instant::now() + interval).min(stop_at);
        tokio::select! {
            _ = job_cancel.cancelled() => return,
            _ = tokio::time::sleep_until(wake) => {}
        }
        if Instant::now() >= stop_at {
            warn!(job_id = %lease.job_id, attempt = lease.attempt, "lease about to expire without renewal");
            break;
        }

        match tokio::time::timeout_at(stop_at, queue.extend_lease(&lease)).await {
            Ok(Ok(renewed)) => deadline = renewed,
            Ok(Err(e)) => {
                warn!(job_id = %lease.job_id, attempt = lease.attempt, error = %e, "lease renewal refused");
                break;
            }
            Err(_) => {
                warn!(job_id = %lease.job_id, attempt = lease.attempt, "lease renewal did not complete in time");
                break;
            }
        }
    }

    lease_lost.cancel();
    job_cancel.cancel();
}

/// Pass pipeline progress on to the queue until the pipeline finishes.
async fn forward_progress(
    queue: Arc<dyn JobQueue>,
    lease: Lease,
    mut rx: mpsc::UnboundedReceiver<u8>,
    job_cancel: CancellationToken,
    lease_lost: CancellationToken,
) {
    while let Some(mut percent) = rx.recv().await {
        // Only the newest value matters when reports pile up
        while let Ok(newer) = rx.try_recv() {
            percent = newer;
        }
        match queue.report_progress(&lease, percent).await {
            Ok(()) => {}
            Err(QueueError::LeaseLost(_)) => {
                lease_lost.cancel();
                job_cancel.cancel();
            }
            Err(e) => warn!(job_id = %lease.job_id, percent, error = %e, "failed to record progress"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{Job, JobDescriptor, JobResult, JobStatus};
    use crate::limiter::ConcurrencyLimiter;
    use crate::pipeline::{cancel_grace_for, PipelineSettings};
    use crate::queue::{FileQueue, QueueSettings};
    use crate::rendition::default_catalog;
    use crate::test_support::ScriptedEncoder;
    use async_trait::async_trait;
    use std::fs;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        input_dir: PathBuf,
        output_dir: PathBuf,
        queue: Arc<FileQueue>,
        encoder: Arc<ScriptedEncoder>,
    }

    fn harness(lease_ms: u64, max_attempts: u32, encoder: ScriptedEncoder) -> Harness {
        let dir = TempDir::new().unwrap();
        let input_dir = dir.path().join("uploads");
        let output_dir = dir.path().join("output");
        fs::create_dir_all(&input_dir).unwrap();
        let queue = FileQueue::open(QueueSettings {
            state_dir: dir.path().join("state"),
            lease_timeout: Duration::from_millis(lease_ms),
            max_attempts,
            poll_interval: Duration::from_millis(10),
            default_renditions: default_catalog(),
        })
        .unwrap();
        Harness {
            _dir: dir,
            input_dir,
            output_dir,
            queue: Arc::new(queue),
            encoder: Arc::new(encoder),
        }
    }

    fn pool(h: &Harness, queue: Arc<dyn JobQueue>, slots: usize, limiter: usize) -> WorkerPool {
        let pipeline = TranscodePipeline::new(
            ConcurrencyLimiter::new(limiter),
            h.encoder.clone(),
            PipelineSettings {
                output_root: h.output_dir.clone(),
                min_progress_delta: 1,
                cancel_grace: cancel_grace_for(h.queue.lease_timeout()),
            },
        );
        WorkerPool::new(
            queue,
            Arc::new(pipeline),
            WorkerSettings {
                job_slots: slots,
                input_dir: h.input_dir.clone(),
                retry_failed_jobs: true,
            },
        )
    }

    async fn wait_for_terminal(queue: &FileQueue, count: usize) -> Vec<Job> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let jobs = queue.list().await.unwrap();
            if jobs.iter().filter(|j| j.is_terminal()).count() >= count {
                return jobs;
            }
            assert!(Instant::now() < deadline, "jobs did not finish: {:?}", jobs);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_pool_transcodes_queued_jobs() {
        let h = harness(60_000, 3, ScriptedEncoder::new(4, Duration::from_millis(2)));
        for name in ["a", "b", "c"] {
            fs::write(h.input_dir.join(format!("{}.mp4", name)), b"video").unwrap();
            h.queue
                .enqueue(JobDescriptor::new(format!("{}.mp4", name)).with_id(name))
                .await
                .unwrap();
        }

        let pool = pool(&h, h.queue.clone(), 2, 3);
        let shutdown = CancellationToken::new();
        let running = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pool.run(shutdown).await })
        };

        let jobs = wait_for_terminal(&h.queue, 3).await;
        shutdown.cancel();
        running.await.unwrap();

        for job in jobs {
            assert_eq!(job.status, JobStatus::Succeeded, "{:?}", job.error);
            assert_eq!(job.progress, 100);
            let result = job.result.unwrap();
            assert_eq!(result.manifest_path, h.output_dir.join(&job.id).join("master.m3u8"));
            assert!(result.manifest_path.exists());
            assert_eq!(result.renditions.len(), 4);
        }
        assert!(h.encoder.peak() <= 3);
    }

    #[tokio::test]
    async fn test_missing_input_fails_without_retry() {
        let h = harness(60_000, 3, ScriptedEncoder::new(1, Duration::from_millis(1)));
        h.queue
            .enqueue(JobDescriptor::new("nowhere.mp4").with_id("missing"))
            .await
            .unwrap();

        let pool = pool(&h, h.queue.clone(), 1, 1);
        let shutdown = CancellationToken::new();
        let running = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pool.run(shutdown).await })
        };

        let jobs = wait_for_terminal(&h.queue, 1).await;
        shutdown.cancel();
        running.await.unwrap();

        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert_eq!(jobs[0].attempts, 1);
        assert!(jobs[0].error.as_deref().unwrap().contains("input not found"));
        assert_eq!(h.encoder.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failing_rendition_is_retried_until_attempts_run_out() {
        let h = harness(
            60_000,
            2,
            ScriptedEncoder::new(5, Duration::from_millis(5)).failing_at(720),
        );
        fs::write(h.input_dir.join("v.mp4"), b"video").unwrap();
        h.queue.enqueue(JobDescriptor::new("v.mp4").with_id("v")).await.unwrap();

        let pool = pool(&h, h.queue.clone(), 1, 4);
        let shutdown = CancellationToken::new();
        let running = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pool.run(shutdown).await })
        };

        let jobs = wait_for_terminal(&h.queue, 1).await;
        shutdown.cancel();
        running.await.unwrap();

        let job = &jobs[0];
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
        assert!(job.error.as_deref().unwrap().contains("720p"));
        assert!(!h.output_dir.join("v/master.m3u8").exists());
        assert_eq!(h.encoder.running(), 0);
    }

    /// Renewals of every job's first delivery never succeed.
    struct FirstRenewalFails {
        inner: Arc<FileQueue>,
        /// Never answer instead of refusing.
        hang: bool,
    }

    impl FirstRenewalFails {
        fn refusing(inner: Arc<FileQueue>) -> Arc<dyn JobQueue> {
            Arc::new(Self { inner, hang: false })
        }

        fn hanging(inner: Arc<FileQueue>) -> Arc<dyn JobQueue> {
            Arc::new(Self { inner, hang: true })
        }
    }

    #[async_trait]
    impl JobQueue for FirstRenewalFails {
        async fn enqueue(&self, descriptor: JobDescriptor) -> Result<String, QueueError> {
            self.inner.enqueue(descriptor).await
        }
        async fn lease(&self) -> Result<LeasedJob, QueueError> {
            self.inner.lease().await
        }
        async fn extend_lease(&self, lease: &Lease) -> Result<Instant, QueueError> {
            if lease.attempt == 1 {
                if self.hang {
                    std::future::pending::<()>().await;
                }
                return Err(QueueError::LeaseLost(lease.job_id.clone()));
            }
            self.inner.extend_lease(lease).await
        }
        async fn report_progress(&self, lease: &Lease, percent: u8) -> Result<(), QueueError> {
            self.inner.report_progress(lease, percent).await
        }
        async fn ack_success(&self, lease: &Lease, result: JobResult) -> Result<(), QueueError> {
            self.inner.ack_success(lease, result).await
        }
        async fn ack_failure(
            &self,
            lease: &Lease,
            error: &str,
            retry: bool,
        ) -> Result<JobStatus, QueueError> {
            self.inner.ack_failure(lease, error, retry).await
        }
        async fn get(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
            self.inner.get(job_id).await
        }
        async fn list(&self) -> Result<Vec<Job>, QueueError> {
            self.inner.list().await
        }
        fn lease_timeout(&self) -> Duration {
            self.inner.lease_timeout()
        }
    }

    async fn run_until_terminal(h: &Harness, pool: WorkerPool) -> Job {
        let shutdown = CancellationToken::new();
        let running = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pool.run(shutdown).await })
        };

        let jobs = wait_for_terminal(&h.queue, 1).await;
        shutdown.cancel();
        running.await.unwrap();
        jobs.into_iter().next().unwrap()
    }

    #[tokio::test]
    async fn test_lost_lease_cancels_encoders_and_job_is_redelivered() {
        let h = harness(300, 3, ScriptedEncoder::new(30, Duration::from_millis(20)));
        fs::write(h.input_dir.join("v.mp4"), b"video").unwrap();
        h.queue.enqueue(JobDescriptor::new("v.mp4").with_id("v")).await.unwrap();

        let pool = pool(&h, FirstRenewalFails::refusing(h.queue.clone()), 2, 8);
        let job = run_until_terminal(&h, pool).await;

        assert_eq!(job.status, JobStatus::Succeeded, "{:?}", job.error);
        assert_eq!(job.attempts, 2);
        assert_eq!(h.encoder.cancelled.load(Ordering::SeqCst), 4);
        assert_eq!(h.encoder.succeeded.load(Ordering::SeqCst), 4);
        // the limiter has room for both attempts, so only ordering keeps them apart
        assert_eq!(h.encoder.job_peak("v"), 4);
    }

    #[tokio::test]
    async fn test_unanswered_renewal_stops_attempt_before_redelivery() {
        let h = harness(
            400,
            3,
            ScriptedEncoder::new(30, Duration::from_millis(20))
                .slow_to_stop(Duration::from_millis(30)),
        );
        fs::write(h.input_dir.join("v.mp4"), b"video").unwrap();
        h.queue.enqueue(JobDescriptor::new("v.mp4").with_id("v")).await.unwrap();

        let pool = pool(&h, FirstRenewalFails::hanging(h.queue.clone()), 2, 8);
        let job = run_until_terminal(&h, pool).await;

        assert_eq!(job.status, JobStatus::Succeeded, "{:?}", job.error);
        assert_eq!(job.attempts, 2);
        assert_eq!(h.encoder.cancelled.load(Ordering::SeqCst), 4);
        assert_eq!(h.encoder.job_peak("v"), 4);
        assert_eq!(h.encoder.running(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_job_for_redelivery() {
        let h = harness(60_000, 3, ScriptedEncoder::new(1000, Duration::from_millis(10)));
        fs::write(h.input_dir.join("v.mp4"), b"video").unwrap();
        h.queue.enqueue(JobDescriptor::new("v.mp4").with_id("v")).await.unwrap();

        let pool = pool(&h, h.queue.clone(), 1, 4);
        let shutdown = CancellationToken::new();
        let running = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pool.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(h.encoder.running(), 0);
        let job = h.queue.get("v").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempts, 1);
    }
}

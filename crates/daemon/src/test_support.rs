//! Scripted encoder shared by pipeline and worker tests.

use crate::encode::{EncodeError, EncodeRequest, EncodeSummary, ProgressReporter, RenditionEncoder};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Encodes in flight per job id, with the highest count each job reached.
#[derive(Debug, Default)]
pub struct JobCounts {
    running: HashMap<String, usize>,
    peak: HashMap<String, usize>,
}

/// Encoder that pretends to work in `steps` timed increments.
#[derive(Debug, Default)]
pub struct ScriptedEncoder {
    pub steps: u32,
    pub step_delay: Duration,
    /// How long an encode keeps running after it is cancelled.
    pub stop_delay: Duration,
    /// Heights that fail after their first step.
    pub fail_heights: HashSet<u32>,
    /// Currently inside `encode`.
    pub running: Arc<AtomicUsize>,
    /// Highest value `running` ever reached.
    pub peak: AtomicUsize,
    pub per_job: Arc<Mutex<JobCounts>>,
    pub started: AtomicUsize,
    pub cancelled: AtomicUsize,
    pub succeeded: AtomicUsize,
}

impl ScriptedEncoder {
    pub fn new(steps: u32, step_delay: Duration) -> Self {
        Self {
            steps: steps.max(1),
            step_delay,
            ..Self::default()
        }
    }

    pub fn failing_at(mut self, height: u32) -> Self {
        self.fail_heights.insert(height);
        self
    }

    pub fn slow_to_stop(mut self, delay: Duration) -> Self {
        self.stop_delay = delay;
        self
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Most encodes that were ever in flight at once for `job_id`.
    pub fn job_peak(&self, job_id: &str) -> usize {
        let counts = self.per_job.lock().unwrap();
        counts.peak.get(job_id).copied().unwrap_or(0)
    }
}

/// Undoes the running counts when an encode ends or its task is aborted.
struct RunningGuard {
    running: Arc<AtomicUsize>,
    per_job: Arc<Mutex<JobCounts>>,
    job_id: String,
}

impl RunningGuard {
    fn enter(encoder: &ScriptedEncoder, job_id: &str) -> Self {
        let now = encoder.running.fetch_add(1, Ordering::SeqCst) + 1;
        encoder.peak.fetch_max(now, Ordering::SeqCst);

        let mut counts = encoder.per_job.lock().unwrap();
        let in_job = counts.running.entry(job_id.to_string()).or_insert(0);
        *in_job += 1;
        let in_job = *in_job;
        let peak = counts.peak.entry(job_id.to_string()).or_insert(0);
        *peak = (*peak).max(in_job);

        Self {
            running: encoder.running.clone(),
            per_job: encoder.per_job.clone(),
            job_id: job_id.to_string(),
        }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        if let Ok(mut counts) = self.per_job.lock() {
            if let Some(in_job) = counts.running.get_mut(&self.job_id) {
                *in_job = in_job.saturating_sub(1);
            }
        }
    }
}

#[async_trait]
impl RenditionEncoder for ScriptedEncoder {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn encode(
        &self,
        request: EncodeRequest,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<EncodeSummary, EncodeError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let _guard = RunningGuard::enter(self, &request.job_id);

        for step in 1..=self.steps {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tokio::time::sleep(self.stop_delay).await;
                    self.cancelled.fetch_add(1, Ordering::SeqCst);
                    return Err(EncodeError::Cancelled);
                }
                _ = tokio::time::sleep(self.step_delay) => {}
            }
            if self.fail_heights.contains(&request.rendition.height) {
                return Err(EncodeError::Exited {
                    code: 1,
                    diagnostic: format!("scripted failure for {}", request.rendition),
                });
            }
            progress.report(f64::from(step) / f64::from(self.steps));
        }

        std::fs::write(request.playlist_path(), "#EXTM3U\n")?;
        std::fs::write(
            request
                .output_dir
                .join(format!("{}000.ts", request.rendition.segment_prefix())),
            b"",
        )?;

        self.succeeded.fetch_add(1, Ordering::SeqCst);
        Ok(EncodeSummary {
            rendition: request.rendition,
            width: Some(request.rendition.height * 16 / 9 / 2 * 2),
            duration_secs: Some(10.0),
        })
    }
}

//! Transcode pipeline for a single job.
//!
//! One pipeline run moves through
//! `created -> encoding -> manifesting -> completed`, or ends in `failed`
//! from `encoding` (or `manifesting` when the playlist cannot be written).
//! Every rendition is encoded by its own task; each task takes a slot from
//! the shared [`ConcurrencyLimiter`] before its encoder starts and holds it
//! until the encoder has exited. The first failing rendition fails the job:
//! the remaining encoders are cancelled and no master playlist is written.

use crate::encode::{
    EncodeError, EncodeRequest, EncodeSummary, ProgressReporter, RenditionEncoder, TaskProgress,
};
use crate::jobs::{JobResult, RenditionOutput};
use crate::limiter::{ConcurrencyLimiter, LimiterError};
use crate::manifest::{write_master_playlist, ManifestError, MasterPlaylist, Variant};
use crate::rendition::RenditionSpec;
use crate::workspace::{JobWorkspace, WorkspaceError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on how long cancelled encoders get to exit before their tasks
/// are aborted.
pub const MAX_CANCEL_GRACE: Duration = Duration::from_secs(10);

/// Cancel grace for jobs held under `lease_timeout`: a quarter of the lease,
/// capped at [`MAX_CANCEL_GRACE`].
pub fn cancel_grace_for(lease_timeout: Duration) -> Duration {
    MAX_CANCEL_GRACE.min(lease_timeout / 4)
}

/// Error type for pipeline runs
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no renditions requested")]
    NoRenditions,

    #[error("workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("rendition {rendition} failed: {source}")]
    Rendition {
        rendition: RenditionSpec,
        #[source]
        source: EncodeError,
    },

    #[error("rendition task failed: {0}")]
    TaskPanicked(String),

    #[error("encoder limiter unavailable: {0}")]
    Limiter(LimiterError),

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("job cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Whether another delivery of the job could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Rendition { source, .. } => source.is_retryable(),
            PipelineError::Workspace(WorkspaceError::InvalidJobId(_)) => false,
            PipelineError::NoRenditions
            | PipelineError::TaskPanicked(_)
            | PipelineError::Limiter(LimiterError::Closed) => false,
            _ => true,
        }
    }
}

/// Pipeline lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Created,
    Encoding,
    Manifesting,
    Completed,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Created => "created",
            PipelineState::Encoding => "encoding",
            PipelineState::Manifesting => "manifesting",
            PipelineState::Completed => "completed",
            PipelineState::Failed => "failed",
        }
    }
}

/// The part of a job the pipeline needs.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineJob {
    pub id: String,
    /// Already resolved against the input directory.
    pub input: PathBuf,
    /// Ascending quality order; the manifest follows it.
    pub renditions: Vec<RenditionSpec>,
}

/// Mean of per-task fractions as a whole percentage.
pub fn aggregate_percent(fractions: &[f64]) -> u8 {
    if fractions.is_empty() {
        return 0;
    }
    let mean = fractions.iter().map(|f| f.clamp(0.0, 1.0)).sum::<f64>() / fractions.len() as f64;
    // Nudge so that e.g. 0.29 * 100 does not floor to 28
    ((mean * 100.0 + 1e-9).floor() as u8).min(100)
}

/// Folds per-task progress into job progress that only moves forward.
#[derive(Debug, Clone)]
pub struct ProgressAggregator {
    fractions: Vec<f64>,
    min_delta: u8,
    last_emitted: u8,
}

impl ProgressAggregator {
    pub fn new(tasks: usize, min_delta: u8) -> Self {
        Self {
            fractions: vec![0.0; tasks],
            min_delta: min_delta.max(1),
            last_emitted: 0,
        }
    }

    /// Record a task sample; returns the job percent when it is worth emitting.
    ///
    /// A task's fraction never goes down. A value is emitted once it exceeds
    /// the last emitted value by at least the minimum delta, and 100 is
    /// always emitted when reached.
    pub fn update(&mut self, index: usize, fraction: f64) -> Option<u8> {
        let slot = self.fractions.get_mut(index)?;
        if fraction.is_finite() && fraction > *slot {
            *slot = fraction.min(1.0);
        }

        let percent = aggregate_percent(&self.fractions);
        let due = percent >= self.last_emitted.saturating_add(self.min_delta)
            || (percent == 100 && self.last_emitted < 100);
        if due {
            self.last_emitted = percent;
            Some(percent)
        } else {
            None
        }
    }

    pub fn percent(&self) -> u8 {
        aggregate_percent(&self.fractions)
    }
}

/// Settings for pipeline runs
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Workspaces are created as `<output_root>/<job_id>`
    pub output_root: PathBuf,
    /// Smallest job-percent change reported to the progress callback
    pub min_progress_delta: u8,
    /// Time cancelled encoders get to exit before their tasks are aborted
    pub cancel_grace: Duration,
}

/// Runs jobs through encoding and manifest generation.
pub struct TranscodePipeline {
    limiter: ConcurrencyLimiter,
    encoder: Arc<dyn RenditionEncoder>,
    settings: PipelineSettings,
}

impl TranscodePipeline {
    pub fn new(
        limiter: ConcurrencyLimiter,
        encoder: Arc<dyn RenditionEncoder>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            limiter,
            encoder,
            settings,
        }
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Transcode `job` into every requested rendition and write its master
    /// playlist.
    ///
    /// `on_progress` receives non-decreasing job percentages. When `cancel`
    /// fires, all encoders are stopped and `PipelineError::Cancelled` is
    /// returned once they have exited.
    pub async fn run<F>(
        &self,
        job: &PipelineJob,
        mut on_progress: F,
        cancel: CancellationToken,
    ) -> Result<JobResult, PipelineError>
    where
        F: FnMut(u8) + Send,
    {
        let mut state = PipelineState::Created;
        debug!(job_id = %job.id, state = state.as_str(), renditions = job.renditions.len(), "pipeline created");

        if job.renditions.is_empty() {
            return Err(self.fail(job, &mut state, PipelineError::NoRenditions));
        }

        let workspace = match JobWorkspace::prepare(&self.settings.output_root, &job.id) {
            Ok(ws) => ws,
            Err(e) => return Err(self.fail(job, &mut state, e.into())),
        };

        self.transition(job, &mut state, PipelineState::Encoding);
        let summaries = match self.encode_all(job, &workspace, &mut on_progress, &cancel).await {
            Ok(summaries) => summaries,
            Err(e) => return Err(self.fail(job, &mut state, e)),
        };

        self.transition(job, &mut state, PipelineState::Manifesting);
        let variants = job
            .renditions
            .iter()
            .zip(&summaries)
            .map(|(spec, summary)| Variant::from_rendition(spec, summary.width))
            .collect();
        let manifest_path = match MasterPlaylist::new(variants)
            .and_then(|playlist| write_master_playlist(workspace.dir(), &playlist))
        {
            Ok(path) => path,
            Err(e) => return Err(self.fail(job, &mut state, e.into())),
        };

        self.transition(job, &mut state, PipelineState::Completed);
        info!(job_id = %job.id, manifest = %manifest_path.display(), "job transcoded");

        let renditions = job
            .renditions
            .iter()
            .zip(&summaries)
            .map(|(spec, summary)| RenditionOutput {
                height: spec.height,
                bitrate_kbps: spec.bitrate_kbps,
                width: summary.width,
                playlist: spec.playlist_name(),
                segments: workspace.count_segments(spec),
            })
            .collect();

        Ok(JobResult {
            output_dir: workspace.dir().to_path_buf(),
            manifest_path,
            renditions,
        })
    }

    /// Fan out one task per rendition and wait for all of them, failing fast.
    async fn encode_all<F>(
        &self,
        job: &PipelineJob,
        workspace: &JobWorkspace,
        on_progress: &mut F,
        cancel: &CancellationToken,
    ) -> Result<Vec<EncodeSummary>, PipelineError>
    where
        F: FnMut(u8) + Send,
    {
        let tasks_cancel = cancel.child_token();
        let (tx, mut rx) = mpsc::unbounded_channel::<TaskProgress>();
        let mut tasks = JoinSet::new();

        for (index, spec) in job.renditions.iter().copied().enumerate() {
            let limiter = self.limiter.clone();
            let encoder = self.encoder.clone();
            let token = tasks_cancel.clone();
            let reporter = ProgressReporter::new(index, tx.clone());
            let request = EncodeRequest {
                job_id: job.id.clone(),
                input: job.input.clone(),
                rendition: spec,
                output_dir: workspace.dir().to_path_buf(),
            };

            tasks.spawn(async move {
                let outcome = async move {
                    let _slot = limiter.acquire_or_cancel(&token).await.map_err(|e| match e {
                        LimiterError::Cancelled => PipelineError::Rendition {
                            rendition: spec,
                            source: EncodeError::Cancelled,
                        },
                        LimiterError::Closed => PipelineError::Limiter(e),
                    })?;
                    encoder
                        .encode(request, reporter, token)
                        .await
                        .map_err(|source| PipelineError::Rendition {
                            rendition: spec,
                            source,
                        })
                    // slot released here, after the encoder has exited
                }
                .await;
                (index, outcome)
            });
        }
        drop(tx);

        let total = job.renditions.len();
        let mut summaries: Vec<Option<EncodeSummary>> = vec![None; total];
        let mut aggregator = ProgressAggregator::new(total, self.settings.min_progress_delta);
        let mut remaining = total;
        let mut failure = None;

        while remaining > 0 {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    failure = Some(PipelineError::Cancelled);
                    break;
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok((index, Ok(summary)))) => {
                        remaining -= 1;
                        debug!(job_id = %job.id, rendition = %summary.rendition, remaining, "rendition done");
                        if let Some(percent) = aggregator.update(index, 1.0) {
                            on_progress(percent);
                        }
                        summaries[index] = Some(summary);
                    }
                    Some(Ok((_, Err(e)))) => {
                        failure = Some(e);
                        break;
                    }
                    Some(Err(join_err)) => {
                        failure = Some(PipelineError::TaskPanicked(join_err.to_string()));
                        break;
                    }
                    None => break,
                },
                Some(sample) = rx.recv() => {
                    if let Some(percent) = aggregator.update(sample.index, sample.fraction) {
                        on_progress(percent);
                    }
                }
            }
        }

        if let Some(err) = failure {
            self.stop_tasks(job, &tasks_cancel, &mut tasks).await;
            return Err(err);
        }

        // Every task reported success, so every slot is filled
        let summaries: Option<Vec<EncodeSummary>> = summaries.into_iter().collect();
        summaries.ok_or_else(|| PipelineError::TaskPanicked("rendition task vanished".to_string()))
    }

    /// Cancel the remaining rendition tasks and wait until their encoders are gone.
    async fn stop_tasks(
        &self,
        job: &PipelineJob,
        tasks_cancel: &CancellationToken,
        tasks: &mut JoinSet<(usize, Result<EncodeSummary, PipelineError>)>,
    ) {
        tasks_cancel.cancel();
        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                if let Ok((index, Err(e))) = joined {
                    debug!(job_id = %job.id, index, error = %e, "rendition stopped");
                }
            }
        };
        if tokio::time::timeout(self.settings.cancel_grace, drain).await.is_err() {
            warn!(job_id = %job.id, "encoders ignored cancellation, aborting their tasks");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }

    fn transition(&self, job: &PipelineJob, state: &mut PipelineState, next: PipelineState) {
        debug!(job_id = %job.id, from = state.as_str(), to = next.as_str(), "pipeline transition");
        *state = next;
    }

    fn fail(&self, job: &PipelineJob, state: &mut PipelineState, err: PipelineError) -> PipelineError {
        warn!(job_id = %job.id, from = state.as_str(), error = %err, "pipeline failed");
        *state = PipelineState::Failed;
        err
    }
}

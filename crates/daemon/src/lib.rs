//! ABR Transcoder
//!
//! Background service that turns uploaded videos into HLS rendition ladders:
//! a durable job queue, a pool of workers, a per-job transcode pipeline and a
//! global limit on running encoder processes.

pub mod concurrency;
pub mod daemon;
pub mod encode;
pub mod jobs;
pub mod limiter;
pub mod manifest;
pub mod metrics;
pub mod metrics_server;
pub mod pipeline;
pub mod queue;
pub mod rendition;
pub mod startup;
pub mod worker;
pub mod workspace;

#[cfg(test)]
mod test_support;

pub use abr_transcoder_config as config;
pub use abr_transcoder_config::Config;
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use daemon::{Daemon, DaemonError};
pub use encode::{
    build_ffmpeg_command, encoder_from_config, EncodeError, EncodeRequest, EncodeSummary,
    FfmpegEncoder, ProgressReporter, RenditionEncoder,
};
pub use jobs::{
    load_jobs, save_job, Job, JobDescriptor, JobError, JobResult, JobStatus, RenditionOutput,
};
pub use limiter::{ConcurrencyLimiter, EncoderSlot, LimiterError};
pub use manifest::{write_master_playlist, ManifestError, MasterPlaylist, Variant};
pub use metrics::{
    collect_system_metrics, new_shared_metrics, JobMetrics, MetricsSnapshot, SharedMetrics,
    SystemMetrics,
};
pub use metrics_server::{create_metrics_router, run_metrics_server, ServerError};
pub use pipeline::{
    aggregate_percent, cancel_grace_for, PipelineError, PipelineJob, PipelineSettings,
    PipelineState, ProgressAggregator, TranscodePipeline, MAX_CANCEL_GRACE,
};
pub use queue::{
    submit_to_inbox, FileQueue, JobQueue, Lease, LeasedJob, QueueError, QueueSettings,
};
pub use rendition::{default_catalog, RenditionError, RenditionLadder, RenditionSpec};
pub use startup::{check_encoder_version, parse_ffmpeg_version, run_startup_checks, StartupError};
pub use worker::{WorkerPool, WorkerSettings};
pub use workspace::{JobWorkspace, WorkspaceError};

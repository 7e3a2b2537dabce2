//! Rendition encoders.
//!
//! A [`RenditionEncoder`] turns one input into one HLS rendition. The
//! production implementation drives an FFmpeg process; tests substitute
//! scripted encoders through the same trait.

pub mod ffmpeg;
pub mod lines;
pub mod progress;

use crate::config::EncoderConfig;
use crate::rendition::RenditionSpec;
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use ffmpeg::{build_ffmpeg_command, FfmpegEncoder, FfmpegSettings};
pub use lines::{DiagnosticLines, DiagnosticTail};
pub use progress::{parse_line, parse_timestamp, DiagnosticEvent, ProgressTracker};

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The encoder process could not be started
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Encoder exited with non-zero status
    #[error("encoder exited with code {code}: {diagnostic}")]
    Exited { code: i32, diagnostic: String },

    /// Encoder was killed by a signal it did not get from us
    #[error("encoder terminated by signal {signal}: {diagnostic}")]
    Signaled { signal: i32, diagnostic: String },

    /// The encode was stopped because its job was cancelled
    #[error("encode cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl EncodeError {
    /// Whether another delivery of the same job could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EncodeError::Spawn { source, .. } => !matches!(
                source.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
            ),
            EncodeError::Exited { .. }
            | EncodeError::Signaled { .. }
            | EncodeError::Cancelled
            | EncodeError::Io(_) => true,
        }
    }
}

/// Everything needed to encode one rendition.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeRequest {
    pub job_id: String,
    pub input: PathBuf,
    pub rendition: RenditionSpec,
    /// The job workspace; playlist and segments are written here.
    pub output_dir: PathBuf,
}

impl EncodeRequest {
    pub fn playlist_path(&self) -> PathBuf {
        self.output_dir.join(self.rendition.playlist_name())
    }

    pub fn segment_pattern_path(&self) -> PathBuf {
        self.output_dir.join(self.rendition.segment_pattern())
    }
}

/// What a successful encode reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeSummary {
    pub rendition: RenditionSpec,
    /// Scaled output width, when the encoder printed it.
    pub width: Option<u32>,
    /// Input duration in seconds, when the encoder printed it.
    pub duration_secs: Option<f64>,
}

/// A progress sample from one rendition task of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskProgress {
    pub index: usize,
    pub fraction: f64,
}

/// Handle an encoder uses to publish its fractional progress.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    index: usize,
    tx: Option<mpsc::UnboundedSender<TaskProgress>>,
}

impl ProgressReporter {
    pub fn new(index: usize, tx: mpsc::UnboundedSender<TaskProgress>) -> Self {
        Self {
            index,
            tx: Some(tx),
        }
    }

    /// A reporter nobody listens to.
    pub fn detached() -> Self {
        Self { index: 0, tx: None }
    }

    /// Publish a fraction, clamped to [0, 1]. Non-finite values are dropped.
    pub fn report(&self, fraction: f64) {
        if !fraction.is_finite() {
            return;
        }
        if let Some(tx) = &self.tx {
            // The receiver is gone once the pipeline has settled the job.
            let _ = tx.send(TaskProgress {
                index: self.index,
                fraction: fraction.clamp(0.0, 1.0),
            });
        }
    }
}

/// Encodes a single rendition of a video.
///
/// Implementations must stop promptly when `cancel` fires and must not
/// return while a process they spawned is still running.
#[async_trait]
pub trait RenditionEncoder: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn encode(
        &self,
        request: EncodeRequest,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<EncodeSummary, EncodeError>;
}

/// Build the FFmpeg encoder described by the `[encoder]` section.
///
/// `encoder.rate_control` selects the bitrate strategy. Other
/// [`RenditionEncoder`] implementations are passed to `Daemon::with_encoder`
/// directly.
pub fn encoder_from_config(cfg: &EncoderConfig) -> Arc<dyn RenditionEncoder> {
    Arc::new(FfmpegEncoder::new(FfmpegSettings::from(cfg)))
}

//! FFmpeg-backed rendition encoder.
//!
//! Builds one FFmpeg invocation per rendition, streams its stderr through the
//! diagnostic parser and maps the exit status onto [`EncodeError`].

use super::lines::{DiagnosticLines, DiagnosticTail};
use super::progress::ProgressTracker;
use super::{EncodeError, EncodeRequest, EncodeSummary, ProgressReporter, RenditionEncoder};
use crate::config::{EncoderConfig, RateControl};
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Non-progress stderr lines kept for failure reports.
const DIAGNOSTIC_TAIL_LINES: usize = 8;

/// Settings shared by every rendition encoded with FFmpeg.
#[derive(Debug, Clone, PartialEq)]
pub struct FfmpegSettings {
    pub binary: PathBuf,
    pub video_codec: String,
    pub preset: String,
    pub audio_codec: String,
    pub segment_seconds: u32,
    pub rate_control: RateControl,
}

impl Default for FfmpegSettings {
    fn default() -> Self {
        Self::from(&EncoderConfig::default())
    }
}

impl From<&EncoderConfig> for FfmpegSettings {
    fn from(cfg: &EncoderConfig) -> Self {
        Self {
            binary: PathBuf::from(&cfg.binary),
            video_codec: cfg.video_codec.clone(),
            preset: cfg.preset.clone(),
            audio_codec: cfg.audio_codec.clone(),
            segment_seconds: cfg.segment_seconds,
            rate_control: cfg.rate_control,
        }
    }
}

/// Build the FFmpeg command for one rendition.
///
/// The command scales to the target height keeping the aspect ratio, encodes
/// at the target bitrate and writes a VOD HLS playlist with fixed-length
/// segments into the request's output directory:
///
/// ```text
/// ffmpeg -hide_banner -nostdin -y -i <input> -vf scale=-2:<h>
///        -c:v libx264 -preset veryfast -b:v <kbps>k -c:a aac
///        -hls_time 10 -hls_playlist_type vod
///        -hls_segment_filename <dir>/<h>p_%03d.ts <dir>/<h>p.m3u8
/// ```
pub fn build_ffmpeg_command(settings: &FfmpegSettings, request: &EncodeRequest) -> Command {
    let rendition = request.rendition;
    let bitrate = format!("{}k", rendition.bitrate_kbps);

    let mut cmd = Command::new(&settings.binary);

    cmd.arg("-hide_banner").arg("-nostdin").arg("-y");
    cmd.arg("-i").arg(&request.input);

    // Width follows the aspect ratio, rounded to an even number
    cmd.arg("-vf").arg(format!("scale=-2:{}", rendition.height));

    cmd.arg("-c:v").arg(&settings.video_codec);
    cmd.arg("-preset").arg(&settings.preset);
    cmd.arg("-b:v").arg(&bitrate);

    if settings.rate_control == RateControl::Constrained {
        cmd.arg("-maxrate").arg(&bitrate);
        cmd.arg("-bufsize")
            .arg(format!("{}k", u64::from(rendition.bitrate_kbps) * 2));
        // Keyframe on every segment boundary so all renditions switch cleanly
        cmd.arg("-force_key_frames").arg(format!(
            "expr:gte(t,n_forced*{})",
            settings.segment_seconds
        ));
    }

    cmd.arg("-c:a").arg(&settings.audio_codec);

    cmd.arg("-hls_time").arg(settings.segment_seconds.to_string());
    cmd.arg("-hls_playlist_type").arg("vod");
    cmd.arg("-hls_segment_filename")
        .arg(request.segment_pattern_path());
    cmd.arg(request.playlist_path());

    cmd
}

/// Rendition encoder running one FFmpeg process per call.
#[derive(Debug, Clone, Default)]
pub struct FfmpegEncoder {
    settings: FfmpegSettings,
}

impl FfmpegEncoder {
    pub fn new(settings: FfmpegSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &FfmpegSettings {
        &self.settings
    }
}

#[async_trait]
impl RenditionEncoder for FfmpegEncoder {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn encode(
        &self,
        request: EncodeRequest,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<EncodeSummary, EncodeError> {
        let rendition = request.rendition;
        let mut cmd = tokio::process::Command::from(build_ffmpeg_command(&self.settings, &request));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| EncodeError::Spawn {
            program: self.settings.binary.display().to_string(),
            source,
        })?;
        info!(
            job_id = %request.job_id,
            rendition = %rendition,
            pid = child.id(),
            "encoder started"
        );

        let stderr = child.stderr.take().ok_or_else(|| {
            EncodeError::Io(io::Error::other("encoder stderr was not captured"))
        })?;
        let mut tracker = ProgressTracker::new();
        let mut tail = DiagnosticTail::new(DIAGNOSTIC_TAIL_LINES);

        let read = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(job_id = %request.job_id, rendition = %rendition, "killing encoder");
                if let Err(e) = child.kill().await {
                    warn!(job_id = %request.job_id, rendition = %rendition, error = %e, "failed to kill encoder");
                }
                return Err(EncodeError::Cancelled);
            }
            read = consume_diagnostics(stderr, &mut tracker, &mut tail, &progress) => read,
        };
        if let Err(e) = read {
            warn!(job_id = %request.job_id, rendition = %rendition, error = %e, "lost encoder diagnostics");
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!(job_id = %request.job_id, rendition = %rendition, error = %e, "failed to kill encoder");
                }
                return Err(EncodeError::Cancelled);
            }
            status = child.wait() => status?,
        };

        if status.success() {
            info!(job_id = %request.job_id, rendition = %rendition, "encoder finished");
            Ok(EncodeSummary {
                rendition,
                width: tracker.output_width(),
                duration_secs: tracker.duration(),
            })
        } else {
            let err = exit_error(status, tail.render());
            warn!(job_id = %request.job_id, rendition = %rendition, error = %err, "encoder failed");
            Err(err)
        }
    }
}

/// Feed encoder stderr through the progress tracker until it closes.
///
/// The reader is consumed, so the pipe is closed as soon as reading stops,
/// including when a read fails.
async fn consume_diagnostics<R: AsyncRead + Unpin>(
    stderr: R,
    tracker: &mut ProgressTracker,
    tail: &mut DiagnosticTail,
    progress: &ProgressReporter,
) -> io::Result<()> {
    let mut lines = DiagnosticLines::new(stderr);
    while let Some(line) = lines.next_line().await? {
        if let Some(fraction) = tracker.apply_line(&line) {
            progress.report(fraction);
        }
        if !line.contains("time=") {
            tail.push(line);
        }
    }
    Ok(())
}

fn exit_error(status: ExitStatus, diagnostic: String) -> EncodeError {
    if let Some(code) = status.code() {
        return EncodeError::Exited { code, diagnostic };
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return EncodeError::Signaled { signal, diagnostic };
        }
    }
    EncodeError::Signaled {
        signal: -1,
        diagnostic,
    }
}

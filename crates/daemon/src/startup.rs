//! Preflight checks run before the daemon starts taking jobs:
//! - the encoder binary runs and is recent enough
//! - the state and output directories can be created

use crate::config::Config;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Encoder not available: {0}")]
    EncoderUnavailable(String),

    #[error("Encoder version requirement not met: {0}")]
    EncoderVersion(String),

    #[error("Cannot create directory {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Extract the major version from `ffmpeg -version` output.
///
/// Handles release builds (`ffmpeg version 6.1.1 ...`) and `n`-prefixed
/// builds (`ffmpeg version n6.1-12-gabcdef ...`). Snapshot builds such as
/// `N-112345-g...` carry no release number and yield `None`.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .map(str::to_lowercase)
        .find(|line| line.contains("ffmpeg version"))?;

    let token = version_line
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    token
        .trim_start_matches('n')
        .split(|c| c == '.' || c == '-')
        .next()?
        .parse()
        .ok()
}

/// Run `<binary> -version` and require a major version of at least `min_major`.
///
/// Returns the detected major version.
pub fn check_encoder_version(binary: &str, min_major: u32) -> Result<u32, StartupError> {
    let output = Command::new(binary).arg("-version").output().map_err(|e| {
        StartupError::EncoderUnavailable(format!(
            "{} -version failed; is it installed and in PATH? Error: {}",
            binary, e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::EncoderUnavailable(format!(
            "{} -version exited with {}",
            binary, output.status
        )));
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    let major = parse_ffmpeg_version(&version_output).ok_or_else(|| {
        StartupError::EncoderVersion(format!(
            "Could not parse version from output: {}",
            version_output.lines().next().unwrap_or("(empty)")
        ))
    })?;

    if major < min_major {
        return Err(StartupError::EncoderVersion(format!(
            "{}.x or newer required, got {}",
            min_major, major
        )));
    }

    Ok(major)
}

fn ensure_dir(path: &Path) -> Result<(), StartupError> {
    std::fs::create_dir_all(path).map_err(|source| StartupError::Directory {
        path: path.display().to_string(),
        source,
    })
}

/// Run all startup checks in order
///
/// 1. Encoder binary and version
/// 2. State and output directories
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    let major = check_encoder_version(&cfg.encoder.binary, cfg.encoder.min_major_version)?;
    info!(binary = %cfg.encoder.binary, major, "encoder found");

    ensure_dir(&cfg.queue.state_dir)?;
    ensure_dir(&cfg.paths.output_dir)?;
    Ok(())
}

//! Job model and persistence.
//!
//! Jobs are persisted as JSON files, one `{job_id}.json` per job, so the queue
//! can be rebuilt after a restart.

use crate::rendition::{RenditionError, RenditionLadder, RenditionSpec};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Longest job id accepted; ids become directory names.
const MAX_JOB_ID_LEN: usize = 128;

/// Errors raised while turning a descriptor into a job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job id {0:?}: use letters, digits, '-', '_' or '.'")]
    InvalidId(String),

    #[error("input path is empty")]
    EmptyInput,

    #[error("invalid renditions: {0}")]
    Renditions(#[from] RenditionError),
}

/// Lifecycle state of a job as tracked by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker.
    #[default]
    Queued,
    /// Leased by a worker and being transcoded.
    Running,
    /// All renditions and the master playlist were written.
    Succeeded,
    /// Failed permanently; will not be redelivered.
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// What a producer submits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Assigned by the queue when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub input_path: PathBuf,
    /// Falls back to the configured catalog when empty.
    #[serde(default)]
    pub renditions: Vec<RenditionSpec>,
}

impl JobDescriptor {
    pub fn new(input_path: impl Into<PathBuf>) -> Self {
        Self {
            job_id: None,
            input_path: input_path.into(),
            renditions: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    pub fn with_renditions(mut self, renditions: Vec<RenditionSpec>) -> Self {
        self.renditions = renditions;
        self
    }
}

/// Output of one successfully encoded rendition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenditionOutput {
    pub height: u32,
    pub bitrate_kbps: u32,
    /// Output width reported by the encoder, when it printed one.
    pub width: Option<u32>,
    /// Playlist path relative to the job workspace.
    pub playlist: String,
    pub segments: usize,
}

/// Success payload recorded on a completed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub output_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub renditions: Vec<RenditionOutput>,
}

/// A transcode job with its delivery bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub input_path: PathBuf,
    /// Ascending quality order.
    pub renditions: Vec<RenditionSpec>,
    pub status: JobStatus,
    /// Aggregate progress of the current attempt, 0-100.
    pub progress: u8,
    /// Deliveries so far, including the current one.
    pub attempts: u32,
    /// Unix timestamp (milliseconds) when job was created.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) when job was last updated.
    pub updated_at: i64,
    pub result: Option<JobResult>,
    /// Failure descriptor of the latest failed attempt.
    pub error: Option<String>,
}

impl Job {
    /// Build a queued job from a producer descriptor.
    ///
    /// An empty rendition list is replaced by `default_renditions`.
    pub fn from_descriptor(
        descriptor: JobDescriptor,
        default_renditions: &[RenditionSpec],
    ) -> Result<Self, JobError> {
        let id = match descriptor.job_id {
            Some(id) => {
                validate_job_id(&id)?;
                id
            }
            None => Uuid::new_v4().to_string(),
        };

        if descriptor.input_path.as_os_str().is_empty() {
            return Err(JobError::EmptyInput);
        }

        let requested = if descriptor.renditions.is_empty() {
            default_renditions.to_vec()
        } else {
            descriptor.renditions
        };
        let ladder = RenditionLadder::new(requested)?;

        let now = current_timestamp_ms();
        Ok(Self {
            id,
            input_path: descriptor.input_path,
            renditions: ladder.into_specs(),
            status: JobStatus::Queued,
            progress: 0,
            attempts: 0,
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
        })
    }

    /// Update the job's updated_at timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = current_timestamp_ms();
    }

    pub fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        self.touch();
    }

    /// Start a new delivery: progress restarts from zero.
    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
        self.progress = 0;
        self.set_status(JobStatus::Running);
    }

    /// Record progress, never moving backwards within an attempt.
    pub fn record_progress(&mut self, percent: u8) -> bool {
        let percent = percent.min(100);
        if percent <= self.progress {
            return false;
        }
        self.progress = percent;
        self.touch();
        true
    }

    pub fn succeed(&mut self, result: JobResult) {
        self.progress = 100;
        self.result = Some(result);
        self.error = None;
        self.set_status(JobStatus::Succeeded);
    }

    /// Return the job to the queue after a failed attempt.
    pub fn requeue(&mut self, reason: &str) {
        self.error = Some(reason.to_string());
        self.set_status(JobStatus::Queued);
    }

    /// Fail permanently; the last progress value is kept.
    pub fn fail(&mut self, reason: &str) {
        self.error = Some(reason.to_string());
        self.set_status(JobStatus::Failed);
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Succeeded | JobStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, JobStatus::Queued | JobStatus::Running)
    }
}

/// Job ids name directories, so only a conservative character set is allowed.
pub fn validate_job_id(id: &str) -> Result<(), JobError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_JOB_ID_LEN
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(JobError::InvalidId(id.to_string()))
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Saves a job to `{state_dir}/{job_id}.json`.
///
/// The record is written to a temporary file first and renamed over the old
/// one, so a crash never leaves a half-written record behind.
pub fn save_job(job: &Job, state_dir: &Path) -> Result<(), io::Error> {
    fs::create_dir_all(state_dir)?;

    let file_path = state_dir.join(format!("{}.json", job.id));
    let tmp_path = state_dir.join(format!(".{}.json.tmp", job.id));
    let json = serde_json::to_string_pretty(job)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    fs::write(&tmp_path, json)?;
    fs::rename(&tmp_path, &file_path)
}

/// Loads all jobs from JSON files in the state directory.
///
/// Files that fail to parse are skipped with a warning.
pub fn load_jobs(state_dir: &Path) -> Result<Vec<Job>, io::Error> {
    if !state_dir.exists() {
        return Ok(Vec::new());
    }

    let mut jobs = Vec::new();

    for entry in fs::read_dir(state_dir)? {
        let entry = entry?;
        let path = entry.path();

        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        match load_job_from_file(&path) {
            Ok(job) => jobs.push(job),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable job record");
            }
        }
    }

    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    Ok(jobs)
}

/// Loads a single job from a JSON file.
pub fn load_job_from_file(path: &Path) -> Result<Job, io::Error> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

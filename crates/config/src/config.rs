//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Configuration parsed but holds values the transcoder cannot run with
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// CPU-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpuConfig {
    /// Number of logical cores (auto-detected if None)
    pub logical_cores: Option<u32>,
    /// Target CPU utilization (0.5-1.0, default 0.85)
    #[serde(default = "default_target_cpu_utilization")]
    pub target_cpu_utilization: f32,
}

fn default_target_cpu_utilization() -> f32 {
    0.85
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            logical_cores: None,
            target_cpu_utilization: default_target_cpu_utilization(),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Jobs processed concurrently (0 = auto-derive)
    #[serde(default)]
    pub job_slots: u32,
    /// Ask the queue to redeliver failed jobs until the attempt limit
    #[serde(default = "default_true")]
    pub retry_failed_jobs: bool,
}

fn default_true() -> bool {
    true
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            job_slots: 0,
            retry_failed_jobs: true,
        }
    }
}

/// How the encoder is asked to hold the target bitrate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateControl {
    /// Average bitrate only (`-b:v`)
    #[default]
    Average,
    /// Average bitrate capped with a VBV buffer and segment-aligned keyframes
    Constrained,
}

/// Encoder process configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Encoder executable (looked up in PATH when not absolute)
    #[serde(default = "default_encoder_binary")]
    pub binary: String,
    /// Global limit on encoder processes across all jobs (0 = auto-derive)
    #[serde(default)]
    pub max_processes: u32,
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    /// Target HLS segment duration in seconds
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u32,
    #[serde(default)]
    pub rate_control: RateControl,
    /// Minimum encoder major version accepted by the startup check
    #[serde(default = "default_min_major_version")]
    pub min_major_version: u32,
}

fn default_encoder_binary() -> String {
    "ffmpeg".to_string()
}

fn default_video_codec() -> String {
    "libx264".to_string()
}

fn default_preset() -> String {
    "veryfast".to_string()
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

fn default_segment_seconds() -> u32 {
    10
}

fn default_min_major_version() -> u32 {
    4
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            binary: default_encoder_binary(),
            max_processes: 0,
            video_codec: default_video_codec(),
            preset: default_preset(),
            audio_codec: default_audio_codec(),
            segment_seconds: default_segment_seconds(),
            rate_control: RateControl::default(),
            min_major_version: default_min_major_version(),
        }
    }
}

/// Durable job queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Directory holding job records and the producer inbox
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Seconds a leased job stays invisible before it is redelivered
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,
    /// Deliveries before a job is failed permanently
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Upper bound on how long an idle lease call sleeps before rescanning
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_lease_timeout_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            lease_timeout_secs: default_lease_timeout_secs(),
            max_attempts: default_max_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Filesystem locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Relative job input paths are resolved against this directory
    #[serde(default = "default_input_dir")]
    pub input_dir: PathBuf,
    /// Per-job workspaces are created under this directory
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_input_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input_dir: default_input_dir(),
            output_dir: default_output_dir(),
        }
    }
}

/// Progress reporting configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressConfig {
    /// Smallest change in job percent worth reporting to the queue
    #[serde(default = "default_min_delta_percent")]
    pub min_delta_percent: u8,
}

fn default_min_delta_percent() -> u8 {
    1
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            min_delta_percent: default_min_delta_percent(),
        }
    }
}

/// One entry of the default rendition catalog
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenditionConfig {
    pub height: u32,
    pub bitrate_kbps: u32,
}

/// Default catalog used when a job does not request its own renditions
pub fn default_renditions() -> Vec<RenditionConfig> {
    vec![
        RenditionConfig { height: 144, bitrate_kbps: 300 },
        RenditionConfig { height: 360, bitrate_kbps: 500 },
        RenditionConfig { height: 720, bitrate_kbps: 1000 },
        RenditionConfig { height: 1080, bitrate_kbps: 3000 },
    ]
}

/// Inspection HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is not set
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub cpu: CpuConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default = "default_renditions")]
    pub renditions: Vec<RenditionConfig>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cpu: CpuConfig::default(),
            workers: WorkerConfig::default(),
            encoder: EncoderConfig::default(),
            queue: QueueConfig::default(),
            paths: PathsConfig::default(),
            progress: ProgressConfig::default(),
            renditions: default_renditions(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - ABR_CPU_LOGICAL_CORES -> cpu.logical_cores
    /// - ABR_JOB_SLOTS -> workers.job_slots
    /// - ABR_MAX_ENCODER_PROCESSES -> encoder.max_processes
    /// - ABR_ENCODER_BINARY -> encoder.binary
    /// - ABR_LEASE_TIMEOUT_SECS -> queue.lease_timeout_secs
    /// - ABR_MAX_ATTEMPTS -> queue.max_attempts
    /// - ABR_STATE_DIR -> queue.state_dir
    /// - ABR_INPUT_DIR -> paths.input_dir
    /// - ABR_OUTPUT_DIR -> paths.output_dir
    /// - ABR_LOG -> logging.filter
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("ABR_CPU_LOGICAL_CORES") {
            if let Ok(cores) = val.parse::<u32>() {
                self.cpu.logical_cores = Some(cores);
            }
        }

        if let Ok(val) = env::var("ABR_JOB_SLOTS") {
            if let Ok(slots) = val.parse::<u32>() {
                self.workers.job_slots = slots;
            }
        }

        if let Ok(val) = env::var("ABR_MAX_ENCODER_PROCESSES") {
            if let Ok(processes) = val.parse::<u32>() {
                self.encoder.max_processes = processes;
            }
        }

        if let Ok(val) = env::var("ABR_ENCODER_BINARY") {
            if !val.trim().is_empty() {
                self.encoder.binary = val;
            }
        }

        if let Ok(val) = env::var("ABR_LEASE_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.queue.lease_timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("ABR_MAX_ATTEMPTS") {
            if let Ok(attempts) = val.parse::<u32>() {
                self.queue.max_attempts = attempts;
            }
        }

        // Path overrides are taken verbatim
        if let Ok(val) = env::var("ABR_STATE_DIR") {
            self.queue.state_dir = PathBuf::from(val);
        }
        if let Ok(val) = env::var("ABR_INPUT_DIR") {
            self.paths.input_dir = PathBuf::from(val);
        }
        if let Ok(val) = env::var("ABR_OUTPUT_DIR") {
            self.paths.output_dir = PathBuf::from(val);
        }

        if let Ok(val) = env::var("ABR_LOG") {
            self.logging.filter = val;
        }
    }

    /// Check values that would otherwise fail deep inside the pipeline
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.renditions.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one rendition is required".to_string(),
            ));
        }
        for r in &self.renditions {
            if r.height == 0 || r.bitrate_kbps == 0 {
                return Err(ConfigError::Invalid(format!(
                    "rendition {}p/{}k must have a positive height and bitrate",
                    r.height, r.bitrate_kbps
                )));
            }
        }
        if self.queue.lease_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "queue.lease_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.queue.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "queue.max_attempts must be greater than zero".to_string(),
            ));
        }
        if self.encoder.segment_seconds == 0 {
            return Err(ConfigError::Invalid(
                "encoder.segment_seconds must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = if path.as_ref().exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

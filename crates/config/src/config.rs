//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
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
    /// Parsed configuration is inconsistent
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
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

/// Reservation scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Seconds between recorder ticks
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
}

fn default_tick_interval_secs() -> u64 {
    10
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
        }
    }
}

/// A capture tuner and the channels it can receive
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunerConfig {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub channels: Vec<i64>,
}

/// Recording capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordingConfig {
    /// Directory recorded files are written to
    #[serde(default = "default_record_dir")]
    pub record_dir: PathBuf,
    /// Capture command template (%PROGRAM%, %CHANNEL%, %OUTPUT%)
    #[serde(default)]
    pub command: Option<String>,
}

fn default_record_dir() -> PathBuf {
    PathBuf::from("./recorded")
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            record_dir: default_record_dir(),
            command: None,
        }
    }
}

/// A named encoder command template
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodePreset {
    pub name: String,
    /// Command template (%FFMPEG%, %INPUT%, %OUTPUT%)
    pub command: String,
    /// Suffix appended to the output file stem, including the extension
    #[serde(default = "default_encode_suffix")]
    pub suffix: String,
    /// The command rewrites the source recording in place; no separate
    /// output file is produced and only the recording's size is refreshed
    #[serde(default)]
    pub ts_modify: bool,
}

fn default_encode_suffix() -> String {
    ".mp4".to_string()
}

/// Encode queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodeConfig {
    /// Encoder executable substituted for %FFMPEG%
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// Maximum concurrent encode processes (0 = auto-derive)
    #[serde(default)]
    pub max_concurrent_jobs: u32,
    /// Directory encoded files are written to
    #[serde(default = "default_encode_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub presets: Vec<EncodePreset>,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_encode_output_dir() -> PathBuf {
    PathBuf::from("./encoded")
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            max_concurrent_jobs: 0,
            output_dir: default_encode_output_dir(),
            presets: Vec::new(),
        }
    }
}

/// A named streaming command template
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamMode {
    pub name: String,
    /// Command template (%FFMPEG%, %INPUT%, %OUTPUT%, %streamFileDir%, %streamNum%)
    pub command: String,
}

/// Streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamConfig {
    /// Directory HLS playlists and segments are written to
    #[serde(default = "default_stream_dir")]
    pub stream_dir: PathBuf,
    /// Maximum simultaneous streams (0 = auto-derive)
    #[serde(default)]
    pub max_streams: u32,
    /// Live input URL template (%CHANNEL%)
    #[serde(default)]
    pub live_source: Option<String>,
    #[serde(default)]
    pub recorded_hls: Vec<StreamMode>,
    #[serde(default)]
    pub live_hls: Vec<StreamMode>,
    /// Seconds a stream may go without being accessed before it is stopped (0 = never)
    #[serde(default)]
    pub session_timeout_secs: u64,
}

fn default_stream_dir() -> PathBuf {
    PathBuf::from("./streamfiles")
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stream_dir: default_stream_dir(),
            max_streams: 0,
            live_source: None,
            recorded_hls: Vec::new(),
            live_hls: Vec::new(),
            session_timeout_secs: 0,
        }
    }
}

/// Parent/worker channel configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcConfig {
    /// Milliseconds a request waits for its response
    #[serde(default = "default_ipc_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_ipc_timeout_ms() -> u64 {
    5000
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_ipc_timeout_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for rotated log files (stderr only if None)
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

fn default_state_file() -> PathBuf {
    PathBuf::from("./recstation-state.json")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
        }
    }
}

/// Status endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub tuners: Vec<TunerConfig>,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub encode: EncodeConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub ipc: IpcConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a TOML file
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
    /// - RECSTATION_TICK_INTERVAL_SECS -> scheduler.tick_interval_secs
    /// - RECSTATION_MAX_ENCODE_JOBS -> encode.max_concurrent_jobs
    /// - RECSTATION_MAX_STREAMS -> stream.max_streams
    /// - RECSTATION_FFMPEG_PATH -> encode.ffmpeg_path
    /// - RECSTATION_IPC_TIMEOUT_MS -> ipc.timeout_ms
    /// - RECSTATION_LOG_LEVEL -> logging.level
    /// - RECSTATION_STATE_FILE -> storage.state_file
    pub fn apply_env_overrides(&mut self) {
        if let Some(secs) = env_parse::<u64>("RECSTATION_TICK_INTERVAL_SECS") {
            self.scheduler.tick_interval_secs = secs;
        }

        if let Some(jobs) = env_parse::<u32>("RECSTATION_MAX_ENCODE_JOBS") {
            self.encode.max_concurrent_jobs = jobs;
        }

        if let Some(streams) = env_parse::<u32>("RECSTATION_MAX_STREAMS") {
            self.stream.max_streams = streams;
        }

        if let Ok(val) = env::var("RECSTATION_FFMPEG_PATH") {
            if !val.is_empty() {
                self.encode.ffmpeg_path = val;
            }
        }

        if let Some(ms) = env_parse::<u64>("RECSTATION_IPC_TIMEOUT_MS") {
            self.ipc.timeout_ms = ms;
        }

        if let Ok(val) = env::var("RECSTATION_LOG_LEVEL") {
            if !val.is_empty() {
                self.logging.level = val;
            }
        }

        if let Ok(val) = env::var("RECSTATION_STATE_FILE") {
            if !val.is_empty() {
                self.storage.state_file = PathBuf::from(val);
            }
        }
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for tuner in &self.tuners {
            if !seen.insert(tuner.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate tuner id {}",
                    tuner.id
                )));
            }
        }

        for preset in &self.encode.presets {
            if preset.command.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "encode preset '{}' has an empty command",
                    preset.name
                )));
            }
        }

        for mode in self.stream.recorded_hls.iter().chain(&self.stream.live_hls) {
            if mode.command.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "stream mode '{}' has an empty command",
                    mode.name
                )));
            }
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
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.parse::<T>().ok())
}

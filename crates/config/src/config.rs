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
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
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

/// Scheduler-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Maximum concurrent jobs (0 = auto-derive from core count)
    #[serde(default)]
    pub max_concurrent_jobs: u32,
    /// Poll interval for the dispatch loop in milliseconds
    #[serde(default = "default_dispatch_poll_ms")]
    pub dispatch_poll_ms: u64,
}

fn default_dispatch_poll_ms() -> u64 {
    200
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 0,
            dispatch_poll_ms: default_dispatch_poll_ms(),
        }
    }
}

/// Storage paths for persisted engine state
///
/// All paths are explicit; the engine never derives state locations from the
/// current working directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Directory where per-job task state JSON files are stored
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Directory where diversity-selector dedup state files are stored
    #[serde(default = "default_dedup_state_dir")]
    pub dedup_state_dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state/tasks")
}

fn default_dedup_state_dir() -> PathBuf {
    PathBuf::from("state/dedup")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            dedup_state_dir: default_dedup_state_dir(),
        }
    }
}

/// Cleanup behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CleanupConfig {
    /// Delete temp files and unfinished outputs when a batch is cancelled (default true)
    #[serde(default = "default_cleanup_on_cancel")]
    pub cleanup_on_cancel: bool,
    /// Grace period in seconds before force-killing encoder processes on cancel
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: f64,
}

fn default_cleanup_on_cancel() -> bool {
    true
}

fn default_cancel_grace_secs() -> f64 {
    2.0
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            cleanup_on_cancel: default_cleanup_on_cancel(),
            cancel_grace_secs: default_cancel_grace_secs(),
        }
    }
}

/// Retry behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum retries per task (default 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - VIDMERGE_MAX_CONCURRENT_JOBS -> scheduler.max_concurrent_jobs
    /// - VIDMERGE_STATE_DIR -> storage.state_dir
    /// - VIDMERGE_DEDUP_STATE_DIR -> storage.dedup_state_dir
    /// - VIDMERGE_CLEANUP_ON_CANCEL -> cleanup.cleanup_on_cancel
    /// - VIDMERGE_CANCEL_GRACE_SECS -> cleanup.cancel_grace_secs
    /// - VIDMERGE_MAX_RETRIES -> retry.max_retries
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("VIDMERGE_MAX_CONCURRENT_JOBS") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.scheduler.max_concurrent_jobs = jobs;
            }
        }

        if let Ok(val) = env::var("VIDMERGE_STATE_DIR") {
            if !val.is_empty() {
                self.storage.state_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("VIDMERGE_DEDUP_STATE_DIR") {
            if !val.is_empty() {
                self.storage.dedup_state_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("VIDMERGE_CLEANUP_ON_CANCEL") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.cleanup.cleanup_on_cancel = true,
                "false" | "0" | "no" => self.cleanup.cleanup_on_cancel = false,
                _ => {} // Invalid value, keep existing
            }
        }

        if let Ok(val) = env::var("VIDMERGE_CANCEL_GRACE_SECS") {
            if let Ok(secs) = val.parse::<f64>() {
                self.cleanup.cancel_grace_secs = secs;
            }
        }

        if let Ok(val) = env::var("VIDMERGE_MAX_RETRIES") {
            if let Ok(retries) = val.parse::<u32>() {
                self.retry.max_retries = retries;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Resolve the effective worker-pool size
    ///
    /// Uses the explicit value if non-zero, otherwise derives it: two workers
    /// on multi-core machines, one on a single core.
    pub fn effective_max_concurrent_jobs(&self) -> u32 {
        if self.scheduler.max_concurrent_jobs > 0 {
            self.scheduler.max_concurrent_jobs
        } else {
            derive_max_jobs(num_cpus::get() as u32)
        }
    }
}

/// Derive max concurrent jobs based on core count
/// - 2 jobs for 2+ cores
/// - 1 job on a single core
fn derive_max_jobs(cores: u32) -> u32 {
    if cores >= 2 {
        2
    } else {
        1
    }
}

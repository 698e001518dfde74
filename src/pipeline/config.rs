//! Pipeline configuration for the orchestrator and job registry.
//!
//! This module provides configuration options for demo-generation runs:
//! snapshot and template locations, job metadata persistence, per-stage
//! timeouts, job log capacity, retention of finished jobs, and the summary
//! fields surfaced to clients on completion.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the pipeline orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    // Persistence settings
    /// Root directory for stage snapshots. Snapshots are disabled when unset.
    pub snapshot_dir: Option<PathBuf>,
    /// Directory holding hand-authored state templates.
    pub template_dir: PathBuf,
    /// Directory for per-job metadata files. Disabled when unset.
    pub metadata_dir: Option<PathBuf>,
    /// Replace existing snapshots instead of rejecting a second capture.
    pub overwrite_snapshots: bool,

    // Execution settings
    /// Default timeout applied to each stage. No timeout when unset.
    pub stage_timeout: Option<Duration>,
    /// Timeout for draining in-flight jobs on shutdown.
    pub shutdown_timeout: Duration,

    // Job record settings
    /// Number of log lines kept per job.
    pub log_capacity: usize,
    /// How long finished jobs remain queryable.
    pub retention: Duration,
    /// State keys copied into the job record on completion.
    pub summary_keys: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: None,
            template_dir: PathBuf::from("./templates"),
            metadata_dir: None,
            overwrite_snapshots: false,

            stage_timeout: None,
            shutdown_timeout: Duration::from_secs(30),

            log_capacity: 200,
            retention: Duration::from_secs(3600), // 1 hour
            summary_keys: vec![
                "dataset_id".to_string(),
                "demo_title".to_string(),
                "table_names".to_string(),
            ],
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DEMO_FORGE_SNAPSHOT_DIR`: Snapshot root directory (default: disabled)
    /// - `DEMO_FORGE_TEMPLATE_DIR`: Template directory (default: ./templates)
    /// - `DEMO_FORGE_METADATA_DIR`: Job metadata directory (default: disabled)
    /// - `DEMO_FORGE_OVERWRITE_SNAPSHOTS`: Replace existing snapshots (default: false)
    /// - `DEMO_FORGE_STAGE_TIMEOUT_SECS`: Per-stage timeout (default: none)
    /// - `DEMO_FORGE_SHUTDOWN_TIMEOUT_SECS`: Shutdown drain timeout (default: 30)
    /// - `DEMO_FORGE_LOG_CAPACITY`: Log lines kept per job (default: 200)
    /// - `DEMO_FORGE_RETENTION_SECS`: Finished job retention (default: 3600)
    /// - `DEMO_FORGE_SUMMARY_KEYS`: Comma-separated summary keys
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("DEMO_FORGE_SNAPSHOT_DIR") {
            config.snapshot_dir = Some(PathBuf::from(val));
        }

        if let Ok(val) = std::env::var("DEMO_FORGE_TEMPLATE_DIR") {
            config.template_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("DEMO_FORGE_METADATA_DIR") {
            config.metadata_dir = Some(PathBuf::from(val));
        }

        if let Ok(val) = std::env::var("DEMO_FORGE_OVERWRITE_SNAPSHOTS") {
            config.overwrite_snapshots = parse_env_bool(&val, "DEMO_FORGE_OVERWRITE_SNAPSHOTS")?;
        }

        if let Ok(val) = std::env::var("DEMO_FORGE_STAGE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "DEMO_FORGE_STAGE_TIMEOUT_SECS")?;
            config.stage_timeout = Some(Duration::from_secs(secs));
        }

        if let Ok(val) = std::env::var("DEMO_FORGE_SHUTDOWN_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "DEMO_FORGE_SHUTDOWN_TIMEOUT_SECS")?;
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("DEMO_FORGE_LOG_CAPACITY") {
            config.log_capacity = parse_env_value(&val, "DEMO_FORGE_LOG_CAPACITY")?;
        }

        if let Ok(val) = std::env::var("DEMO_FORGE_RETENTION_SECS") {
            let secs: u64 = parse_env_value(&val, "DEMO_FORGE_RETENTION_SECS")?;
            config.retention = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("DEMO_FORGE_SUMMARY_KEYS") {
            config.summary_keys = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "log_capacity must be greater than 0".to_string(),
            ));
        }

        if self.retention.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "retention must be greater than 0".to_string(),
            ));
        }

        if self.shutdown_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "shutdown_timeout must be greater than 0".to_string(),
            ));
        }

        if matches!(self.stage_timeout, Some(t) if t.is_zero()) {
            return Err(ConfigError::ValidationFailed(
                "stage_timeout must be greater than 0 when set".to_string(),
            ));
        }

        if self.summary_keys.iter().any(|k| k.trim().is_empty()) {
            return Err(ConfigError::ValidationFailed(
                "summary_keys cannot contain empty keys".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to enable snapshots under the given directory.
    pub fn with_snapshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snapshot_dir = Some(dir.into());
        self
    }

    /// Builder method to set the template directory.
    pub fn with_template_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.template_dir = dir.into();
        self
    }

    /// Builder method to enable job metadata persistence.
    pub fn with_metadata_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.metadata_dir = Some(dir.into());
        self
    }

    /// Builder method to allow overwriting existing snapshots.
    pub fn with_overwrite_snapshots(mut self, overwrite: bool) -> Self {
        self.overwrite_snapshots = overwrite;
        self
    }

    /// Builder method to set the default per-stage timeout.
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = Some(timeout);
        self
    }

    /// Builder method to set the shutdown drain timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Builder method to set the per-job log capacity.
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    /// Builder method to set the finished-job retention window.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Builder method to set the summary keys.
    pub fn with_summary_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.summary_keys = keys.into_iter().map(Into::into).collect();
        self
    }
}

/// Parses an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
}

/// Parses a boolean environment variable.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.snapshot_dir.is_none());
        assert!(config.metadata_dir.is_none());
        assert_eq!(config.log_capacity, 200);
        assert_eq!(config.retention, Duration::from_secs(3600));
        assert_eq!(config.summary_keys.len(), 3);
    }

    #[test]
    fn test_builder_methods() {
        let config = PipelineConfig::new()
            .with_snapshot_dir("/tmp/snaps")
            .with_metadata_dir("/tmp/jobs")
            .with_stage_timeout(Duration::from_secs(90))
            .with_log_capacity(10)
            .with_retention(Duration::from_secs(60))
            .with_summary_keys(["dataset_id"])
            .with_overwrite_snapshots(true);

        assert_eq!(config.snapshot_dir, Some(PathBuf::from("/tmp/snaps")));
        assert_eq!(config.metadata_dir, Some(PathBuf::from("/tmp/jobs")));
        assert_eq!(config.stage_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.log_capacity, 10);
        assert_eq!(config.summary_keys, vec!["dataset_id".to_string()]);
        assert!(config.overwrite_snapshots);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_failures() {
        let config = PipelineConfig::new().with_log_capacity(0);
        assert!(config.validate().is_err());

        let config = PipelineConfig::new().with_retention(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = PipelineConfig::new().with_stage_timeout(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = PipelineConfig::new().with_summary_keys(["dataset_id", " "]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_env_helpers() {
        assert_eq!(parse_env_value::<u64>(" 42 ", "K").expect("parses"), 42);
        assert!(parse_env_value::<u64>("abc", "K").is_err());
        assert!(parse_env_bool("YES", "K").expect("parses"));
        assert!(!parse_env_bool("off", "K").expect("parses"));
        assert!(parse_env_bool("maybe", "K").is_err());
    }
}

//! Configuration system for batchflow with per-project overrides.
//!
//! Config priority: explicit path > project-relative (.batchflow/config.toml)
//! > user (~/.config/batchflow/config.toml) > defaults

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("IO error reading {path:?}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Invalid TOML in {path:?}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },
  #[error("Invalid config: {0}")]
  Invalid(String),
}

// ============================================================================
// Orchestrator Configuration
// ============================================================================

/// Dispatch limits for the batch orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
  /// Maximum number of batches in flight at once (default: 4)
  pub max_in_flight: usize,

  /// Work items per batch when splitting (default: 16)
  pub batch_size: usize,

  /// Deadline for a single attempt in milliseconds (default: 30000)
  pub timeout_millis: u64,

  /// Delay before a failed batch rejoins the ready queue (default: 0)
  pub request_delay_millis: u64,

  /// Retries after the first attempt before a batch is failed for good (default: 3)
  pub max_retries: u32,
}

impl Default for OrchestratorConfig {
  fn default() -> Self {
    Self {
      max_in_flight: 4,
      batch_size: 16,
      timeout_millis: 30_000,
      request_delay_millis: 0,
      max_retries: 3,
    }
  }
}

impl OrchestratorConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_millis)
  }

  pub fn request_delay(&self) -> Duration {
    Duration::from_millis(self.request_delay_millis)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.max_in_flight == 0 {
      return Err(ConfigError::Invalid("orchestrator.max_in_flight must be at least 1".into()));
    }
    if self.batch_size == 0 {
      return Err(ConfigError::Invalid("orchestrator.batch_size must be at least 1".into()));
    }
    if self.timeout_millis == 0 {
      return Err(ConfigError::Invalid("orchestrator.timeout_millis must be at least 1".into()));
    }
    Ok(())
  }
}

// ============================================================================
// Logging Configuration
// ============================================================================

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Log level: "off", "error", "warn", "info", "debug", "trace"
  /// Default: "info"
  pub level: String,

  /// Also write logs to a file in the data directory (default: false)
  pub file: bool,

  /// Log file rotation: "daily", "hourly", "never"
  /// Default: "daily"
  pub rotation: String,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: false,
      rotation: "daily".to_string(),
    }
  }
}

// ============================================================================
// Main Configuration
// ============================================================================

/// Main configuration struct
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
  pub orchestrator: OrchestratorConfig,
  pub logging: LoggingConfig,
}

impl Config {
  /// Load the effective config for a directory, falling back to defaults.
  ///
  /// Unreadable or malformed files are skipped.
  pub fn load_for_project(project_path: &Path) -> Self {
    // Try project-relative first
    let project_config = Self::project_config_path(project_path);
    if project_config.exists()
      && let Ok(config) = Self::load_from_path(&project_config)
    {
      return config;
    }

    // Fall back to user config
    if let Some(user_config_path) = Self::user_config_path()
      && user_config_path.exists()
      && let Ok(config) = Self::load_from_path(&user_config_path)
    {
      return config;
    }

    // Default
    Self::default()
  }

  /// Load a specific file. Unlike [`Config::load_for_project`], errors are returned.
  pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }

  /// Get the user-level config path
  pub fn user_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("BATCHFLOW_CONFIG_DIR") {
      return Some(PathBuf::from(path).join("config.toml"));
    }

    if let Ok(path) = std::env::var("XDG_CONFIG_HOME") {
      return Some(PathBuf::from(path).join("batchflow").join("config.toml"));
    }

    dirs::config_dir().map(|p: PathBuf| p.join("batchflow").join("config.toml"))
  }

  /// Get the project-relative config path
  pub fn project_config_path(project_path: &Path) -> PathBuf {
    project_path.join(".batchflow").join("config.toml")
  }

  /// Directory for log files
  pub fn data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("BATCHFLOW_DATA_DIR") {
      return PathBuf::from(path);
    }

    dirs::data_local_dir()
      .map(|p| p.join("batchflow"))
      .unwrap_or_else(|| PathBuf::from(".batchflow"))
  }

  /// Generate a default config file as a string
  pub fn generate_template() -> String {
    let defaults = Config::default();
    let o = &defaults.orchestrator;
    let l = &defaults.logging;

    format!(
      r#"# batchflow configuration
# Place in .batchflow/config.toml (project) or ~/.config/batchflow/config.toml (user)

# ============================================================================
# Orchestrator
# ============================================================================

[orchestrator]
# Maximum number of batches dispatched at the same time
max_in_flight = {max_in_flight}

# Work items per batch when a flat list is split
batch_size = {batch_size}

# Deadline for one attempt (milliseconds). Late completions are ignored.
timeout_millis = {timeout_millis}

# Delay before a failed or timed-out batch rejoins the queue (milliseconds)
request_delay_millis = {request_delay_millis}

# Retries after the first attempt; a batch gets at most max_retries + 1 attempts
max_retries = {max_retries}

# ============================================================================
# Logging
# ============================================================================

[logging]
# off, error, warn, info, debug, trace (RUST_LOG overrides)
level = "{level}"

# Also write logs to the data directory
file = {file}

# daily, hourly, never
rotation = "{rotation}"
"#,
      max_in_flight = o.max_in_flight,
      batch_size = o.batch_size,
      timeout_millis = o.timeout_millis,
      request_delay_millis = o.request_delay_millis,
      max_retries = o.max_retries,
      level = l.level,
      file = l.file,
      rotation = l.rotation,
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn test_orchestrator_defaults() {
    let config = OrchestratorConfig::default();
    assert_eq!(config.max_in_flight, 4);
    assert_eq!(config.batch_size, 16);
    assert_eq!(config.timeout(), Duration::from_secs(30));
    assert_eq!(config.request_delay(), Duration::ZERO);
    assert_eq!(config.max_retries, 3);
    assert!(config.validate().is_ok());
  }

  #[test]
  fn test_validate_rejects_zero_limits() {
    let config = OrchestratorConfig {
      max_in_flight: 0,
      ..Default::default()
    };
    assert!(config.validate().unwrap_err().to_string().contains("max_in_flight"));

    let config = OrchestratorConfig {
      timeout_millis: 0,
      ..Default::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_load_project_config() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join(".batchflow");
    std::fs::create_dir_all(&dir).unwrap();

    let config_content = r#"
[orchestrator]
max_in_flight = 8
timeout_millis = 500

[logging]
level = "debug"
"#;
    std::fs::write(dir.join("config.toml"), config_content).unwrap();

    let config = Config::load_for_project(temp.path());
    assert_eq!(config.orchestrator.max_in_flight, 8);
    assert_eq!(config.orchestrator.timeout_millis, 500);
    // Unset keys keep their defaults
    assert_eq!(config.orchestrator.max_retries, 3);
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.logging.rotation, "daily");
  }

  #[test]
  fn test_load_from_path_reports_parse_errors() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("broken.toml");
    std::fs::write(&path, "[orchestrator\nmax_in_flight = ").unwrap();

    let err = Config::load_from_path(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
  }

  #[test]
  fn test_load_from_missing_path() {
    let temp = TempDir::new().unwrap();
    let err = Config::load_from_path(&temp.path().join("nope.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
  }

  #[test]
  fn test_template_parses_to_defaults() {
    let template = Config::generate_template();
    assert!(template.contains("[orchestrator]"));
    assert!(template.contains("[logging]"));

    let parsed: Config = toml::from_str(&template).unwrap();
    assert_eq!(parsed, Config::default());
  }

  #[test]
  fn test_toml_roundtrip() {
    let config = Config {
      orchestrator: OrchestratorConfig {
        max_in_flight: 2,
        request_delay_millis: 250,
        ..Default::default()
      },
      ..Default::default()
    };

    let toml_str = toml::to_string_pretty(&config).unwrap();
    let parsed: Config = toml::from_str(&toml_str).unwrap();
    assert_eq!(parsed, config);
  }
}

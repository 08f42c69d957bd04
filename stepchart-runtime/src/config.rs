//! Host configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via STEPCHART_CONFIG or --config)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use stepchart_core::{InterpreterOptions, UnhandledErrorPolicy};
use stepchart_wal::LogConfig;
use thiserror::Error;

/// Host configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Interpreter settings.
    pub engine: EngineConfig,
    /// Session log settings.
    pub storage: StorageConfig,
}

impl Config {
    /// Loads configuration from the file named by `STEPCHART_CONFIG`, then
    /// applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var("STEPCHART_CONFIG") {
            Ok(path) => Self::load_from(Some(Path::new(&path))),
            Err(_) => Self::load_from(None),
        }
    }

    /// Loads configuration from `path` if given, then applies environment
    /// variable overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.engine.apply_env_overrides();
        self.storage.apply_env_overrides();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.livelock_window == 0 {
            return Err(ConfigError::Validation(
                "engine.livelock_window must be at least 1".to_string(),
            ));
        }
        if self.engine.queue_capacity == Some(0) {
            return Err(ConfigError::Validation(
                "engine.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.storage.rollback_level > stepchart_wal::MAX_LEVEL {
            return Err(ConfigError::Validation(format!(
                "storage.rollback_level must be at most {}",
                stepchart_wal::MAX_LEVEL
            )));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Interpreter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Microsteps in the live-lock window.
    pub livelock_window: usize,
    /// What to do with `error.*` events no transition handles.
    pub unhandled_errors: UnhandledErrorPolicy,
    /// Capacity of each session's external queue (unbounded if unset).
    pub queue_capacity: Option<usize>,
    /// Whether data model locations are case-sensitive.
    pub case_sensitive: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let options = InterpreterOptions::default();
        Self {
            livelock_window: options.livelock_window,
            unhandled_errors: options.unhandled_errors,
            queue_capacity: None,
            case_sensitive: options.case_sensitive,
        }
    }
}

impl EngineConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(window) = std::env::var("STEPCHART_LIVELOCK_WINDOW") {
            if let Ok(n) = window.parse() {
                self.livelock_window = n;
            }
        }

        if let Ok(policy) = std::env::var("STEPCHART_UNHANDLED_ERRORS") {
            self.unhandled_errors = match policy.to_lowercase().as_str() {
                "halt" => UnhandledErrorPolicy::Halt,
                "destroy" => UnhandledErrorPolicy::Destroy,
                _ => UnhandledErrorPolicy::Ignore,
            };
        }

        if let Ok(capacity) = std::env::var("STEPCHART_QUEUE_CAPACITY") {
            self.queue_capacity = capacity.parse().ok().filter(|n| *n > 0);
        }

        if let Ok(case) = std::env::var("STEPCHART_CASE_SENSITIVE") {
            self.case_sensitive = case == "1" || case.to_lowercase() == "true";
        }
    }

    /// Returns the interpreter options for these settings.
    pub fn interpreter_options(&self) -> InterpreterOptions {
        InterpreterOptions::default()
            .with_livelock_window(self.livelock_window)
            .with_unhandled_errors(self.unhandled_errors)
            .with_case_sensitive(self.case_sensitive)
    }
}

/// Session log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one log file per session.
    pub data_dir: PathBuf,
    /// Fsync policy.
    pub fsync_policy: FsyncPolicy,
    /// Shrink a log at a stable state once it exceeds this many KiB.
    pub shrink_threshold_kb: u64,
    /// Highest checkpoint level kept when a log is replayed.
    pub rollback_level: u8,
}

/// Fsync policy for checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsyncPolicy {
    /// Fsync after every checkpoint (safest, slowest).
    EveryCheckpoint,
    /// Fsync after N checkpoints, and always on stable states.
    EveryN(u32),
    /// Never fsync, rely on OS (fastest, least safe).
    Never,
}

impl From<FsyncPolicy> for stepchart_wal::FsyncPolicy {
    fn from(policy: FsyncPolicy) -> Self {
        match policy {
            FsyncPolicy::EveryCheckpoint => stepchart_wal::FsyncPolicy::EveryCheckpoint,
            FsyncPolicy::EveryN(n) => stepchart_wal::FsyncPolicy::EveryN(n),
            FsyncPolicy::Never => stepchart_wal::FsyncPolicy::Never,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            fsync_policy: FsyncPolicy::EveryCheckpoint,
            shrink_threshold_kb: 1024,
            rollback_level: stepchart_wal::MAX_LEVEL,
        }
    }
}

impl StorageConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("STEPCHART_DATA") {
            self.data_dir = PathBuf::from(dir);
        }

        if let Ok(policy) = std::env::var("STEPCHART_FSYNC_POLICY") {
            self.fsync_policy = match policy.to_lowercase().as_str() {
                "every_checkpoint" | "everycheckpoint" => FsyncPolicy::EveryCheckpoint,
                "never" => FsyncPolicy::Never,
                s if s.starts_with("every_n:") => {
                    let n = s[8..].parse().unwrap_or(100);
                    FsyncPolicy::EveryN(n)
                }
                _ => FsyncPolicy::EveryCheckpoint,
            };
        }

        if let Ok(size) = std::env::var("STEPCHART_SHRINK_THRESHOLD_KB") {
            if let Ok(kb) = size.parse() {
                self.shrink_threshold_kb = kb;
            }
        }

        if let Ok(level) = std::env::var("STEPCHART_ROLLBACK_LEVEL") {
            if let Ok(n) = level.parse() {
                self.rollback_level = n;
            }
        }
    }

    /// Returns the log file of a session.
    ///
    /// The id becomes a file name inside `data_dir`, so ids that could name
    /// a path elsewhere are rejected.
    pub fn log_path(&self, session: &str) -> Result<PathBuf, ConfigError> {
        if session.is_empty()
            || session == "."
            || session.contains("..")
            || session.contains(['/', '\\', '\0'])
        {
            return Err(ConfigError::InvalidSessionId(session.to_string()));
        }
        Ok(self.data_dir.join(format!("{}.log", session)))
    }

    /// Returns the log settings for these options.
    pub fn log_config(&self) -> LogConfig {
        LogConfig::default()
            .with_fsync_policy(self.fsync_policy.into())
            .with_shrink_threshold(self.shrink_threshold_kb * 1024)
            .with_rollback_level(self.rollback_level)
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),

    #[error("session id '{0}' cannot be used as a log file name")]
    InvalidSessionId(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.engine.livelock_window, 36);
        assert_eq!(config.engine.unhandled_errors, UnhandledErrorPolicy::Ignore);
        assert!(config.engine.queue_capacity.is_none());
        assert_eq!(config.storage.shrink_threshold_kb, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_log_path_rejects_unsafe_ids() {
        let config = StorageConfig::default();
        for id in ["", ".", "../x", "a/b", "a\\b", "x..y", "nul\0"] {
            assert!(
                matches!(config.log_path(id), Err(ConfigError::InvalidSessionId(_))),
                "{:?} was accepted",
                id
            );
        }
        assert!(config.log_path("order-42_v1.b").is_ok());
    }

    #[test]
    fn test_storage_paths() {
        let config = StorageConfig::default();
        assert_eq!(
            config.log_path("abc").unwrap(),
            PathBuf::from("./data/abc.log")
        );
        let log = config.log_config();
        assert_eq!(log.shrink_threshold, 1024 * 1024);
        assert_eq!(log.fsync_policy, stepchart_wal::FsyncPolicy::EveryCheckpoint);
    }

    #[test]
    fn test_yaml_sections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stepchart.yaml");
        std::fs::write(
            &path,
            "engine:\n  livelock_window: 12\n  unhandled_errors: halt\nstorage:\n  fsync_policy: never\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.engine.livelock_window, 12);
        assert_eq!(config.engine.unhandled_errors, UnhandledErrorPolicy::Halt);
        assert_eq!(config.storage.fsync_policy, FsyncPolicy::Never);
        // Sections not in the file keep their defaults.
        assert!(config.engine.case_sensitive);
        assert_eq!(config.storage.data_dir, PathBuf::from("./data"));

        let options = config.engine.interpreter_options();
        assert_eq!(options.livelock_window, 12);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("saved.yaml");
        let mut config = Config::default();
        config.storage.fsync_policy = FsyncPolicy::EveryN(8);
        config.save(&path).unwrap();

        let parsed = Config::from_file(&path).unwrap();
        assert_eq!(parsed.storage.fsync_policy, FsyncPolicy::EveryN(8));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.engine.livelock_window = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        let mut config = Config::default();
        config.storage.rollback_level = 64;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/stepchart.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_, _)));
    }
}

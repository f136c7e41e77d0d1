//! Engine configuration.
//!
//! Loaded from a TOML file or built in code; every field has a default.
//!
//! ```toml
//! download_retry_limit = 3
//! transfer_expiry_secs = 3600
//! deferred_poll_interval_secs = 10
//! batch_expiry_secs = 3600
//! command_buffer = 256
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunables of the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Failed download attempts tolerated per file before eviction (default: 3).
    #[serde(default = "default_download_retry_limit")]
    pub download_retry_limit: u32,
    /// Seconds before an in-flight transfer counts as stalled (default: 3600).
    #[serde(default = "default_transfer_expiry_secs")]
    pub transfer_expiry_secs: u64,
    /// Seconds between deferred-status polls (default: 10).
    #[serde(default = "default_deferred_poll_interval_secs")]
    pub deferred_poll_interval_secs: u64,
    /// Seconds the server keeps an unfinished upload batch (default: 3600).
    #[serde(default = "default_batch_expiry_secs")]
    pub batch_expiry_secs: u64,
    /// Capacity of the engine command channel (default: 256).
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
}

fn default_download_retry_limit() -> u32 {
    3
}

fn default_transfer_expiry_secs() -> u64 {
    3600 // 1 hour
}

fn default_deferred_poll_interval_secs() -> u64 {
    10
}

fn default_batch_expiry_secs() -> u64 {
    3600 // 1 hour
}

fn default_command_buffer() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_retry_limit: default_download_retry_limit(),
            transfer_expiry_secs: default_transfer_expiry_secs(),
            deferred_poll_interval_secs: default_deferred_poll_interval_secs(),
            batch_expiry_secs: default_batch_expiry_secs(),
            command_buffer: default_command_buffer(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Set the download retry limit.
    pub fn with_download_retry_limit(mut self, limit: u32) -> Self {
        self.download_retry_limit = limit;
        self
    }

    /// Set the stall deadline for in-flight transfers.
    pub fn with_transfer_expiry_secs(mut self, secs: u64) -> Self {
        self.transfer_expiry_secs = secs;
        self
    }

    /// Set the deferred poll interval.
    pub fn with_deferred_poll_interval_secs(mut self, secs: u64) -> Self {
        self.deferred_poll_interval_secs = secs;
        self
    }

    /// Set the batch expiry sent with uploads.
    pub fn with_batch_expiry_secs(mut self, secs: u64) -> Self {
        self.batch_expiry_secs = secs;
        self
    }

    /// Set the command channel capacity.
    pub fn with_command_buffer(mut self, capacity: usize) -> Self {
        self.command_buffer = capacity;
        self
    }

    /// Deferred poll interval as a duration. Never zero.
    pub fn deferred_poll_interval(&self) -> Duration {
        Duration::from_secs(self.deferred_poll_interval_secs.max(1))
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.download_retry_limit, 3);
        assert_eq!(config.transfer_expiry_secs, 3600);
        assert_eq!(config.deferred_poll_interval_secs, 10);
        assert_eq!(config.batch_expiry_secs, 3600);
        assert_eq!(config.command_buffer, 256);
    }

    #[test]
    fn empty_toml_uses_defaults() {
        assert_eq!(EngineConfig::from_toml("").unwrap(), EngineConfig::default());
    }

    #[test]
    fn partial_toml_overrides() {
        let config = EngineConfig::from_toml("download_retry_limit = 5\n").unwrap();
        assert_eq!(config.download_retry_limit, 5);
        assert_eq!(config.transfer_expiry_secs, 3600);
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "deferred_poll_interval_secs = 2").unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.deferred_poll_interval(), Duration::from_secs(2));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = EngineConfig::load(Path::new("/nonexistent/objsync.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn load_reports_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "download_retry_limit = \"many\"").unwrap();
        let err = EngineConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn builder_setters() {
        let config = EngineConfig::default()
            .with_download_retry_limit(1)
            .with_transfer_expiry_secs(0)
            .with_deferred_poll_interval_secs(0)
            .with_batch_expiry_secs(60)
            .with_command_buffer(8);
        assert_eq!(config.download_retry_limit, 1);
        assert_eq!(config.transfer_expiry_secs, 0);
        assert_eq!(config.deferred_poll_interval(), Duration::from_secs(1));
        assert_eq!(config.batch_expiry_secs, 60);
        assert_eq!(config.command_buffer, 8);
    }
}

//! Engine configuration via `converge.toml`
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Embedders either construct [`EngineConfig`] directly or load it from a
//! file next to their data.

use converge_core::error::{Error, Result};
use converge_storage::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file name used by [`EngineConfig::write_default_if_missing`] callers.
pub const CONFIG_FILE_NAME: &str = "converge.toml";

fn default_workers() -> usize {
    4
}

fn default_retry_delay_ms() -> u64 {
    20
}

fn default_modify_retries() -> usize {
    16
}

fn default_true() -> bool {
    true
}

/// Engine configuration loaded from `converge.toml`.
///
/// # Example
///
/// ```toml
/// workers = 4
/// retry_delay_ms = 20
/// modify_retries = 16
/// hashed_versions = false
/// resync_on_start = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of reconciliation worker threads.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Delay before a busy or waiting element is looked at again.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Compare-and-set retries before an update gives up as outdated.
    #[serde(default = "default_modify_retries")]
    pub modify_retries: usize,
    /// Persist SHA-256 formal versions instead of the textual form.
    #[serde(default)]
    pub hashed_versions: bool,
    /// Queue every stored object when the engine starts.
    #[serde(default = "default_true")]
    pub resync_on_start: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            retry_delay_ms: default_retry_delay_ms(),
            modify_retries: default_modify_retries(),
            hashed_versions: false,
            resync_on_start: true,
        }
    }
}

impl EngineConfig {
    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Converge engine configuration
#
# Reconciliation worker threads (default: 4)
workers = 4

# Milliseconds before a busy or waiting element is retried (default: 20)
retry_delay_ms = 20

# Compare-and-set retries per update (default: 16)
modify_retries = 16

# Persist hashed formal versions instead of the readable form (default: false)
hashed_versions = false

# Queue every stored object on start (default: true)
resync_on_start = true
"#
    }

    /// Parse config from TOML text and validate it.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the text does not parse or fails validation.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{} ({})", msg, path.display())),
            other => other,
        })
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::Config(format!(
                    "failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            Error::Config(format!(
                "failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".into()));
        }
        Ok(())
    }

    /// Delay before retrying a busy or waiting element.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Backoff used by compare-and-set updates.
    pub fn retry(&self) -> RetryConfig {
        RetryConfig::new().with_max_retries(self.modify_retries)
    }
}

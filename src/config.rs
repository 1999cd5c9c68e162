//! Worker configuration
//!
//! Loaded once at startup from a TOML file; every section is optional.
//! Connection settings for Redis and MinIO come from the environment.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::sandbox::SandboxConfig;

/// Default config file location
pub const DEFAULT_CONFIG_PATH: &str = "./judgehost.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sandbox: SandboxConfig,
    pub data: DataConfig,
    pub special_judge: SpecialJudgeConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Root of the per-problem test data cache
    pub cache_dir: PathBuf,
    /// Serve data files from this directory instead of MinIO
    pub local_store: Option<PathBuf>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/var/cache/judgehost/data"),
            local_store: None,
        }
    }
}

/// Special judges run problem-supplied code with the worker's privileges,
/// so they are off unless a problem is listed here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecialJudgeConfig {
    pub trusted_problems: Vec<i64>,
    pub timeout_secs: u64,
}

impl Default for SpecialJudgeConfig {
    fn default() -> Self {
        Self {
            trusted_problems: Vec::new(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of submissions judged at the same time
    pub concurrency: usize,
    /// Language table; the built-in table is used when unset
    pub languages: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            languages: None,
        }
    }
}

impl Config {
    /// Parse a config from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Invalid config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load the config file, falling back to defaults when it does not exist
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        Self::from_toml(&content)
    }

    /// Load from `JUDGEHOST_CONFIG` or the default path
    pub fn from_env() -> Result<Self> {
        let path =
            std::env::var("JUDGEHOST_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        Self::load(path)
    }

    fn validate(&self) -> Result<()> {
        if self.worker.concurrency == 0 {
            anyhow::bail!("worker.concurrency must be at least 1");
        }
        if self.sandbox.fs_size_mb == 0 {
            anyhow::bail!("sandbox.fs_size_mb must be positive");
        }
        if !self.sandbox.home_path.is_absolute() {
            anyhow::bail!("sandbox.home_path must be absolute");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::BackendKind;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.sandbox.backend, BackendKind::Kernel);
        assert_eq!(config.worker.concurrency, 2);
        assert!(config.special_judge.trusted_problems.is_empty());
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_toml(
            r#"
[sandbox]
backend = "direct"
watchdog_grace_secs = 2

[special_judge]
trusted_problems = [1001, 1002]
"#,
        )
        .unwrap();
        assert_eq!(config.sandbox.backend, BackendKind::Direct);
        assert_eq!(config.sandbox.watchdog_grace_secs, 2);
        assert_eq!(config.sandbox.fs_size_mb, 512);
        assert_eq!(config.special_judge.trusted_problems, vec![1001, 1002]);
        assert_eq!(config.special_judge.timeout_secs, 30);
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        assert!(Config::from_toml("[worker]\nconcurrency = 0\n").is_err());
    }
}

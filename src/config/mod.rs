use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::paths::Paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// V8 heap ceiling per isolate in bytes (default: 128MB)
    #[serde(default = "default_memory_limit")]
    pub memory_limit_bytes: usize,

    /// Trusted helper root (tilde-expanded)
    #[serde(default = "default_helpers_dir")]
    pub helpers_dir: String,

    /// Deadline applied by the CLI before it cancels a run (default: 30s)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Time an aborted run waits for isolate teardown
    #[serde(default = "default_abort_grace_ms")]
    pub abort_grace_ms: u64,

    /// Maximum captured log bytes (default: 1MB)
    #[serde(default = "default_max_log_bytes")]
    pub max_log_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_memory_limit() -> usize {
    134_217_728 // 128MB
}
fn default_helpers_dir() -> String {
    "./helpers".to_string()
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_abort_grace_ms() -> u64 {
    250
}
fn default_max_log_bytes() -> usize {
    1_048_576 // 1MB
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: default_memory_limit(),
            helpers_dir: default_helpers_dir(),
            timeout_ms: default_timeout_ms(),
            abort_grace_ms: default_abort_grace_ms(),
            max_log_bytes: default_max_log_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SandboxConfig {
    pub fn helpers_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.helpers_dir).to_string())
    }
}

impl Config {
    /// Load from `path`, or from the default location when `None`.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(&path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        if config.sandbox.max_log_bytes == 0 {
            anyhow::bail!("sandbox.max_log_bytes must be greater than zero");
        }
        Ok(config)
    }

    pub fn config_path() -> Result<PathBuf> {
        let paths = Paths::resolve()?;
        Ok(paths.config_file())
    }
}

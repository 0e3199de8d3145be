//! Engine configuration.
//!
//! Loaded from a JSON file (`--config`), or from inline JSON in the
//! `EXEC_SANDBOX_CONFIG` environment variable, falling back to defaults.
//! A few scalar settings can then be overridden by dedicated env vars.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

/// Top-level configuration for the daemon.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Which isolation backend runs submissions.
    #[serde(default)]
    pub backend: BackendType,

    /// Maximum number of sandboxes alive at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Capacity of the asynchronous submission queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_output_cap")]
    pub stdout_byte_cap: usize,

    #[serde(default = "default_output_cap")]
    pub stderr_byte_cap: usize,

    #[serde(default = "default_source_cap")]
    pub source_byte_cap: usize,

    #[serde(default = "default_stdin_cap")]
    pub stdin_byte_cap: usize,

    /// Parent directory for per-execution scratch directories.
    /// Defaults to the system temp dir.
    #[serde(default)]
    pub scratch_root: Option<PathBuf>,

    /// Process-count cap inside each container.
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u32,

    /// Size of the writable `/tmp` tmpfs inside each container.
    #[serde(default = "default_tmpfs_bytes")]
    pub tmpfs_bytes: u64,

    /// Pull an image on first use when it is not present locally.
    #[serde(default = "default_true")]
    pub pull_missing_images: bool,

    /// Extra time granted for stopping a sandbox and draining its output.
    #[serde(default = "default_grace_period")]
    pub grace_period_seconds: u64,

    /// How long async results stay available after completion.
    #[serde(default = "default_retention")]
    pub result_retention_seconds: u64,

    /// Interval between sweeps of expired async results.
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_seconds: u64,

    /// Per-language resource overrides, keyed by language id.
    #[serde(default)]
    pub languages: HashMap<String, LanguageOverride>,
}

/// Resource overrides for one language.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LanguageOverride {
    #[serde(default)]
    pub wall_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub memory_bytes: Option<u64>,
    #[serde(default)]
    pub cpu_share: Option<f64>,
}

/// Available isolation backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Ephemeral Docker containers (network off, caps dropped, read-only root).
    #[default]
    Docker,
    /// Toolchains run directly on the host. Much weaker isolation; opt-in only.
    Host,
}

impl std::str::FromStr for BackendType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "host" => Ok(Self::Host),
            other => anyhow::bail!("Unknown backend '{other}' (expected 'docker' or 'host')"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendType::default(),
            max_concurrent: default_max_concurrent(),
            queue_capacity: default_queue_capacity(),
            stdout_byte_cap: default_output_cap(),
            stderr_byte_cap: default_output_cap(),
            source_byte_cap: default_source_cap(),
            stdin_byte_cap: default_stdin_cap(),
            scratch_root: None,
            pids_limit: default_pids_limit(),
            tmpfs_bytes: default_tmpfs_bytes(),
            pull_missing_images: true,
            grace_period_seconds: default_grace_period(),
            result_retention_seconds: default_retention(),
            reaper_interval_seconds: default_reaper_interval(),
            languages: HashMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from an optional file, then the environment.
    ///
    /// Priority: `path` > `EXEC_SANDBOX_CONFIG` inline JSON > defaults.
    /// Scalar env overrides are applied last, then the result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::from_env()?,
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Parse `EXEC_SANDBOX_CONFIG` when set, else use defaults.
    pub fn from_env() -> Result<Self> {
        match std::env::var("EXEC_SANDBOX_CONFIG") {
            Ok(json) => Self::from_json(&json).context("Failed to parse EXEC_SANDBOX_CONFIG"),
            Err(_) => {
                debug!("EXEC_SANDBOX_CONFIG not set, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    /// Apply `EXEC_SANDBOX_MAX_CONCURRENT` and `EXEC_SANDBOX_BACKEND`.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("EXEC_SANDBOX_MAX_CONCURRENT") {
            self.max_concurrent = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid EXEC_SANDBOX_MAX_CONCURRENT: '{value}'"))?;
        }
        if let Ok(value) = std::env::var("EXEC_SANDBOX_BACKEND") {
            self.backend = value.parse()?;
        }
        Ok(())
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.max_concurrent >= 1, "max_concurrent must be at least 1");
        anyhow::ensure!(
            self.queue_capacity >= self.max_concurrent,
            "queue_capacity ({}) must be >= max_concurrent ({})",
            self.queue_capacity,
            self.max_concurrent
        );
        anyhow::ensure!(
            self.stdout_byte_cap > 0 && self.stderr_byte_cap > 0,
            "output byte caps must be positive"
        );
        anyhow::ensure!(
            self.source_byte_cap > 0,
            "source_byte_cap must be positive"
        );
        anyhow::ensure!(self.pids_limit > 0, "pids_limit must be positive");
        for (language, over) in &self.languages {
            if let Some(share) = over.cpu_share {
                anyhow::ensure!(
                    share > 0.0 && share.is_finite(),
                    "cpu_share for '{language}' must be a positive number"
                );
            }
            if let Some(secs) = over.wall_timeout_seconds {
                anyhow::ensure!(secs > 0, "wall_timeout_seconds for '{language}' must be positive");
            }
            if let Some(bytes) = over.memory_bytes {
                // Docker refuses memory limits below 6 MiB.
                anyhow::ensure!(
                    bytes >= 6 * 1024 * 1024,
                    "memory_bytes for '{language}' must be at least 6 MiB"
                );
            }
        }
        Ok(())
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }

    pub const fn result_retention(&self) -> Duration {
        Duration::from_secs(self.result_retention_seconds)
    }

    pub const fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_seconds)
    }
}

const fn default_max_concurrent() -> usize {
    5
}

const fn default_queue_capacity() -> usize {
    64
}

const fn default_output_cap() -> usize {
    MIB
}

const fn default_source_cap() -> usize {
    256 * KIB
}

const fn default_stdin_cap() -> usize {
    MIB
}

const fn default_pids_limit() -> u32 {
    128
}

const fn default_tmpfs_bytes() -> u64 {
    64 * 1024 * 1024
}

const fn default_true() -> bool {
    true
}

const fn default_grace_period() -> u64 {
    2
}

const fn default_retention() -> u64 {
    600
}

const fn default_reaper_interval() -> u64 {
    60
}

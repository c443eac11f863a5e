//! Configuration management for Stepbook.
//!
//! Everything that would otherwise be process-wide state (scopes, selection,
//! concurrency, the deprecation registry) lives here and is passed explicitly
//! to the engine.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::duration;

/// Engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scheduling settings
    pub run: RunConfig,

    /// Runbook selection
    pub select: SelectConfig,

    /// What runbooks are allowed to do
    pub scopes: Scopes,

    /// Profiling
    pub profile: ProfileConfig,

    /// Warn-once registry for deprecated runbook syntax
    #[serde(skip)]
    pub deprecations: Deprecations,
}

/// Scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Maximum number of runbooks running at once (1 = sequential)
    pub concurrency: usize,

    /// Stop admitting runbooks after the first failure
    pub fail_fast: bool,

    /// Bound on the wait for runners to close after a run
    #[serde(with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub wait_timeout: Option<Duration>,

    /// Default pause between steps, overridden by a runbook's own `interval`
    #[serde(with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub interval: Option<Duration>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self { concurrency: 1, fail_fast: false, wait_timeout: None, interval: None }
    }
}

/// Runbook selection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectConfig {
    /// Regex matched against runbook paths
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    pub path_match: Option<String>,

    /// Label expressions; a runbook is kept if any of them holds
    pub labels: Vec<String>,

    /// ID prefixes; when given, only these run, in this order
    pub ids: Vec<String>,

    /// Drop runbooks included by another selected runbook
    pub skip_included: bool,

    /// Seed for shuffling the selection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shuffle: Option<u64>,

    /// Keep one shard of the selection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<Shard>,

    /// Keep N randomly chosen runbooks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample: Option<usize>,

    /// Run N randomly chosen runbooks, duplicates allowed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub random: Option<usize>,

    /// Seed for sample/random picks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// One shard out of `total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub index: usize,
    pub total: usize,
}

/// What runbooks may do.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Scopes {
    /// Allow `include`/`needs` paths that climb above the runbook's directory
    pub read_parent: bool,

    /// Allow the `exec` runner
    pub run_exec: bool,
}

impl Default for Scopes {
    fn default() -> Self {
        Self { read_parent: false, run_exec: true }
    }
}

/// Profiling settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Record spans for every runbook, step and hook
    pub enabled: bool,

    /// Where to write the span tree as JSON
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dump: Option<PathBuf>,
}

/// Deprecated syntax that has already been warned about.
#[derive(Debug, Clone, Default)]
pub struct Deprecations(Arc<Mutex<HashSet<String>>>);

impl Deprecations {
    /// Log `message` the first time `key` is seen. Returns whether it was logged.
    pub fn warn_once(&self, key: &str, message: &str) -> bool {
        let first = self.0.lock().insert(key.to_string());
        if first {
            tracing::warn!(key, "{message}");
        }
        first
    }

    /// Number of distinct deprecations seen so far.
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Looks for config in:
    /// 1. `.stepbook.toml` in current directory
    /// 2. `~/.config/stepbook/config.toml`
    /// 3. Falls back to defaults
    pub fn load() -> anyhow::Result<Self> {
        let local_config = PathBuf::from(".stepbook.toml");
        if local_config.exists() {
            return Self::load_from_file(&local_config);
        }

        if let Some(config_dir) = Self::config_dir() {
            let global_config = config_dir.join("config.toml");
            if global_config.exists() {
                return Self::load_from_file(&global_config);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the scheduler cannot honour.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.run.concurrency == 0 {
            anyhow::bail!("run.concurrency must be at least 1");
        }
        if let Some(shard) = self.select.shard {
            if shard.total == 0 || shard.index >= shard.total {
                anyhow::bail!("invalid shard {}/{}", shard.index, shard.total);
            }
        }
        if let Some(ref pattern) = self.select.path_match {
            regex::Regex::new(pattern)?;
        }
        Ok(())
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("stepbook"))
    }
}

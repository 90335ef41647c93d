//! Configuration management module
//!
//! `MigrateConfig` is loaded from an optional JSON file. Missing fields take
//! their defaults, so an empty `{}` is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `root_dir`
pub const ROOT_DIR_ENV: &str = "EE_ROOT_DIR";

pub const DEFAULT_ROOT_DIR: &str = "/opt/easyengine";

/// Migrator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrateConfig {
    /// EasyEngine root
    pub root_dir: PathBuf,
    /// Migration history file; defaults to `<root_dir>/db/migrations.json`
    pub history_file: Option<PathBuf>,
    /// Site records file; defaults to `<root_dir>/db/sites.json`
    pub sites_file: Option<PathBuf>,
    /// docker binary, looked up on PATH unless absolute
    pub docker_bin: String,
    /// Kill a docker command after this many seconds
    pub step_timeout_secs: Option<u64>,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(DEFAULT_ROOT_DIR),
            history_file: None,
            sites_file: None,
            docker_bin: "docker".to_string(),
            step_timeout_secs: None,
        }
    }
}

impl MigrateConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Apply `EE_ROOT_DIR` if set and non-empty
    pub fn apply_env_overrides(&mut self) {
        if let Some(root) = std::env::var_os(ROOT_DIR_ENV).filter(|v| !v.is_empty()) {
            self.root_dir = PathBuf::from(root);
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.root_dir.as_os_str().is_empty() {
            anyhow::bail!("root_dir must not be empty");
        }
        if self.history_file.as_ref().is_some_and(|p| p.as_os_str().is_empty()) {
            anyhow::bail!("history_file must not be empty when set");
        }
        if self.sites_file.as_ref().is_some_and(|p| p.as_os_str().is_empty()) {
            anyhow::bail!("sites_file must not be empty when set");
        }
        if self.docker_bin.trim().is_empty() {
            anyhow::bail!("docker_bin must not be empty");
        }
        if self.step_timeout_secs == Some(0) {
            anyhow::bail!("step_timeout_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn history_path(&self) -> PathBuf {
        self.history_file
            .clone()
            .unwrap_or_else(|| self.root_dir.join("db").join("migrations.json"))
    }

    pub fn sites_path(&self) -> PathBuf {
        self.sites_file
            .clone()
            .unwrap_or_else(|| self.root_dir.join("db").join("sites.json"))
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_secs.map(Duration::from_secs)
    }
}

//! Migration history
//!
//! Bookkeeping of which migrations have been applied on this host. The core
//! reads it to decide first-run and skip logic and writes it after each
//! migration finishes.
//!
//! Two stores are provided:
//! - `JsonHistoryStore`: a pretty-printed JSON file under the EasyEngine root,
//!   rewritten atomically (temp file + rename) on every change
//! - `InMemoryHistory`: for tests and dry-runs

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One applied migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// 14-digit timestamp version
    pub version: String,
    /// Migration name
    pub name: String,
    /// Seconds since UNIX_EPOCH when the migration was applied
    pub applied_at: u64,
}

/// Migration-history collaborator
pub trait MigrationHistory {
    /// Has any migration ever been recorded on this installation?
    fn has_any_migration_run(&self) -> Result<bool>;

    /// Is `version` currently applied?
    fn is_applied(&self, version: &str) -> Result<bool>;

    /// Applied migrations in ascending version order
    fn applied(&self) -> Result<Vec<MigrationRecord>>;

    /// Record that `version` has been applied
    fn record_migration_applied(&mut self, version: &str, name: &str) -> Result<()>;

    /// Record that `version` has been reverted
    fn record_migration_reverted(&mut self, version: &str) -> Result<()>;
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// On-disk layout of the history file
#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryFile {
    /// Set once the first migration is recorded; reverting does not clear it
    #[serde(default)]
    initialized: bool,
    #[serde(default)]
    migrations: BTreeMap<String, MigrationRecord>,
}

/// JSON file backed history
#[derive(Debug)]
pub struct JsonHistoryStore {
    path: PathBuf,
    state: HistoryFile,
}

impl JsonHistoryStore {
    /// Open the history at `path`. A missing file is an empty history.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read migration history {:?}", path))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse migration history {:?}", path))?
        } else {
            debug!("No migration history at {:?}, starting empty", path);
            HistoryFile::default()
        };
        Ok(Self { path, state })
    }

    /// Location of the history file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
        let json = serde_json::to_string_pretty(&self.state)
            .context("Failed to serialize migration history")?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("Failed to write {:?}", tmp))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace migration history {:?}", self.path))?;
        Ok(())
    }
}

impl MigrationHistory for JsonHistoryStore {
    fn has_any_migration_run(&self) -> Result<bool> {
        Ok(self.state.initialized || !self.state.migrations.is_empty())
    }

    fn is_applied(&self, version: &str) -> Result<bool> {
        Ok(self.state.migrations.contains_key(version))
    }

    fn applied(&self) -> Result<Vec<MigrationRecord>> {
        Ok(self.state.migrations.values().cloned().collect())
    }

    fn record_migration_applied(&mut self, version: &str, name: &str) -> Result<()> {
        self.state.initialized = true;
        self.state.migrations.insert(
            version.to_string(),
            MigrationRecord {
                version: version.to_string(),
                name: name.to_string(),
                applied_at: now_unix(),
            },
        );
        self.save()?;
        info!("Recorded migration {}_{} as applied", version, name);
        Ok(())
    }

    fn record_migration_reverted(&mut self, version: &str) -> Result<()> {
        if self.state.migrations.remove(version).is_none() {
            anyhow::bail!("Migration {} is not recorded as applied", version);
        }
        self.save()?;
        info!("Recorded migration {} as reverted", version);
        Ok(())
    }
}

/// In-memory history
#[derive(Debug, Default, Clone)]
pub struct InMemoryHistory {
    state: BTreeMap<String, MigrationRecord>,
    initialized: bool,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// History pre-populated with applied versions
    pub fn with_applied<'a>(versions: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let state: BTreeMap<_, _> = versions
            .into_iter()
            .map(|(version, name)| {
                (
                    version.to_string(),
                    MigrationRecord {
                        version: version.to_string(),
                        name: name.to_string(),
                        applied_at: 0,
                    },
                )
            })
            .collect();
        Self {
            initialized: !state.is_empty(),
            state,
        }
    }
}

impl MigrationHistory for InMemoryHistory {
    fn has_any_migration_run(&self) -> Result<bool> {
        Ok(self.initialized)
    }

    fn is_applied(&self, version: &str) -> Result<bool> {
        Ok(self.state.contains_key(version))
    }

    fn applied(&self) -> Result<Vec<MigrationRecord>> {
        Ok(self.state.values().cloned().collect())
    }

    fn record_migration_applied(&mut self, version: &str, name: &str) -> Result<()> {
        self.initialized = true;
        self.state.insert(
            version.to_string(),
            MigrationRecord {
                version: version.to_string(),
                name: name.to_string(),
                applied_at: now_unix(),
            },
        );
        Ok(())
    }

    fn record_migration_reverted(&mut self, version: &str) -> Result<()> {
        if self.state.remove(version).is_none() {
            anyhow::bail!("Migration {} is not recorded as applied", version);
        }
        Ok(())
    }
}

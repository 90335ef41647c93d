//! Site records
//!
//! Sites are the entities container migrations inspect and mutate. The
//! migrator only reads them; site creation and deletion belong to the rest
//! of EasyEngine.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use strum::{Display, EnumIter, EnumString};
use tracing::debug;

/// Kind of site stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SiteType {
    Html,
    Php,
    Wp,
}

impl SiteType {
    /// Returns true if the site runs a PHP-FPM container
    pub fn runs_php(self) -> bool {
        matches!(self, Self::Php | Self::Wp)
    }
}

/// A managed site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    /// Fully qualified site name, e.g. `example.com`
    pub url: String,
    pub site_type: SiteType,
    /// Site root, e.g. `/opt/easyengine/sites/example.com`
    pub fs_path: PathBuf,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub php_version: Option<String>,
    #[serde(default)]
    pub ssl: bool,
}

fn default_enabled() -> bool {
    true
}

impl Site {
    /// Compose project name: the url with dots stripped, as docker compose would derive it
    pub fn project_name(&self) -> String {
        self.url.replace('.', "")
    }

    pub fn compose_file(&self) -> PathBuf {
        self.fs_path.join("docker-compose.yml")
    }

    pub fn nginx_conf_dir(&self) -> PathBuf {
        self.fs_path.join("config").join("nginx")
    }

    pub fn php_conf_dir(&self) -> PathBuf {
        self.fs_path.join("config").join("php")
    }

    /// Docker volume name for a site-scoped volume
    pub fn volume_name(&self, volume: &str) -> String {
        format!("{}_{}", self.project_name(), volume)
    }
}

/// Entity-snapshot collaborator.
///
/// Returns the sites in a stable order; callers treat the result as an
/// immutable snapshot for the duration of one migration.
pub trait SiteSource {
    fn sites(&self) -> Result<Vec<Site>>;
}

/// Site records stored as a JSON array
#[derive(Debug, Clone)]
pub struct JsonSiteStore {
    path: PathBuf,
}

impl JsonSiteStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl SiteSource for JsonSiteStore {
    fn sites(&self) -> Result<Vec<Site>> {
        if !self.path.exists() {
            debug!("No site records at {:?}", self.path);
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read site records from {:?}", self.path))?;
        let mut sites: Vec<Site> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse site records in {:?}", self.path))?;
        sites.sort_by(|a, b| a.url.cmp(&b.url));
        Ok(sites)
    }
}

/// Fixed site list
#[derive(Debug, Clone, Default)]
pub struct StaticSites(pub Vec<Site>);

impl SiteSource for StaticSites {
    fn sites(&self) -> Result<Vec<Site>> {
        Ok(self.0.clone())
    }
}

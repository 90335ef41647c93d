//! Filesystem step helpers.
//!
//! Small do/undo building blocks for migrations that rewrite site config
//! files. Backups live next to the original as `<file>.ee-backup`.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const BACKUP_SUFFIX: &str = "ee-backup";

/// Backup location for `path`
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Copy `path` to its backup location, replacing an older backup
pub fn backup_file(path: &Path) -> Result<()> {
    let backup = backup_path(path);
    fs::copy(path, &backup)
        .with_context(|| format!("Failed to back up {:?} to {:?}", path, backup))?;
    debug!("Backed up {:?}", path);
    Ok(())
}

/// Put the backup of `path` back in place. The backup is kept.
pub fn restore_file(path: &Path) -> Result<()> {
    let backup = backup_path(path);
    fs::copy(&backup, path)
        .with_context(|| format!("Failed to restore {:?} from {:?}", path, backup))?;
    debug!("Restored {:?}", path);
    Ok(())
}

/// Delete the backup of `path` if there is one
pub fn discard_backup(path: &Path) -> Result<()> {
    remove_path(&backup_path(path))
}

/// Write `contents` to `path`, creating parent directories
pub fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("Failed to write {:?}", path))?;
    debug!("Wrote {:?}", path);
    Ok(())
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("Failed to create directory {:?}", path))
}

/// Remove a file or directory tree. Missing paths are fine.
pub fn remove_path(path: &Path) -> Result<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => {
            debug!("Removed {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {:?}", path)),
    }
}

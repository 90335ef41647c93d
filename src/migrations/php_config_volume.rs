//! Move PHP configuration of PHP and WordPress sites into a per-site volume.
//!
//! Per site:
//! 1. back up docker-compose.yml
//! 2. create the `<project>_config_php` volume, unless it already exists
//! 3. rewrite docker-compose.yml to mount it
//! 4. recreate the site's containers
//!
//! Undoing a restart puts the old compose file back before restarting, so a
//! site is never left running against a volume that rollback removes.
//!
//! There is no `down()`: once PHP config lives in the volume, operators may
//! have edited it there. The `docker-compose.yml.ee-backup` left next to each
//! compose file is the only way back, so `up()` keeps it.

use crate::docker::ContainerRuntime;
use crate::fsops;
use crate::migration::{ContainerMigration, MigrationContext};
use crate::site::Site;
use crate::step::StepAction;
use crate::templates::render_site_compose;
use anyhow::Result;
use std::sync::Arc;

pub const VERSION: &str = "20190312102847";
pub const NAME: &str = "add_php_config_volume";

/// Volume suffix for the PHP config volume
pub const PHP_CONF_VOLUME: &str = "config_php";

pub struct AddPhpConfigVolume {
    runtime: Arc<dyn ContainerRuntime>,
}

impl AddPhpConfigVolume {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    fn php_sites<'a>(&self, ctx: &'a MigrationContext) -> impl Iterator<Item = &'a Site> {
        ctx.enabled_sites().filter(|s| s.site_type.runs_php())
    }
}

impl ContainerMigration for AddPhpConfigVolume {
    fn version(&self) -> &str {
        VERSION
    }

    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Mount PHP configuration from a per-site docker volume"
    }

    fn skip_reason(&self, ctx: &MigrationContext) -> Option<String> {
        if ctx.is_first_execution {
            return Some("fresh installation; new sites are created with the volume".to_string());
        }
        if self.php_sites(ctx).next().is_none() {
            return Some("no enabled PHP or WordPress sites".to_string());
        }
        None
    }

    fn plan_up(&self, ctx: &MigrationContext) -> Result<Vec<StepAction>> {
        let mut steps = Vec::new();

        for site in self.php_sites(ctx) {
            let compose = site.compose_file();
            let volume = site.volume_name(PHP_CONF_VOLUME);

            let (backup_path, undo_path) = (compose.clone(), compose.clone());
            steps.push(StepAction::new(
                format!("backup-compose-{}", site.url),
                move || fsops::backup_file(&backup_path),
                move || fsops::restore_file(&undo_path),
            ));

            if !self.runtime.volume_exists(&volume)? {
                let (create_rt, remove_rt) = (Arc::clone(&self.runtime), Arc::clone(&self.runtime));
                let (create_name, remove_name) = (volume.clone(), volume.clone());
                steps.push(StepAction::new(
                    format!("create-php-conf-volume-{}", site.url),
                    move || create_rt.create_volume(&create_name),
                    move || remove_rt.remove_volume(&remove_name),
                ));
            }

            let rendered = render_site_compose(site, Some(&volume))?;
            let (write_path, restore_path) = (compose.clone(), compose.clone());
            steps.push(StepAction::new(
                format!("write-compose-{}", site.url),
                move || fsops::write_file(&write_path, &rendered),
                move || fsops::restore_file(&restore_path),
            ));

            let (up_rt, undo_rt) = (Arc::clone(&self.runtime), Arc::clone(&self.runtime));
            let (up_site, undo_site) = (site.clone(), site.clone());
            steps.push(StepAction::new(
                format!("restart-{}", site.url),
                move || up_rt.restart_site(&up_site),
                move || {
                    fsops::restore_file(&undo_site.compose_file())?;
                    undo_rt.restart_site(&undo_site)
                },
            ));
        }

        Ok(steps)
    }
}

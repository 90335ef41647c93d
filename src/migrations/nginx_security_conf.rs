//! Regenerate each site's nginx `main.conf` with the current security headers.
//!
//! Sites whose config already carries `NGINX_SECURITY_MARKER` are left alone.
//! The backup taken by `up()` stays next to the config; `down()` puts it
//! back.
//!
//! Undoing a reload first puts the previous config back on disk, so live
//! nginx ends on the same config as the file.

use crate::docker::ContainerRuntime;
use crate::fsops;
use crate::migration::{ContainerMigration, MigrationContext};
use crate::site::Site;
use crate::step::StepAction;
use crate::templates::{NGINX_SECURITY_MARKER, render_nginx_conf};
use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

pub const VERSION: &str = "20200114093000";
pub const NAME: &str = "update_nginx_security_conf";

pub struct UpdateNginxSecurityConf {
    runtime: Arc<dyn ContainerRuntime>,
}

/// Path of the site's main nginx config
pub fn conf_path(site: &Site) -> PathBuf {
    site.nginx_conf_dir().join("conf.d").join("main.conf")
}

impl UpdateNginxSecurityConf {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Existing config without the current marker
    fn needs_update(site: &Site) -> Result<bool> {
        let path = conf_path(site);
        if !path.exists() {
            return Ok(false);
        }
        let content =
            fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
        Ok(!content.contains(NGINX_SECURITY_MARKER))
    }

    /// Reload nginx; undo runs `revert` on the config and reloads again
    fn reload_step<F>(&self, site: &Site, revert: F) -> StepAction
    where
        F: Fn() -> Result<()> + Send + 'static,
    {
        let (up_rt, undo_rt) = (Arc::clone(&self.runtime), Arc::clone(&self.runtime));
        let (up_site, undo_site) = (site.clone(), site.clone());
        StepAction::new(
            format!("reload-nginx-{}", site.url),
            move || up_rt.reload_nginx(&up_site),
            move || {
                revert()?;
                undo_rt.reload_nginx(&undo_site)
            },
        )
    }
}

impl ContainerMigration for UpdateNginxSecurityConf {
    fn version(&self) -> &str {
        VERSION
    }

    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Add security headers to site nginx configuration"
    }

    fn skip_reason(&self, ctx: &MigrationContext) -> Option<String> {
        if ctx.enabled_sites().next().is_none() {
            return Some("no enabled sites".to_string());
        }
        None
    }

    fn plan_up(&self, ctx: &MigrationContext) -> Result<Vec<StepAction>> {
        let mut steps = Vec::new();

        for site in ctx.enabled_sites() {
            if !Self::needs_update(site)? {
                continue;
            }
            let conf = conf_path(site);

            let (backup, discard) = (conf.clone(), conf.clone());
            steps.push(StepAction::new(
                format!("backup-conf-{}", site.url),
                move || fsops::backup_file(&backup),
                move || fsops::discard_backup(&discard),
            ));

            let rendered = render_nginx_conf(site)?;
            let (write, restore) = (conf.clone(), conf.clone());
            steps.push(StepAction::new(
                format!("write-new-conf-{}", site.url),
                move || fsops::write_file(&write, &rendered),
                move || fsops::restore_file(&restore),
            ));

            steps.push(self.reload_step(site, move || fsops::restore_file(&conf)));
        }

        Ok(steps)
    }

    fn is_reversible(&self) -> bool {
        true
    }

    fn plan_down(&self, ctx: &MigrationContext) -> Result<Vec<StepAction>> {
        let mut steps = Vec::new();

        for site in ctx.enabled_sites() {
            let conf = conf_path(site);
            if !fsops::backup_path(&conf).exists() {
                continue;
            }

            let rendered = render_nginx_conf(site)?;
            let (restore, rewrite) = (conf.clone(), conf.clone());
            let rewrite_content = rendered.clone();
            steps.push(StepAction::new(
                format!("restore-conf-{}", site.url),
                move || fsops::restore_file(&restore),
                move || fsops::write_file(&rewrite, &rewrite_content),
            ));

            steps.push(self.reload_step(site, move || fsops::write_file(&conf, &rendered)));
        }

        Ok(steps)
    }
}

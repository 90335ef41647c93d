//! Container runtime collaborator.
//!
//! Migrations only need a handful of container operations. They reach them
//! through `ContainerRuntime` so plans can be executed against a fake runtime
//! in tests. `DockerRuntime` implements the trait with typed `CommandArgs`
//! structs run through `run_command_safe`.

use crate::command::{CommandArgs, run_command_safe};
use crate::site::Site;
use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

/// Container operations used by migration steps
pub trait ContainerRuntime: Send + Sync {
    fn volume_exists(&self, name: &str) -> Result<bool>;

    fn create_volume(&self, name: &str) -> Result<()>;

    fn remove_volume(&self, name: &str) -> Result<()>;

    /// Recreate a site's containers from its compose file
    fn restart_site(&self, site: &Site) -> Result<()>;

    /// Ask the site's nginx container to reload its configuration
    fn reload_nginx(&self, site: &Site) -> Result<()>;
}

// ============================================================================
// docker volume
// ============================================================================

/// `docker volume <action> <name>`
#[derive(Debug, Clone)]
pub struct VolumeArgs {
    pub docker_bin: String,
    pub action: VolumeAction,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeAction {
    Inspect,
    Create,
    Remove,
}

impl VolumeAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inspect => "inspect",
            Self::Create => "create",
            Self::Remove => "rm",
        }
    }
}

impl CommandArgs for VolumeArgs {
    fn program(&self) -> &str {
        &self.docker_bin
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "volume".to_string(),
            self.action.as_str().to_string(),
            self.name.clone(),
        ]
    }
}

// ============================================================================
// docker compose
// ============================================================================

/// `docker compose -f <file> -p <project> <subcommand...>`
#[derive(Debug, Clone)]
pub struct ComposeArgs {
    pub docker_bin: String,
    pub compose_file: PathBuf,
    pub project: String,
    pub subcommand: Vec<String>,
}

impl ComposeArgs {
    fn for_site(docker_bin: &str, site: &Site, subcommand: &[&str]) -> Self {
        Self {
            docker_bin: docker_bin.to_string(),
            compose_file: site.compose_file(),
            project: site.project_name(),
            subcommand: subcommand.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl CommandArgs for ComposeArgs {
    fn program(&self) -> &str {
        &self.docker_bin
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "compose".to_string(),
            "-f".to_string(),
            self.compose_file.display().to_string(),
            "-p".to_string(),
            self.project.clone(),
        ];
        args.extend(self.subcommand.iter().cloned());
        args
    }
}

/// `ContainerRuntime` backed by the docker CLI
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker_bin: String,
    timeout: Option<Duration>,
}

impl DockerRuntime {
    /// `timeout` bounds every docker call; `None` waits indefinitely
    pub fn new(docker_bin: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            timeout,
        }
    }

    fn volume(&self, action: VolumeAction, name: &str) -> VolumeArgs {
        VolumeArgs {
            docker_bin: self.docker_bin.clone(),
            action,
            name: name.to_string(),
        }
    }
}

impl ContainerRuntime for DockerRuntime {
    fn volume_exists(&self, name: &str) -> Result<bool> {
        let out = run_command_safe(&self.volume(VolumeAction::Inspect, name), self.timeout)?;
        Ok(out.success)
    }

    fn create_volume(&self, name: &str) -> Result<()> {
        run_command_safe(&self.volume(VolumeAction::Create, name), self.timeout)?
            .ensure_success(&format!("docker volume create {}", name))
    }

    fn remove_volume(&self, name: &str) -> Result<()> {
        run_command_safe(&self.volume(VolumeAction::Remove, name), self.timeout)?
            .ensure_success(&format!("docker volume rm {}", name))
    }

    fn restart_site(&self, site: &Site) -> Result<()> {
        let up = ComposeArgs::for_site(&self.docker_bin, site, &["up", "-d", "--force-recreate"]);
        run_command_safe(&up, self.timeout)?
            .ensure_success(&format!("docker compose up for {}", site.url))
    }

    fn reload_nginx(&self, site: &Site) -> Result<()> {
        let reload = ComposeArgs::for_site(
            &self.docker_bin,
            site,
            &["exec", "-T", "nginx", "nginx", "-s", "reload"],
        );
        run_command_safe(&reload, self.timeout)?
            .ensure_success(&format!("nginx reload for {}", site.url))
    }
}

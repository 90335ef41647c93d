use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// ee-migrate - EasyEngine container migrations
#[derive(Parser)]
#[command(name = "ee-migrate")]
#[command(about = "Apply and revert EasyEngine container migrations with automatic rollback")]
#[command(version)]
pub struct Cli {
    /// Path to a JSON configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Dry-run mode: print the steps `migrate` or `revert` would run.
    ///
    /// Nothing is changed and no history is recorded. Building a plan may
    /// still query docker, e.g. to check whether a volume exists.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply all pending migrations in version order
    Migrate,
    /// Revert one applied migration
    Revert {
        /// 14-digit migration version
        version: String,
    },
    /// List migrations and whether they are applied
    Status,
    /// Show the steps a migration would run, without running them
    Plan {
        /// Version to plan; all pending migrations when omitted
        version: Option<String>,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

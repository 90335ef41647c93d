//! ee-migrate - Main entry point
//!
//! Applies and reverts EasyEngine container migrations from the command line.

use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use ee_migrate::cli::{Cli, Commands};
use ee_migrate::config::MigrateConfig;
use ee_migrate::docker::DockerRuntime;
use ee_migrate::error::{EeError, Result};
use ee_migrate::history::JsonHistoryStore;
use ee_migrate::migration::MigrationOutcome;
use ee_migrate::migrations;
use ee_migrate::process_guard::{self, InterruptFlag, ProcessGuard};
use ee_migrate::runner::{MigrationRunner, MigrationStatus, PlannedMigration};
use ee_migrate::site::JsonSiteStore;

/// Initialize the logger; `RUST_LOG` overrides the default level
fn init_logger(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse_args();
    init_logger(cli.verbose);
    info!("ee-migrate starting up");

    let interrupt = InterruptFlag::new();
    if let Err(e) = process_guard::init_signal_handlers(interrupt.clone()) {
        warn!("Failed to initialize signal handlers: {}", e);
        // Continue anyway - children are still cleaned up via the guard
    }
    debug!("Signal handlers initialized");

    let guard = ProcessGuard::new();

    let code = match run(&cli, &interrupt) {
        Ok(()) => 0,
        Err(e) => {
            error!("{}", e);
            eprintln!("✗ {}", e);
            e.exit_code()
        }
    };

    // process::exit skips destructors
    drop(guard);
    std::process::exit(code);
}

fn load_config(cli: &Cli) -> Result<MigrateConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            MigrateConfig::load_from_file(path).map_err(|e| EeError::config(format!("{:#}", e)))?
        }
        None => MigrateConfig::default(),
    };
    config.apply_env_overrides();
    config
        .validate()
        .map_err(|e| EeError::config(format!("{:#}", e)))?;
    debug!("Configuration: {:?}", config);
    Ok(config)
}

fn run(cli: &Cli, interrupt: &InterruptFlag) -> Result<()> {
    let config = load_config(cli)?;

    let runtime = Arc::new(DockerRuntime::new(
        config.docker_bin.clone(),
        config.step_timeout(),
    ));
    let history = JsonHistoryStore::open(config.history_path())
        .map_err(|e| EeError::store(format!("{:#}", e)))?;
    let sites = JsonSiteStore::new(config.sites_path());

    let mut runner = MigrationRunner::new(history, sites, config.root_dir.clone())
        .with_migrations(migrations::builtin(runtime))?
        .with_interrupt(interrupt.clone());

    match &cli.command {
        Commands::Migrate if cli.dry_run => print_plans(&runner.plan(None)?),
        Commands::Migrate => {
            let summary = runner.run_pending()?;
            if summary.is_empty() {
                println!("✓ No pending migrations");
            }
            for id in &summary.applied {
                println!("✓ Applied {}", id);
            }
            for (id, reason) in &summary.skipped {
                println!("- Skipped {}: {}", id, reason);
            }
        }
        Commands::Revert { version } if cli.dry_run => {
            print_plans(&[runner.plan_revert(version)?])
        }
        Commands::Revert { version } => match runner.revert(version)? {
            MigrationOutcome::Skipped(reason) => {
                println!("- Reverted {} without changes: {}", version, reason)
            }
            _ => println!("✓ Reverted {}", version),
        },
        Commands::Status => print_status(&runner.status()?),
        Commands::Plan { version } => print_plans(&runner.plan(version.as_deref())?),
    }

    // A signal that arrived after the last step still ends the run as interrupted
    match interrupt.signal() {
        Some(sig) => Err(EeError::Interrupted(sig)),
        None => Ok(()),
    }
}

fn print_status(status: &[MigrationStatus]) {
    if status.is_empty() {
        println!("No migrations registered");
        return;
    }
    for entry in status {
        let mark = if entry.applied { "applied" } else { "pending" };
        println!("{:<8} {}  {}", mark, entry.id, entry.description);
    }
}

fn print_plans(plans: &[PlannedMigration]) {
    if plans.is_empty() {
        println!("✓ No pending migrations");
        return;
    }
    for plan in plans {
        println!("{}", plan.id);
        if let Some(reason) = &plan.skip {
            println!("  skipped: {}", reason);
            continue;
        }
        if plan.steps.is_empty() {
            println!("  (no steps)");
        }
        for (i, step) in plan.steps.iter().enumerate() {
            let note = if step.reversible { "" } else { " (irreversible)" };
            println!("  {}. {}{}", i + 1, step.name, note);
        }
    }
}

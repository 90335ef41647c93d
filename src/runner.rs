//! Migration runner
//!
//! Holds the registered migrations in version order and drives them against
//! a history store and a site source. Each migration gets its own
//! `PreparedMigration` and therefore its own step processor.
//!
//! A run stops at the first failing migration. Migrations before it stay
//! applied; the failing one has been rolled back by its processor.

use crate::history::MigrationHistory;
use crate::migration::{
    ContainerMigration, MigrationError, MigrationId, MigrationOutcome, PreparedMigration,
    validate_version,
};
use crate::process_guard::InterruptFlag;
use crate::site::SiteSource;
use crate::step::StepAction;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Applied/pending state of one registered migration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub id: MigrationId,
    pub description: String,
    pub applied: bool,
    /// Unix seconds, when recorded
    pub applied_at: Option<u64>,
}

/// A step as it would run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub name: String,
    pub reversible: bool,
}

/// Forward plan of one migration, built without executing anything
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMigration {
    pub id: MigrationId,
    /// Set when `up()` would be a no-op; `steps` is then empty
    pub skip: Option<String>,
    pub steps: Vec<PlannedStep>,
}

/// What `run_pending()` did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub applied: Vec<MigrationId>,
    pub skipped: Vec<(MigrationId, String)>,
}

impl RunSummary {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty() && self.skipped.is_empty()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} applied, {} skipped",
            self.applied.len(),
            self.skipped.len()
        )
    }
}

fn history_err(e: anyhow::Error) -> MigrationError {
    MigrationError::History(format!("{:#}", e))
}

fn planned_steps(steps: &[StepAction]) -> Vec<PlannedStep> {
    steps
        .iter()
        .map(|s| PlannedStep {
            name: s.name().to_string(),
            reversible: s.is_reversible(),
        })
        .collect()
}

pub struct MigrationRunner<H, S> {
    migrations: Vec<Box<dyn ContainerMigration>>,
    history: H,
    sites: S,
    root_dir: PathBuf,
    interrupt: Option<InterruptFlag>,
}

impl<H: MigrationHistory, S: SiteSource> MigrationRunner<H, S> {
    pub fn new(history: H, sites: S, root_dir: impl Into<PathBuf>) -> Self {
        Self {
            migrations: Vec::new(),
            history,
            sites,
            root_dir: root_dir.into(),
            interrupt: None,
        }
    }

    /// Register a migration, keeping version order.
    ///
    /// Rejects malformed and duplicate versions.
    pub fn register(
        &mut self,
        migration: Box<dyn ContainerMigration>,
    ) -> Result<(), MigrationError> {
        let version = migration.version().to_string();
        validate_version(&version)?;

        match self
            .migrations
            .binary_search_by(|m| m.version().cmp(version.as_str()))
        {
            Ok(_) => Err(MigrationError::DuplicateVersion { version }),
            Err(pos) => {
                debug!("Registered migration {}", migration.id());
                self.migrations.insert(pos, migration);
                Ok(())
            }
        }
    }

    pub fn with_migrations(
        mut self,
        migrations: impl IntoIterator<Item = Box<dyn ContainerMigration>>,
    ) -> Result<Self, MigrationError> {
        for migration in migrations {
            self.register(migration)?;
        }
        Ok(self)
    }

    /// Check `flag` between migrations and hand it to each processor
    pub fn with_interrupt(mut self, flag: InterruptFlag) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn history(&self) -> &H {
        &self.history
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Registered ids in version order
    pub fn ids(&self) -> Vec<MigrationId> {
        self.migrations.iter().map(|m| m.id()).collect()
    }

    pub fn status(&self) -> Result<Vec<MigrationStatus>, MigrationError> {
        let applied = self.history.applied().map_err(history_err)?;

        Ok(self
            .migrations
            .iter()
            .map(|m| {
                let record = applied.iter().find(|r| r.version == m.version());
                MigrationStatus {
                    id: m.id(),
                    description: m.description().to_string(),
                    applied: record.is_some(),
                    applied_at: record.map(|r| r.applied_at),
                }
            })
            .collect())
    }

    /// Ids not yet recorded as applied, in version order
    pub fn pending(&self) -> Result<Vec<MigrationId>, MigrationError> {
        let mut pending = Vec::new();
        for migration in &self.migrations {
            if !self.history.is_applied(migration.version()).map_err(history_err)? {
                pending.push(migration.id());
            }
        }
        Ok(pending)
    }

    /// Apply every pending migration in version order.
    ///
    /// Skipped migrations are recorded as applied. Stops at the first
    /// failure and returns it; earlier migrations stay recorded.
    pub fn run_pending(&mut self) -> Result<RunSummary, MigrationError> {
        // Decided once: recording the first migration must not change it for the rest
        let is_first_execution = !self.history.has_any_migration_run().map_err(history_err)?;
        if is_first_execution {
            info!("No migration has run before; treating this as a fresh installation");
        }

        let mut summary = RunSummary::default();

        for migration in &self.migrations {
            let id = migration.id();
            if self.history.is_applied(&id.version).map_err(history_err)? {
                continue;
            }

            if let Some(signal) = self.interrupt.as_ref().and_then(InterruptFlag::signal) {
                warn!("Interrupted by signal {} before migration {}", signal, id);
                return Err(MigrationError::Interrupted {
                    id,
                    signal,
                    summary: format!("stopped before start; {}", summary),
                    rollback: None,
                });
            }

            let mut prepared = PreparedMigration::prepare_with_first_run(
                migration.as_ref(),
                &self.history,
                &self.sites,
                &self.root_dir,
                is_first_execution,
            )?;
            if let Some(flag) = &self.interrupt {
                prepared = prepared.with_interrupt(flag.clone());
            }

            let outcome = prepared.up()?;
            self.history
                .record_migration_applied(&id.version, &id.name)
                .map_err(history_err)?;

            match outcome {
                MigrationOutcome::Skipped(reason) => summary.skipped.push((id, reason)),
                _ => summary.applied.push(id),
            }
        }

        info!("Migration run finished: {}", summary);
        Ok(summary)
    }

    /// Revert one applied migration and remove its history record
    pub fn revert(&mut self, version: &str) -> Result<MigrationOutcome, MigrationError> {
        let migration = self.find(version)?;
        let id = migration.id();

        if !self.history.is_applied(version).map_err(history_err)? {
            return Err(MigrationError::NotApplied { id });
        }

        let outcome = {
            let mut prepared =
                PreparedMigration::prepare(migration, &self.history, &self.sites, &self.root_dir)?;
            if let Some(flag) = &self.interrupt {
                prepared = prepared.with_interrupt(flag.clone());
            }
            prepared.down()?
        };
        self.history
            .record_migration_reverted(version)
            .map_err(history_err)?;
        Ok(outcome)
    }

    /// Forward plans without side effects.
    ///
    /// `None` plans every pending migration; `Some(version)` plans that one,
    /// applied or not.
    pub fn plan(&self, version: Option<&str>) -> Result<Vec<PlannedMigration>, MigrationError> {
        let targets: Vec<&dyn ContainerMigration> = match version {
            Some(v) => vec![self.find(v)?],
            None => {
                let mut pending = Vec::new();
                for m in &self.migrations {
                    if !self.history.is_applied(m.version()).map_err(history_err)? {
                        pending.push(m.as_ref());
                    }
                }
                pending
            }
        };

        let is_first_execution = !self.history.has_any_migration_run().map_err(history_err)?;

        targets
            .into_iter()
            .map(|migration| {
                let prepared = PreparedMigration::prepare_with_first_run(
                    migration,
                    &self.history,
                    &self.sites,
                    &self.root_dir,
                    is_first_execution,
                )?;

                let skip = prepared.up_skip_reason();
                let steps = match skip {
                    Some(_) => Vec::new(),
                    None => planned_steps(&prepared.plan_up()?),
                };

                Ok(PlannedMigration {
                    id: prepared.id(),
                    skip,
                    steps,
                })
            })
            .collect()
    }

    /// Inverse plan of one migration, built without executing it
    pub fn plan_revert(&self, version: &str) -> Result<PlannedMigration, MigrationError> {
        let migration = self.find(version)?;
        if !migration.is_reversible() {
            return Err(MigrationError::DownUnsupported { id: migration.id() });
        }

        let prepared =
            PreparedMigration::prepare(migration, &self.history, &self.sites, &self.root_dir)?;
        let skip = prepared.down_skip_reason();
        let steps = match skip {
            Some(_) => Vec::new(),
            None => planned_steps(&prepared.plan_down()?),
        };

        Ok(PlannedMigration {
            id: prepared.id(),
            skip,
            steps,
        })
    }

    fn find(&self, version: &str) -> Result<&dyn ContainerMigration, MigrationError> {
        self.migrations
            .iter()
            .find(|m| m.version() == version)
            .map(|m| m.as_ref())
            .ok_or_else(|| MigrationError::UnknownVersion {
                version: version.to_string(),
            })
    }
}

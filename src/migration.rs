//! Container migration base
//!
//! A container migration is a versioned change to site configuration or
//! container infrastructure with a forward (`up`) and, optionally, an
//! inverse (`down`) procedure.
//!
//! Variants implement `ContainerMigration`: a skip predicate and pure plan
//! builders that turn the site snapshot into an ordered list of
//! `StepAction`s. `PreparedMigration` is the shared machinery around them.
//! It snapshots history and sites once, evaluates skip conditions, and runs
//! the plan on a fresh `RevertableStepProcessor` per invocation.
//!
//! # State Flow
//!
//! ```text
//! prepare()
//!     ↓
//! SkipEvaluated
//!     ├──→ Skipped
//!     └──→ Running
//!             ├──→ Completed
//!             └──→ FailedRolledBack
//! ```

use crate::history::MigrationHistory;
use crate::process_guard::InterruptFlag;
use crate::processor::{ProcessorError, RevertableStepProcessor, RollbackReport, StepFailure};
use crate::site::{Site, SiteSource};
use crate::step::StepAction;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

/// Length of the timestamp prefix of a migration version
pub const VERSION_LEN: usize = 14;

/// Migration errors
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("invalid migration version '{version}': expected a 14-digit timestamp")]
    InvalidVersion { version: String },

    #[error("migration version {version} is registered twice")]
    DuplicateVersion { version: String },

    #[error("no migration with version {version}")]
    UnknownVersion { version: String },

    #[error("migration {id} is not applied")]
    NotApplied { id: MigrationId },

    /// The migration declares that it cannot be reverted
    #[error("migration {id} does not support down()")]
    DownUnsupported { id: MigrationId },

    /// Duplicate step names; raised before any step runs
    #[error("migration {id} built an invalid plan: {source}")]
    InvalidPlan {
        id: MigrationId,
        #[source]
        source: ProcessorError,
    },

    #[error("migration {id} could not build its plan: {reason}")]
    PlanFailed { id: MigrationId, reason: String },

    #[error("migration {id} failed and was rolled back: {summary}")]
    RolledBack {
        id: MigrationId,
        summary: String,
        rollback: Option<RollbackReport>,
    },

    /// `rollback` is `None` when the signal arrived before the plan started
    #[error("migration {id} interrupted by signal {signal}: {summary}")]
    Interrupted {
        id: MigrationId,
        signal: i32,
        summary: String,
        rollback: Option<RollbackReport>,
    },

    #[error("migration history: {0}")]
    History(String),

    #[error("site records: {0}")]
    Sites(String),
}

impl MigrationError {
    /// Signal that interrupted the run, if that is what stopped it
    pub fn interrupted_by(&self) -> Option<i32> {
        match self {
            Self::Interrupted { signal, .. } => Some(*signal),
            _ => None,
        }
    }
}

/// Version + name of a migration, displayed as `<version>_<name>`.
///
/// Ordering is by version first; versions are fixed-width so lexicographic
/// order is chronological.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MigrationId {
    pub version: String,
    pub name: String,
}

impl MigrationId {
    /// Validate and build an id
    pub fn new(version: &str, name: &str) -> Result<Self, MigrationError> {
        validate_version(version)?;
        Ok(Self {
            version: version.to_string(),
            name: name.to_string(),
        })
    }

    /// Parse `<version>_<name>`
    pub fn parse(s: &str) -> Result<Self, MigrationError> {
        match s.split_once('_') {
            Some((version, name)) if !name.is_empty() => Self::new(version, name),
            _ => Err(MigrationError::InvalidVersion {
                version: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.version, self.name)
    }
}

/// Check that `version` is a 14-digit timestamp
pub fn validate_version(version: &str) -> Result<(), MigrationError> {
    if version.len() == VERSION_LEN && version.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(MigrationError::InvalidVersion {
            version: version.to_string(),
        })
    }
}

/// Read-only inputs a migration plans against
#[derive(Debug, Clone)]
pub struct MigrationContext {
    /// No migration has ever run on this installation
    pub is_first_execution: bool,
    /// Site snapshot in stable order, taken once per migration
    pub sites: Vec<Site>,
    /// EasyEngine root, e.g. `/opt/easyengine`
    pub root_dir: PathBuf,
}

impl MigrationContext {
    pub fn enabled_sites(&self) -> impl Iterator<Item = &Site> {
        self.sites.iter().filter(|s| s.enabled)
    }
}

/// A migration variant.
///
/// Plan builders must not mutate anything. They may read (for example to
/// check whether a volume already exists) and return the steps that will
/// perform the change.
pub trait ContainerMigration {
    /// 14-digit timestamp, e.g. `20190312102847`
    fn version(&self) -> &str;

    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn id(&self) -> MigrationId {
        MigrationId {
            version: self.version().to_string(),
            name: self.name().to_string(),
        }
    }

    /// Why this migration has nothing to do, if it hasn't
    fn skip_reason(&self, _ctx: &MigrationContext) -> Option<String> {
        None
    }

    /// Steps for `up()`
    fn plan_up(&self, ctx: &MigrationContext) -> anyhow::Result<Vec<StepAction>>;

    /// Whether `down()` is supported. Irreversible migrations say so here.
    fn is_reversible(&self) -> bool {
        false
    }

    /// Steps for `down()`; only called when `is_reversible()`
    fn plan_down(&self, _ctx: &MigrationContext) -> anyhow::Result<Vec<StepAction>> {
        anyhow::bail!("{} has no down() plan", self.id())
    }
}

/// Lifecycle of a prepared migration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    SkipEvaluated,
    Skipped,
    Running,
    Completed,
    FailedRolledBack,
}

/// Successful outcome of `up()` / `down()`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Forward plan ran to completion
    Applied { steps: usize },
    /// Inverse plan ran to completion
    Reverted { steps: usize },
    /// Nothing to do; no step callable ran
    Skipped(String),
}

/// Direction of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

/// A migration bound to a snapshot of history and sites.
pub struct PreparedMigration<'m> {
    migration: &'m dyn ContainerMigration,
    context: MigrationContext,
    applied: bool,
    skip_reason: Option<String>,
    state: MigrationState,
    interrupt: Option<InterruptFlag>,
}

impl<'m> PreparedMigration<'m> {
    /// Snapshot history and sites and evaluate skip conditions.
    ///
    /// Only reads from the collaborators.
    pub fn prepare(
        migration: &'m dyn ContainerMigration,
        history: &dyn MigrationHistory,
        sites: &dyn SiteSource,
        root_dir: &Path,
    ) -> Result<Self, MigrationError> {
        let is_first_execution = !history
            .has_any_migration_run()
            .map_err(|e| MigrationError::History(format!("{:#}", e)))?;
        Self::prepare_with_first_run(migration, history, sites, root_dir, is_first_execution)
    }

    /// Like `prepare`, with `is_first_execution` decided by the caller.
    ///
    /// A runner decides it once per run so that recording the first
    /// migration does not change the answer for the ones after it.
    pub fn prepare_with_first_run(
        migration: &'m dyn ContainerMigration,
        history: &dyn MigrationHistory,
        sites: &dyn SiteSource,
        root_dir: &Path,
        is_first_execution: bool,
    ) -> Result<Self, MigrationError> {
        let id = migration.id();
        validate_version(&id.version)?;

        let applied = history
            .is_applied(&id.version)
            .map_err(|e| MigrationError::History(format!("{:#}", e)))?;
        let sites = sites
            .sites()
            .map_err(|e| MigrationError::Sites(format!("{:#}", e)))?;

        let context = MigrationContext {
            is_first_execution,
            sites,
            root_dir: root_dir.to_path_buf(),
        };
        let skip_reason = migration.skip_reason(&context);

        Ok(Self {
            migration,
            context,
            applied,
            skip_reason,
            state: MigrationState::SkipEvaluated,
            interrupt: None,
        })
    }

    /// Stop and roll back when `flag` is raised
    pub fn with_interrupt(mut self, flag: InterruptFlag) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn id(&self) -> MigrationId {
        self.migration.id()
    }

    pub fn state(&self) -> MigrationState {
        self.state
    }

    pub fn context(&self) -> &MigrationContext {
        &self.context
    }

    pub fn is_applied(&self) -> bool {
        self.applied
    }

    /// Reason `up()` would be a no-op
    pub fn up_skip_reason(&self) -> Option<String> {
        if self.applied {
            Some("already applied".to_string())
        } else {
            self.skip_reason.clone()
        }
    }

    /// Reason `down()` would be a no-op
    pub fn down_skip_reason(&self) -> Option<String> {
        if !self.applied {
            Some("not applied".to_string())
        } else {
            self.skip_reason.clone()
        }
    }

    /// Build the forward plan without running it
    pub fn plan_up(&self) -> Result<Vec<StepAction>, MigrationError> {
        self.migration
            .plan_up(&self.context)
            .map_err(|e| MigrationError::PlanFailed {
                id: self.id(),
                reason: format!("{:#}", e),
            })
    }

    /// Build the inverse plan without running it
    pub fn plan_down(&self) -> Result<Vec<StepAction>, MigrationError> {
        if !self.migration.is_reversible() {
            return Err(MigrationError::DownUnsupported { id: self.id() });
        }
        self.migration
            .plan_down(&self.context)
            .map_err(|e| MigrationError::PlanFailed {
                id: self.id(),
                reason: format!("{:#}", e),
            })
    }

    /// Apply the migration.
    ///
    /// # Errors
    ///
    /// - `PlanFailed` / `InvalidPlan` before any step ran
    /// - `RolledBack` when a step failed and completed steps were undone
    /// - `Interrupted` when an operator signal stopped the run
    pub fn up(&mut self) -> Result<MigrationOutcome, MigrationError> {
        if let Some(reason) = self.up_skip_reason() {
            info!("Skipping migration {}: {}", self.id(), reason);
            self.state = MigrationState::Skipped;
            return Ok(MigrationOutcome::Skipped(reason));
        }

        info!("Running migration {} up", self.id());
        self.state = MigrationState::Running;
        let steps = self.plan_up().inspect_err(|_| self.state = MigrationState::FailedRolledBack)?;
        self.run(Direction::Up, steps)
    }

    /// Revert the migration.
    ///
    /// Irreversible migrations fail with `DownUnsupported`.
    pub fn down(&mut self) -> Result<MigrationOutcome, MigrationError> {
        if !self.migration.is_reversible() {
            warn!("Migration {} cannot be reverted", self.id());
            return Err(MigrationError::DownUnsupported { id: self.id() });
        }

        if let Some(reason) = self.down_skip_reason() {
            info!("Skipping migration {} down: {}", self.id(), reason);
            self.state = MigrationState::Skipped;
            return Ok(MigrationOutcome::Skipped(reason));
        }

        info!("Running migration {} down", self.id());
        self.state = MigrationState::Running;
        let steps = self
            .plan_down()
            .inspect_err(|_| self.state = MigrationState::FailedRolledBack)?;
        self.run(Direction::Down, steps)
    }

    fn run(
        &mut self,
        direction: Direction,
        steps: Vec<StepAction>,
    ) -> Result<MigrationOutcome, MigrationError> {
        let id = self.id();

        // Fresh processor per invocation, dropped when this returns
        let mut processor = RevertableStepProcessor::new();
        if let Some(flag) = &self.interrupt {
            processor = processor.with_interrupt(flag.clone());
        }
        if let Err(source) = processor.add_steps(steps) {
            error!("Migration {} has an invalid plan: {}", id, source);
            self.state = MigrationState::FailedRolledBack;
            return Err(MigrationError::InvalidPlan { id, source });
        }

        let report = processor.execute();
        if report.succeeded() {
            let steps = report.completed_steps().len();
            info!("Migration {} completed ({} step(s))", id, steps);
            self.state = MigrationState::Completed;
            return Ok(match direction {
                Direction::Up => MigrationOutcome::Applied { steps },
                Direction::Down => MigrationOutcome::Reverted { steps },
            });
        }

        self.state = MigrationState::FailedRolledBack;
        let summary = report.to_string();
        error!("Migration {} failed: {}", id, summary);

        match report.failure() {
            Some(StepFailure::Interrupted { signal, .. }) => Err(MigrationError::Interrupted {
                id,
                signal: *signal,
                summary,
                rollback: report.rollback().cloned(),
            }),
            _ => Err(MigrationError::RolledBack {
                id,
                summary,
                rollback: report.rollback().cloned(),
            }),
        }
    }
}

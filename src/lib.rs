//! ee-migrate Library
//!
//! Reversible container migrations for EasyEngine hosts. A migration turns
//! the current site records into an ordered list of do/undo steps; the step
//! processor runs them and, when one fails, undoes the completed ones in
//! reverse order.

pub mod cli;
pub mod command;
pub mod config;
pub mod docker;
pub mod error;
pub mod fsops;
pub mod history;
pub mod migration;
pub mod migrations;
pub mod process_guard;
pub mod processor;
pub mod runner;
pub mod site;
pub mod step;
pub mod templates;

// Re-export main types for convenience
pub use command::{CommandArgs, CommandOutput, run_command_safe};
pub use config::MigrateConfig;
pub use docker::{ContainerRuntime, DockerRuntime};
pub use error::EeError;
pub use history::{InMemoryHistory, JsonHistoryStore, MigrationHistory, MigrationRecord};
pub use migration::{
    ContainerMigration, MigrationContext, MigrationError, MigrationId, MigrationOutcome,
    MigrationState, PreparedMigration,
};
pub use process_guard::{ChildRegistry, CommandProcessGroup, InterruptFlag, ProcessGuard};
pub use processor::{
    ExecutionReport, ProcessorError, RevertableStepProcessor, RollbackOutcome, RollbackReport,
    StepFailure,
};
pub use runner::{MigrationRunner, MigrationStatus, PlannedMigration, PlannedStep, RunSummary};
pub use site::{JsonSiteStore, Site, SiteSource, SiteType, StaticSites};
pub use step::{StepAction, UndoOutcome};

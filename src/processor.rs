//! Revertable step processor
//!
//! Runs an ordered list of `StepAction`s and, when one fails, undoes the
//! steps that already completed in strict reverse order.
//!
//! # Guarantees
//!
//! - **Ordering**: steps run in insertion order, one at a time
//! - **Prefix tracking**: the executed set is always a prefix of the step list
//! - **Stop on failure**: no step after the failing one is attempted
//! - **Best-effort rollback**: an undo that fails is recorded and the walk
//!   continues with the earlier steps
//! - **No retries**: a failed step is never re-run by the processor
//!
//! A failed run leaves the host in whatever state the successful undos
//! produced. That is not necessarily the exact pre-run state if a step had no
//! inverse or an undo failed; the `RollbackReport` says which.
//!
//! ```text
//! add_step* → execute() ─ all Ok ──────────────→ succeeded
//!                 └─ step k fails / interrupt → undo k-1 … 1 → failed
//! ```

use crate::process_guard::InterruptFlag;
use crate::step::{StepAction, UndoOutcome};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;
use tracing::{error, info, warn};

/// Plan-time errors raised by the processor
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    /// Two steps with the same name were added to one processor
    #[error("step '{name}' is already registered in this processor")]
    DuplicateStep { name: String },

    /// Steps were added or `execute()` called after the plan already ran
    #[error("processor has already executed its plan; build a new one")]
    AlreadyExecuted,
}

/// What rollback did for a single step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// The inverse action ran successfully
    Undone,
    /// The step completed but registered no inverse
    SkippedNoInverse,
    /// The step never completed its forward action, so there is nothing to undo
    NeverRan,
    /// The inverse action failed; manual remediation may be needed
    UndoFailed(String),
}

impl fmt::Display for RollbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undone => write!(f, "undone"),
            Self::SkippedNoInverse => write!(f, "skipped (no inverse)"),
            Self::NeverRan => write!(f, "never ran"),
            Self::UndoFailed(reason) => write!(f, "undo failed: {}", reason),
        }
    }
}

/// One line of a rollback report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackRecord {
    pub step: String,
    pub outcome: RollbackOutcome,
}

/// Result of a rollback walk.
///
/// Records for completed steps come first, in the order they were undone
/// (newest first). When the rollback follows a failed forward pass, records
/// for the failing step and every step after it follow as `NeverRan`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    pub records: Vec<RollbackRecord>,
}

impl RollbackReport {
    /// Names of steps whose inverse ran successfully, in undo order
    pub fn undone(&self) -> Vec<&str> {
        self.with_outcome(|o| matches!(o, RollbackOutcome::Undone))
    }

    /// Names of completed steps that had no inverse
    pub fn skipped(&self) -> Vec<&str> {
        self.with_outcome(|o| matches!(o, RollbackOutcome::SkippedNoInverse))
    }

    /// Failed undos as (step, reason)
    pub fn undo_failures(&self) -> Vec<(&str, &str)> {
        self.records
            .iter()
            .filter_map(|r| match &r.outcome {
                RollbackOutcome::UndoFailed(reason) => Some((r.step.as_str(), reason.as_str())),
                _ => None,
            })
            .collect()
    }

    /// True when every completed step was undone: no failures, no skipped inverses
    pub fn is_clean(&self) -> bool {
        self.records.iter().all(|r| {
            matches!(
                r.outcome,
                RollbackOutcome::Undone | RollbackOutcome::NeverRan
            )
        })
    }

    /// Outcome recorded for a step, if the step appears in the report
    pub fn outcome_of(&self, step: &str) -> Option<&RollbackOutcome> {
        self.records
            .iter()
            .find(|r| r.step == step)
            .map(|r| &r.outcome)
    }

    fn with_outcome(&self, pred: impl Fn(&RollbackOutcome) -> bool) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| pred(&r.outcome))
            .map(|r| r.step.as_str())
            .collect()
    }
}

/// Why a forward pass did not complete
#[derive(Debug)]
pub enum StepFailure {
    /// A step's forward action returned an error
    Failed {
        step: String,
        index: usize,
        error: anyhow::Error,
    },
    /// An operator signal stopped the run
    Interrupted {
        signal: i32,
        /// The step that was running or about to run
        at_step: Option<String>,
    },
    /// `execute()` was called on a processor that already ran
    AlreadyExecuted,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { step, index, error } => {
                write!(f, "step {} '{}' failed: {:#}", index + 1, step, error)
            }
            Self::Interrupted {
                signal,
                at_step: Some(step),
            } => write!(f, "interrupted by signal {} at step '{}'", signal, step),
            Self::Interrupted {
                signal,
                at_step: None,
            } => write!(f, "interrupted by signal {}", signal),
            Self::AlreadyExecuted => write!(f, "{}", ProcessorError::AlreadyExecuted),
        }
    }
}

/// Outcome of `RevertableStepProcessor::execute`
#[derive(Debug)]
pub struct ExecutionReport {
    completed: Vec<String>,
    failure: Option<StepFailure>,
    rollback: Option<RollbackReport>,
}

impl ExecutionReport {
    /// True iff every step completed its forward action
    #[inline]
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    /// Steps whose forward action completed, in execution order.
    ///
    /// After a failure this lists what ran before the rollback.
    pub fn completed_steps(&self) -> &[String] {
        &self.completed
    }

    /// Why the forward pass stopped, if it did
    pub fn failure(&self) -> Option<&StepFailure> {
        self.failure.as_ref()
    }

    /// The rollback that followed a failure
    pub fn rollback(&self) -> Option<&RollbackReport> {
        self.rollback.as_ref()
    }

    /// The signal that interrupted the run, if any
    pub fn interrupted_by(&self) -> Option<i32> {
        match self.failure {
            Some(StepFailure::Interrupted { signal, .. }) => Some(signal),
            _ => None,
        }
    }
}

impl fmt::Display for ExecutionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.failure, &self.rollback) {
            (None, _) => write!(f, "{} step(s) completed", self.completed.len()),
            (Some(failure), Some(rollback)) => {
                write!(
                    f,
                    "{}; rolled back {} step(s)",
                    failure,
                    rollback.undone().len()
                )?;
                let skipped = rollback.skipped();
                if !skipped.is_empty() {
                    write!(f, ", not reversible: {}", skipped.join(", "))?;
                }
                for (step, reason) in rollback.undo_failures() {
                    write!(f, ", undo of '{}' failed: {}", step, reason)?;
                }
                Ok(())
            }
            (Some(failure), None) => write!(f, "{}", failure),
        }
    }
}

/// Lifecycle of a processor instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessorState {
    Building,
    Executed,
}

/// Ordered do/undo step executor with reverse-order rollback.
///
/// Build one per migration invocation, add steps, call `execute()` once and
/// drop it.
///
/// # Example
///
/// ```
/// use ee_migrate::processor::RevertableStepProcessor;
///
/// let mut rsp = RevertableStepProcessor::new();
/// rsp.add("backup-conf", || Ok(()), || Ok(())).unwrap();
/// rsp.add_irreversible("reload-nginx", || Ok(())).unwrap();
///
/// // Names are unique per processor
/// assert!(rsp.add_irreversible("reload-nginx", || Ok(())).is_err());
///
/// let report = rsp.execute();
/// assert!(report.succeeded());
/// assert_eq!(rsp.executed_steps(), vec!["backup-conf", "reload-nginx"]);
/// ```
pub struct RevertableStepProcessor {
    steps: Vec<StepAction>,
    names: HashSet<String>,
    /// Length of the executed prefix of `steps`
    executed: usize,
    state: ProcessorState,
    interrupt: Option<InterruptFlag>,
}

impl Default for RevertableStepProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl RevertableStepProcessor {
    /// Create an empty processor
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            names: HashSet::new(),
            executed: 0,
            state: ProcessorState::Building,
            interrupt: None,
        }
    }

    /// Stop the forward pass and roll back when `flag` is raised
    pub fn with_interrupt(mut self, flag: InterruptFlag) -> Self {
        self.interrupt = Some(flag);
        self
    }

    /// Append a step.
    ///
    /// # Errors
    ///
    /// - `DuplicateStep` if a step with the same name is already present
    /// - `AlreadyExecuted` if `execute()` has been called
    pub fn add_step(&mut self, step: StepAction) -> Result<(), ProcessorError> {
        if self.state == ProcessorState::Executed {
            return Err(ProcessorError::AlreadyExecuted);
        }
        if !self.names.insert(step.name().to_string()) {
            return Err(ProcessorError::DuplicateStep {
                name: step.name().to_string(),
            });
        }
        self.steps.push(step);
        Ok(())
    }

    /// Append every step of a plan, stopping at the first rejected one
    pub fn add_steps(
        &mut self,
        steps: impl IntoIterator<Item = StepAction>,
    ) -> Result<(), ProcessorError> {
        steps.into_iter().try_for_each(|step| self.add_step(step))
    }

    /// Append a reversible step
    pub fn add<D, U>(
        &mut self,
        name: impl Into<String>,
        do_action: D,
        undo_action: U,
    ) -> Result<(), ProcessorError>
    where
        D: Fn() -> anyhow::Result<()> + Send + 'static,
        U: Fn() -> anyhow::Result<()> + Send + 'static,
    {
        self.add_step(StepAction::new(name, do_action, undo_action))
    }

    /// Append a step without an inverse
    pub fn add_irreversible<D>(
        &mut self,
        name: impl Into<String>,
        do_action: D,
    ) -> Result<(), ProcessorError>
    where
        D: Fn() -> anyhow::Result<()> + Send + 'static,
    {
        self.add_step(StepAction::irreversible(name, do_action))
    }

    /// Number of steps in the plan
    #[inline]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if no steps have been added
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step names in execution order
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(StepAction::name).collect()
    }

    /// Names of the steps that completed and have not been rolled back
    pub fn executed_steps(&self) -> Vec<&str> {
        self.steps[..self.executed]
            .iter()
            .map(StepAction::name)
            .collect()
    }

    /// Run every step in order, rolling back on the first failure.
    ///
    /// May be called once; later calls run nothing and report
    /// `StepFailure::AlreadyExecuted`.
    pub fn execute(&mut self) -> ExecutionReport {
        if self.state == ProcessorState::Executed {
            error!("Step processor executed twice; refusing to re-run steps");
            return ExecutionReport {
                completed: Vec::new(),
                failure: Some(StepFailure::AlreadyExecuted),
                rollback: None,
            };
        }
        self.state = ProcessorState::Executed;

        let total = self.steps.len();
        info!("Executing {} step(s)", total);

        for index in 0..total {
            let name = self.steps[index].name().to_string();

            if let Some(signal) = self.interrupt_signal() {
                warn!("Interrupt received before step '{}'", name);
                return self.fail(
                    StepFailure::Interrupted {
                        signal,
                        at_step: Some(name),
                    },
                    index,
                );
            }

            info!("[{}/{}] Running step '{}'", index + 1, total, name);
            match self.steps[index].execute_do() {
                Ok(()) => {
                    self.executed = index + 1;
                    info!("[{}/{}] Step '{}' completed", index + 1, total, name);
                }
                Err(err) => {
                    error!(
                        "[{}/{}] Step '{}' failed: {:#}",
                        index + 1,
                        total,
                        name,
                        err
                    );
                    // A signal that killed the step's child process is the real cause
                    let failure = match self.interrupt_signal() {
                        Some(signal) => StepFailure::Interrupted {
                            signal,
                            at_step: Some(name),
                        },
                        None => StepFailure::Failed {
                            step: name,
                            index,
                            error: err,
                        },
                    };
                    return self.fail(failure, index);
                }
            }
        }

        info!("All {} step(s) completed", total);
        ExecutionReport {
            completed: self.completed_names(),
            failure: None,
            rollback: None,
        }
    }

    /// Undo every executed step in reverse order, best-effort.
    ///
    /// Safe to call at any time, including after a successful `execute()`
    /// (for example when an operator interrupt arrives between migrations).
    /// Steps are undone at most once: the executed set is empty afterwards.
    pub fn rollback(&mut self) -> RollbackReport {
        let mut report = RollbackReport::default();

        if self.executed == 0 {
            info!("Rollback: nothing to undo");
            return report;
        }

        info!("Rollback started: {} step(s) to revert", self.executed);

        for step in self.steps[..self.executed].iter().rev() {
            let outcome = match step.execute_undo() {
                Ok(UndoOutcome::Undone) => {
                    info!("Rollback: step '{}' undone", step.name());
                    RollbackOutcome::Undone
                }
                Ok(UndoOutcome::NoInverse) => {
                    warn!(
                        "Rollback: step '{}' has no inverse and was left in place",
                        step.name()
                    );
                    RollbackOutcome::SkippedNoInverse
                }
                Err(err) => {
                    error!("Rollback: undo of step '{}' failed: {:#}", step.name(), err);
                    RollbackOutcome::UndoFailed(format!("{:#}", err))
                }
            };
            report.records.push(RollbackRecord {
                step: step.name().to_string(),
                outcome,
            });
        }

        self.executed = 0;

        let failures = report.undo_failures().len();
        if failures == 0 {
            info!("Rollback finished");
        } else {
            error!(
                "Rollback finished with {} failed undo(s); manual remediation may be needed",
                failures
            );
        }

        report
    }

    fn interrupt_signal(&self) -> Option<i32> {
        self.interrupt.as_ref().and_then(InterruptFlag::signal)
    }

    fn completed_names(&self) -> Vec<String> {
        self.executed_steps()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Roll back after the forward pass stopped at `stopped_at`
    fn fail(&mut self, failure: StepFailure, stopped_at: usize) -> ExecutionReport {
        let completed = self.completed_names();
        let mut rollback = self.rollback();
        rollback
            .records
            .extend(self.steps[stopped_at..].iter().map(|step| RollbackRecord {
                step: step.name().to_string(),
                outcome: RollbackOutcome::NeverRan,
            }));

        ExecutionReport {
            completed,
            failure: Some(failure),
            rollback: Some(rollback),
        }
    }
}

impl fmt::Debug for RevertableStepProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevertableStepProcessor")
            .field("steps", &self.step_names())
            .field("executed", &self.executed_steps())
            .field("state", &self.state)
            .finish()
    }
}

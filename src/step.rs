//! Named, optionally reversible units of work.
//!
//! A `StepAction` pairs a forward action with an optional inverse. Both are
//! first-class closures captured when a migration builds its plan, so the
//! arguments a step needs are bound at plan-build time rather than resolved
//! by name when the step runs.
//!
//! # Contract
//!
//! - `Err` from an action is failure; any `Ok` is success.
//! - A step holds no run state. Whether it has executed is tracked by the
//!   `RevertableStepProcessor` that owns it.

use anyhow::Result;
use std::fmt;

/// Boxed step callable.
pub type StepFn = Box<dyn Fn() -> Result<()> + Send>;

/// What `execute_undo` did for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoOutcome {
    /// The inverse action ran and returned `Ok`
    Undone,
    /// The step has no inverse action
    NoInverse,
}

/// A named unit of work with an optional inverse.
pub struct StepAction {
    name: String,
    do_action: StepFn,
    undo_action: Option<StepFn>,
}

impl StepAction {
    /// Create a reversible step.
    pub fn new<D, U>(name: impl Into<String>, do_action: D, undo_action: U) -> Self
    where
        D: Fn() -> Result<()> + Send + 'static,
        U: Fn() -> Result<()> + Send + 'static,
    {
        Self {
            name: name.into(),
            do_action: Box::new(do_action),
            undo_action: Some(Box::new(undo_action)),
        }
    }

    /// Create a step that cannot be undone.
    ///
    /// If it completes and a later step fails, rollback skips it with a warning.
    pub fn irreversible<D>(name: impl Into<String>, do_action: D) -> Self
    where
        D: Fn() -> Result<()> + Send + 'static,
    {
        Self {
            name: name.into(),
            do_action: Box::new(do_action),
            undo_action: None,
        }
    }

    /// Create a step from plain functions and their fixed argument values.
    ///
    /// `undo_fn` of `None` makes the step irreversible; `undo_args` is then dropped.
    ///
    /// ```
    /// use ee_migrate::step::StepAction;
    /// use std::path::PathBuf;
    ///
    /// fn touch(path: &PathBuf) -> anyhow::Result<()> {
    ///     std::fs::write(path, b"")?;
    ///     Ok(())
    /// }
    /// fn remove(path: &PathBuf) -> anyhow::Result<()> {
    ///     std::fs::remove_file(path)?;
    ///     Ok(())
    /// }
    ///
    /// let marker = std::env::temp_dir().join("ee-migrate-doc-marker");
    /// let step =
    ///     StepAction::with_args("touch-marker", touch, marker.clone(), Some(remove), marker);
    /// assert!(step.is_reversible());
    /// ```
    pub fn with_args<A, B>(
        name: impl Into<String>,
        do_fn: fn(&A) -> Result<()>,
        do_args: A,
        undo_fn: Option<fn(&B) -> Result<()>>,
        undo_args: B,
    ) -> Self
    where
        A: Send + 'static,
        B: Send + 'static,
    {
        let undo_action: Option<StepFn> =
            undo_fn.map(|undo| Box::new(move || undo(&undo_args)) as StepFn);
        Self {
            name: name.into(),
            do_action: Box::new(move || do_fn(&do_args)),
            undo_action,
        }
    }

    /// Step name, unique within one processor.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if the step registered an inverse action.
    #[inline]
    pub fn is_reversible(&self) -> bool {
        self.undo_action.is_some()
    }

    /// Run the forward action.
    pub fn execute_do(&self) -> Result<()> {
        (self.do_action)()
    }

    /// Run the inverse action if there is one.
    pub fn execute_undo(&self) -> Result<UndoOutcome> {
        match &self.undo_action {
            Some(undo) => undo().map(|()| UndoOutcome::Undone),
            None => Ok(UndoOutcome::NoInverse),
        }
    }
}

impl fmt::Debug for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepAction")
            .field("name", &self.name)
            .field("reversible", &self.is_reversible())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_execute_do_invokes_forward_action() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let step = StepAction::irreversible("count", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        step.execute_do().expect("forward action should succeed");
        step.execute_do().expect("steps hold no run state");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_execute_undo_without_inverse_is_noop() {
        let step = StepAction::irreversible("reload-nginx", || Ok(()));
        assert!(!step.is_reversible());
        assert_eq!(step.execute_undo().unwrap(), UndoOutcome::NoInverse);
    }

    #[test]
    fn test_execute_undo_propagates_failure() {
        let step = StepAction::new("write-conf", || Ok(()), || anyhow::bail!("disk full"));
        let err = step.execute_undo().unwrap_err();
        assert_eq!(err.to_string(), "disk full");
    }

    #[test]
    fn test_with_args_binds_arguments() {
        fn check_len(args: &(String, usize)) -> Result<()> {
            anyhow::ensure!(args.0.len() == args.1, "length mismatch");
            Ok(())
        }

        let ok = StepAction::with_args("len-ok", check_len, ("abc".to_string(), 3), None, ());
        assert!(ok.execute_do().is_ok());
        assert!(!ok.is_reversible());

        let bad = StepAction::with_args(
            "len-bad",
            check_len,
            ("abc".to_string(), 4),
            Some(check_len),
            ("ab".to_string(), 2),
        );
        assert!(bad.execute_do().is_err());
        assert_eq!(bad.execute_undo().unwrap(), UndoOutcome::Undone);
    }

    #[test]
    fn test_debug_shows_name_and_reversibility() {
        let step = StepAction::new("backup-conf", || Ok(()), || Ok(()));
        let dbg = format!("{:?}", step);
        assert!(dbg.contains("backup-conf"));
        assert!(dbg.contains("reversible: true"));
    }
}

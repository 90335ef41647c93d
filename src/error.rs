//! Error handling module for ee-migrate
//!
//! Provides the crate-level error type using thiserror. `migration` and
//! `processor` define their own error enums; migration errors convert into
//! `EeError` at the binary boundary.

use thiserror::Error;

use crate::migration::MigrationError;

/// Main error type for ee-migrate
#[derive(Error, Debug)]
pub enum EeError {
    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Migration errors (failed and rolled back, unsupported down, bad version)
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    /// History or site store errors
    #[error("Store error: {0}")]
    Store(String),

    /// Run was interrupted by an operator signal
    #[error("Interrupted by signal {0}")]
    Interrupted(i32),
}

/// Result type alias for ee-migrate operations
pub type Result<T> = std::result::Result<T, EeError>;

impl EeError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Process exit code for this error.
    ///
    /// Interrupts exit with `128 + signal` like a shell would report them.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Interrupted(sig) => 128 + sig,
            Self::Migration(e) => e.interrupted_by().map_or(1, |sig| 128 + sig),
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::MigrationId;

    fn id() -> MigrationId {
        MigrationId::new("20200114093000", "update_nginx_security_conf").unwrap()
    }

    #[test]
    fn test_error_display() {
        let err = EeError::config("history_file is empty");
        assert_eq!(err.to_string(), "Configuration error: history_file is empty");

        let err = EeError::store("migrations.json is not valid JSON");
        assert_eq!(err.to_string(), "Store error: migrations.json is not valid JSON");
    }

    #[test]
    fn test_migration_error_conversion() {
        let err: EeError = MigrationError::NotApplied { id: id() }.into();
        assert!(matches!(err, EeError::Migration(_)));
        assert!(err.to_string().contains("20200114093000_update_nginx_security_conf"));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(EeError::Interrupted(2).exit_code(), 130);
        assert_eq!(EeError::Interrupted(15).exit_code(), 143);
        assert_eq!(EeError::store("corrupt").exit_code(), 1);

        let interrupted: EeError = MigrationError::Interrupted {
            id: id(),
            signal: 15,
            summary: "stopped before start".to_string(),
            rollback: None,
        }
        .into();
        assert_eq!(interrupted.exit_code(), 143);
    }
}

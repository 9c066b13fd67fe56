//! Error types for the migration library.

use std::fmt;

use thiserror::Error;

/// Whether a failed bulk load or event application may be attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient: connection reset, serialization conflict, timeouts.
    Retryable,
    /// Permanent: bad data, constraint violations, syntax errors.
    NonRetryable,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Retryable => write!(f, "retryable"),
            ErrorClass::NonRetryable => write!(f, "non-retryable"),
        }
    }
}

/// A failure isolated to one table during a multi-table pass.
#[derive(Debug)]
pub struct TableFailure {
    pub table: String,
    pub error: MigrateError,
}

impl fmt::Display for TableFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.table, self.error)
    }
}

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Pool build, connect or init failure for one role
    #[error("Connection error: {message}\n  Context: {context}")]
    Connection { message: String, context: String },

    /// Identifier cannot be quoted for the target engine
    #[error("Cannot quote identifier {identifier:?} of table {table}: {reason}")]
    Quoting {
        table: String,
        identifier: String,
        reason: String,
    },

    /// Bulk load of a snapshot batch failed
    #[error("Import failed for table {table} ({class}): {message}")]
    Import {
        table: String,
        class: ErrorClass,
        message: String,
    },

    /// Applying a change-event batch failed
    #[error("Applying event batch {sequence} of migration {migration_uuid} failed ({class}): {message}")]
    Apply {
        migration_uuid: String,
        sequence: i64,
        class: ErrorClass,
        message: String,
    },

    /// PostgreSQL / YugabyteDB driver error
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// MySQL driver error
    #[cfg(feature = "mysql")]
    #[error("MySQL error: {0}")]
    Mysql(#[from] mysql_async::Error),

    /// ODBC driver error (Oracle)
    #[cfg(feature = "oracle")]
    #[error("ODBC error: {0}")]
    Odbc(#[from] odbc_api::Error),

    /// SQL*Loader run failed
    #[error("Bulk loader failed for table {table} (exit code {exit_code:?}): {message}")]
    BulkLoad {
        table: String,
        exit_code: Option<i32>,
        message: String,
    },

    /// Import-state or export-stats store error
    #[error("State error: {0}")]
    State(String),

    /// One or more tables failed; siblings were still processed
    #[error("{} table(s) failed: {}", .0.len(), join_failures(.0))]
    Tables(Vec<TableFailure>),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Pass was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

fn join_failures(failures: &[TableFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl MigrateError {
    /// Create a Connection error with context about where it occurred
    pub fn connection(message: impl fmt::Display, context: impl Into<String>) -> Self {
        MigrateError::Connection {
            message: message.to_string(),
            context: context.into(),
        }
    }

    pub fn quoting(
        table: impl Into<String>,
        identifier: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        MigrateError::Quoting {
            table: table.into(),
            identifier: identifier.into(),
            reason: reason.into(),
        }
    }

    /// Create an Import error
    pub fn import(table: impl Into<String>, class: ErrorClass, message: impl fmt::Display) -> Self {
        MigrateError::Import {
            table: table.into(),
            class,
            message: message.to_string(),
        }
    }

    /// Create an Apply error
    pub fn apply(
        migration_uuid: impl fmt::Display,
        sequence: i64,
        class: ErrorClass,
        message: impl fmt::Display,
    ) -> Self {
        MigrateError::Apply {
            migration_uuid: migration_uuid.to_string(),
            sequence,
            class,
            message: message.to_string(),
        }
    }

    /// The retry class of an already classified error, if it carries one.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            MigrateError::Import { class, .. } | MigrateError::Apply { class, .. } => Some(*class),
            _ => None,
        }
    }

    /// True when the caller's retry policy may attempt the operation again.
    pub fn is_retryable(&self) -> bool {
        match self {
            MigrateError::Import { class, .. } | MigrateError::Apply { class, .. } => {
                *class == ErrorClass::Retryable
            }
            MigrateError::Connection { .. } | MigrateError::Io(_) => true,
            _ => false,
        }
    }

    /// Process exit code used by the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) | MigrateError::Quoting { .. } => 2,
            MigrateError::Connection { .. } => 3,
            MigrateError::Import { .. }
            | MigrateError::Apply { .. }
            | MigrateError::BulkLoad { .. }
            | MigrateError::Tables(_) => 4,
            MigrateError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        if let MigrateError::Tables(failures) = self {
            for failure in failures {
                output.push_str(&format!("\n  - {}", failure));
            }
        }

        // Add error chain for wrapped errors
        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_error_is_retryable_by_class() {
        let transient = MigrateError::import("public.orders", ErrorClass::Retryable, "reset");
        let permanent =
            MigrateError::import("public.orders", ErrorClass::NonRetryable, "bad input");
        assert!(transient.is_retryable());
        assert!(!permanent.is_retryable());
        assert_eq!(permanent.class(), Some(ErrorClass::NonRetryable));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(MigrateError::Config("x".into()).exit_code(), 2);
        assert_eq!(MigrateError::connection("refused", "target").exit_code(), 3);
        assert_eq!(MigrateError::Tables(vec![]).exit_code(), 4);
        assert_eq!(MigrateError::Cancelled.exit_code(), 130);
    }

    #[test]
    fn test_tables_error_lists_every_table() {
        let err = MigrateError::Tables(vec![
            TableFailure {
                table: "a".into(),
                error: MigrateError::State("boom".into()),
            },
            TableFailure {
                table: "b".into(),
                error: MigrateError::Cancelled,
            },
        ]);
        let msg = err.to_string();
        assert!(msg.starts_with("2 table(s) failed"));
        assert!(msg.contains("a: State error: boom"));
        assert!(err.format_detailed().contains("  - b: Migration cancelled"));
    }
}

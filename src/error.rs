//! Typed error taxonomy.
//!
//! Components that callers branch on return these instead of opaque
//! `anyhow` errors:
//!
//! | Error | Raised by | Handling |
//! |-------|-----------|----------|
//! | [`CatalogError`] | schema-docs import | fatal at startup |
//! | [`ExecutionError::Unsafe`] | gateway precondition check | terminal, never retried |
//! | [`ExecutionError::Database`] | gateway / database | retried when [`DbErrorKind::is_recoverable`] |
//! | [`ExecutionError::Unavailable`] | connection pool | fatal for the request |
//! | [`ModelError`] | language-model calls | timeouts and malformed replies are retried |
//! | [`ExpandError`] | schema selector | recorded as a failed attempt |

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Problems found while importing the schema documentation.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read schema docs {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse schema docs: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("table '{0}' is declared more than once")]
    DuplicateTable(String),
    #[error("column '{table}.{column}' is declared more than once")]
    DuplicateColumn { table: String, column: String },
    #[error("invalid reference '{reference}' on {table}.{column}: expected <table>.<column>")]
    InvalidReference {
        table: String,
        column: String,
        reference: String,
    },
    #[error("{table}.{column} references missing table '{target}'")]
    MissingTable {
        table: String,
        column: String,
        target: String,
    },
    #[error("{table}.{column} references missing column '{target_table}.{target_column}'")]
    MissingColumn {
        table: String,
        column: String,
        target_table: String,
        target_column: String,
    },
}

/// Classified database failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DbErrorKind {
    SyntaxError,
    UnknownColumn,
    UnknownTable,
    ConstraintViolation,
    Timeout,
}

impl DbErrorKind {
    /// Whether the model gets another try after this failure.
    pub fn is_recoverable(self) -> bool {
        match self {
            DbErrorKind::SyntaxError
            | DbErrorKind::UnknownColumn
            | DbErrorKind::UnknownTable
            | DbErrorKind::ConstraintViolation
            | DbErrorKind::Timeout => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DbErrorKind::SyntaxError => "syntax-error",
            DbErrorKind::UnknownColumn => "unknown-column",
            DbErrorKind::UnknownTable => "unknown-table",
            DbErrorKind::ConstraintViolation => "constraint-violation",
            DbErrorKind::Timeout => "timeout",
        }
    }

    /// Map a SQLite error message onto the taxonomy.
    ///
    /// Anything that does not match a known pattern is reported as a
    /// syntax error, which gives the model a chance to rewrite the query.
    pub fn classify(message: &str) -> Self {
        let msg = message.to_lowercase();

        if msg.contains("no such table") || msg.contains("no such view") {
            return DbErrorKind::UnknownTable;
        }
        if msg.contains("no such column") || msg.contains("ambiguous column") {
            return DbErrorKind::UnknownColumn;
        }
        if msg.contains("constraint") {
            return DbErrorKind::ConstraintViolation;
        }
        if msg.contains("interrupted") || msg.contains("timed out") || msg.contains("timeout") {
            return DbErrorKind::Timeout;
        }
        DbErrorKind::SyntaxError
    }
}

impl fmt::Display for DbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A database error with its classification and the underlying message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct DbError {
    pub kind: DbErrorKind,
    pub message: String,
}

impl DbError {
    pub fn new(kind: DbErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Outcome of a failed `execute` call on the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("unsafe statement rejected: {0}")]
    Unsafe(String),
    #[error(transparent)]
    Database(#[from] DbError),
    #[error("database unavailable: {0}")]
    Unavailable(String),
}

/// Failure of a language-model call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("model call timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("malformed model response: {0}")]
    Malformed(String),
    #[error("model unavailable: {0}")]
    Unavailable(String),
}

/// Rejected `expand` request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpandError {
    #[error("table '{0}' is not in the schema catalog")]
    UnknownTable(String),
    #[error("schema context already holds the maximum of {0} tables")]
    ContextFull(usize),
}

/// Raised by `ask_with_cancel` when the caller cancels the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("request cancelled")]
pub struct Cancelled;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_sqlite_messages() {
        assert_eq!(
            DbErrorKind::classify("no such table: patennts"),
            DbErrorKind::UnknownTable
        );
        assert_eq!(
            DbErrorKind::classify("no such column: p.titel"),
            DbErrorKind::UnknownColumn
        );
        assert_eq!(
            DbErrorKind::classify("near \"SELEC\": syntax error"),
            DbErrorKind::SyntaxError
        );
        assert_eq!(
            DbErrorKind::classify("UNIQUE constraint failed: patents.patent_id"),
            DbErrorKind::ConstraintViolation
        );
        assert_eq!(DbErrorKind::classify("interrupted"), DbErrorKind::Timeout);
    }

    #[test]
    fn classified_database_errors_are_recoverable() {
        assert!(DbErrorKind::SyntaxError.is_recoverable());
        assert!(DbErrorKind::Timeout.is_recoverable());
        assert!(DbErrorKind::ConstraintViolation.is_recoverable());
    }

    #[test]
    fn kinds_serialize_kebab_case() {
        let json = serde_json::to_string(&DbErrorKind::UnknownTable).unwrap();
        assert_eq!(json, "\"unknown-table\"");
    }
}

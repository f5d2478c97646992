//! Core data models used throughout the query pipeline.
//!
//! These types describe one question's trip through the agent loop: the
//! attempts made, the rows returned, and the final answer.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::error::{DbErrorKind, ExecutionError, ExpandError, ModelError};

/// Rows returned by a read-only query.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    /// More rows were available than the configured row limit.
    pub truncated: bool,
}

impl RowSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Why an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    UnsafeStatement,
    SyntaxError,
    UnknownColumn,
    UnknownTable,
    ConstraintViolation,
    Timeout,
    DatabaseUnavailable,
    ModelTimeout,
    MalformedResponse,
    ModelUnavailable,
    ExpansionRejected,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::UnsafeStatement => "unsafe-statement",
            FailureKind::SyntaxError => "syntax-error",
            FailureKind::UnknownColumn => "unknown-column",
            FailureKind::UnknownTable => "unknown-table",
            FailureKind::ConstraintViolation => "constraint-violation",
            FailureKind::Timeout => "timeout",
            FailureKind::DatabaseUnavailable => "database-unavailable",
            FailureKind::ModelTimeout => "model-timeout",
            FailureKind::MalformedResponse => "malformed-response",
            FailureKind::ModelUnavailable => "model-unavailable",
            FailureKind::ExpansionRejected => "expansion-rejected",
        }
    }

    /// Recoverable failures are fed back to the model for another attempt.
    pub fn is_recoverable(self) -> bool {
        match self {
            FailureKind::SyntaxError => DbErrorKind::SyntaxError.is_recoverable(),
            FailureKind::UnknownColumn => DbErrorKind::UnknownColumn.is_recoverable(),
            FailureKind::UnknownTable => DbErrorKind::UnknownTable.is_recoverable(),
            FailureKind::ConstraintViolation => DbErrorKind::ConstraintViolation.is_recoverable(),
            FailureKind::Timeout => DbErrorKind::Timeout.is_recoverable(),
            FailureKind::ModelTimeout
            | FailureKind::MalformedResponse
            | FailureKind::ExpansionRejected => true,
            FailureKind::UnsafeStatement
            | FailureKind::DatabaseUnavailable
            | FailureKind::ModelUnavailable => false,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<DbErrorKind> for FailureKind {
    fn from(kind: DbErrorKind) -> Self {
        match kind {
            DbErrorKind::SyntaxError => FailureKind::SyntaxError,
            DbErrorKind::UnknownColumn => FailureKind::UnknownColumn,
            DbErrorKind::UnknownTable => FailureKind::UnknownTable,
            DbErrorKind::ConstraintViolation => FailureKind::ConstraintViolation,
            DbErrorKind::Timeout => FailureKind::Timeout,
        }
    }
}

impl From<&ExecutionError> for FailureKind {
    fn from(err: &ExecutionError) -> Self {
        match err {
            ExecutionError::Unsafe(_) => FailureKind::UnsafeStatement,
            ExecutionError::Database(db) => db.kind.into(),
            ExecutionError::Unavailable(_) => FailureKind::DatabaseUnavailable,
        }
    }
}

impl From<&ModelError> for FailureKind {
    fn from(err: &ModelError) -> Self {
        match err {
            ModelError::Timeout(_) => FailureKind::ModelTimeout,
            ModelError::Malformed(_) => FailureKind::MalformedResponse,
            ModelError::Unavailable(_) => FailureKind::ModelUnavailable,
        }
    }
}

impl From<&ExpandError> for FailureKind {
    fn from(_: &ExpandError) -> Self {
        FailureKind::ExpansionRejected
    }
}

/// Execution outcome of one attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success { row_count: usize, truncated: bool },
    Failure { kind: FailureKind, message: String },
}

/// One generate-execute cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryAttempt {
    /// Zero-based, strictly increasing within a request.
    pub index: u32,
    /// `None` when the model never produced a statement for this attempt.
    pub sql: Option<String>,
    pub outcome: AttemptOutcome,
    pub timestamp: DateTime<Utc>,
}

impl QueryAttempt {
    pub fn failure(&self) -> Option<(FailureKind, &str)> {
        match &self.outcome {
            AttemptOutcome::Failure { kind, message } => Some((*kind, message.as_str())),
            AttemptOutcome::Success { .. } => None,
        }
    }
}

/// Terminal state of a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminalStatus {
    Answered,
    ExhaustedRetries,
    RejectedUnsafe,
    ExecutionErrorFatal,
}

impl TerminalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminalStatus::Answered => "answered",
            TerminalStatus::ExhaustedRetries => "exhausted-retries",
            TerminalStatus::RejectedUnsafe => "rejected-unsafe",
            TerminalStatus::ExecutionErrorFatal => "execution-error-fatal",
        }
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final result of `ask`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerResult {
    pub question: String,
    /// Statement as executed, including any appended row limit.
    pub final_sql: Option<String>,
    pub rows: Option<RowSet>,
    pub answer: String,
    pub attempts: Vec<QueryAttempt>,
    pub status: TerminalStatus,
    /// Tables the model was shown, in prompt order.
    pub context_tables: Vec<String>,
}

impl AnswerResult {
    /// The most recent failed attempt, if any.
    pub fn last_failure(&self) -> Option<(FailureKind, &str)> {
        self.attempts.iter().rev().find_map(|a| a.failure())
    }
}

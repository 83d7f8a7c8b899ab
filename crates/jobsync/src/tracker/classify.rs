//! Error taxonomy for run error logs.
//!
//! Typed errors map by variant. Untyped text falls back to keyword rules and
//! finally to `Unknown`, so every input lands in exactly one bucket.

use serde::{Deserialize, Serialize};

use crate::db::DatabaseError;
use crate::error::{FeedError, QueueError, TrackerError, WorkerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCode {
    Fetch,
    Parse,
    Validation,
    Duplicate,
    Processing,
    Database,
    Queue,
    Unknown,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 8] = [
        ErrorCode::Fetch,
        ErrorCode::Parse,
        ErrorCode::Validation,
        ErrorCode::Duplicate,
        ErrorCode::Processing,
        ErrorCode::Database,
        ErrorCode::Queue,
        ErrorCode::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Fetch => "fetch",
            ErrorCode::Parse => "parse",
            ErrorCode::Validation => "validation",
            ErrorCode::Duplicate => "duplicate",
            ErrorCode::Processing => "processing",
            ErrorCode::Database => "database",
            ErrorCode::Queue => "queue",
            ErrorCode::Unknown => "unknown",
        }
    }

    /// Parses a stored code. Unrecognized values become `Unknown`.
    pub fn from_stored(value: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == value)
            .unwrap_or(ErrorCode::Unknown)
    }

    /// Severity of a terminal failure with this code.
    pub fn severity(&self) -> Severity {
        match self {
            ErrorCode::Validation | ErrorCode::Duplicate => Severity::Warning,
            ErrorCode::Database | ErrorCode::Queue => Severity::Critical,
            _ => Severity::Error,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }

    pub fn from_stored(value: &str) -> Self {
        match value {
            "warning" => Severity::Warning,
            "critical" => Severity::Critical,
            _ => Severity::Error,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps an error onto the taxonomy.
pub trait Classify {
    fn error_code(&self) -> ErrorCode;
}

impl Classify for FeedError {
    fn error_code(&self) -> ErrorCode {
        match self {
            FeedError::Fetch { .. } | FeedError::HttpStatus { .. } | FeedError::NotAFeed { .. } => {
                ErrorCode::Fetch
            }
            FeedError::Parse(_) | FeedError::UnsupportedSource(_) => ErrorCode::Parse,
        }
    }
}

impl Classify for DatabaseError {
    fn error_code(&self) -> ErrorCode {
        if self.is_unique_violation() {
            ErrorCode::Duplicate
        } else {
            ErrorCode::Database
        }
    }
}

impl Classify for QueueError {
    fn error_code(&self) -> ErrorCode {
        ErrorCode::Queue
    }
}

impl Classify for TrackerError {
    fn error_code(&self) -> ErrorCode {
        match self {
            TrackerError::Database(e) => e.error_code(),
            _ => ErrorCode::Processing,
        }
    }
}

impl Classify for WorkerError {
    fn error_code(&self) -> ErrorCode {
        match self {
            WorkerError::Validation { .. } => ErrorCode::Validation,
            WorkerError::Duplicate { .. } => ErrorCode::Duplicate,
            WorkerError::Processing(msg) => classify_message(msg).unwrap_or(ErrorCode::Processing),
            WorkerError::Database(e) => e.error_code(),
            WorkerError::Queue(e) => e.error_code(),
            WorkerError::Tracker(e) => e.error_code(),
            WorkerError::SpawnFailed(_) => ErrorCode::Unknown,
        }
    }
}

/// Keyword rules for free-form messages, checked in order.
const MESSAGE_RULES: &[(ErrorCode, &[&str])] = &[
    (ErrorCode::Duplicate, &["duplicate key", "unique constraint", "already exists"]),
    (ErrorCode::Validation, &["validation", "required field", "missing required", "invalid value"]),
    (ErrorCode::Fetch, &["fetch", "network", "timed out", "connection refused", "http "]),
    (ErrorCode::Parse, &["parse", "xml", "malformed", "unexpected token"]),
    (ErrorCode::Database, &["database", "sqlite", "sql error"]),
    (ErrorCode::Queue, &["queue", "enqueue", "dead letter"]),
];

/// Classifies free-form text. `None` when no rule matches.
pub fn classify_message(message: &str) -> Option<ErrorCode> {
    let lower = message.to_lowercase();
    MESSAGE_RULES
        .iter()
        .find(|(_, needles)| needles.iter().any(|n| lower.contains(n)))
        .map(|(code, _)| *code)
}

/// Total classification of free-form text.
pub fn classify_text(message: &str) -> ErrorCode {
    classify_message(message).unwrap_or(ErrorCode::Unknown)
}

use std::path::PathBuf;
use thiserror::Error;

use crate::tracker::RunStatus;

#[derive(Error, Debug)]
pub enum JobsyncError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Run tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid source '{name}': {reason}")]
    InvalidSource { name: String, reason: String },
}

/// Errors raised while fetching or normalizing a feed.
///
/// Any of these aborts the source before a run is created.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Failed to fetch '{url}': {reason}")]
    Fetch { url: String, reason: String },

    #[error("Feed '{url}' returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("Response from '{url}' is not a feed: {reason}")]
    NotAFeed { url: String, reason: String },

    #[error("XML parse error: {0}")]
    Parse(String),

    #[error("Unsupported source: {0}")]
    UnsupportedSource(String),
}

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Import run not found: {0}")]
    RunNotFound(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("Import run {0} was modified concurrently")]
    ConcurrentModification(String),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to encode task payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode payload of task {task_id}: {source}")]
    Decode {
        task_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Queue storage error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

/// Per-task failures raised by the consumer.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Validation failed for item '{external_id}': {reason}")]
    Validation { external_id: String, reason: String },

    #[error("Duplicate key ({source_name}, {external_id}) could not be resolved")]
    Duplicate {
        source_name: String,
        external_id: String,
    },

    #[error("Processing failed: {0}")]
    Processing(String),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Run tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),
}

impl WorkerError {
    /// Whether the queue should schedule another attempt for this failure.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, WorkerError::Validation { .. })
    }
}

pub type Result<T> = std::result::Result<T, JobsyncError>;

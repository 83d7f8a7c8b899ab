pub mod config;
pub mod db;
pub mod error;
pub mod feed;
pub mod producer;
pub mod queue;
pub mod records;
pub mod sanitize;
pub mod scheduler;
pub mod telemetry;
pub mod tracker;
pub mod worker;

pub use config::{load_config, load_or_default, Config};
pub use db::{Database, DatabaseError};
pub use error::{
    ConfigError, FeedError, JobsyncError, QueueError, Result, TrackerError, WorkerError,
};
pub use feed::{FeedFetcher, FeedSource, HttpFeedFetcher, NormalizedItem};
pub use producer::Producer;
pub use queue::{QueueDepth, RetryPolicy, TaskQueue};
pub use records::{JobRecord, Outcome};
pub use scheduler::{ScheduleSettings, Scheduler, SweepOutcome};
pub use tracker::{ErrorCode, ImportRun, RunStatus, RunTracker};
pub use worker::{ConsumerPool, TaskReport};

// Re-export crossbeam_channel for consumers of TaskReport streams
pub use crossbeam_channel;

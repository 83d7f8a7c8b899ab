//! Fetch, normalize, open a run, enqueue one task per item.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{FeedError, JobsyncError, Result};
use crate::feed::{normalize_feed, FeedFetcher, FeedFormat, FeedSource};
use crate::queue::{NewTask, QueueDepth, TaskQueue};
use crate::sanitize::redact_url;
use crate::tracker::{ErrorDetail, RunTracker};

/// Tasks written per enqueue transaction.
const ENQUEUE_CHUNK: usize = 100;

/// Snapshot returned by [`Producer::queue_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub depth: QueueDepth,
    pub timestamp: DateTime<Utc>,
}

pub struct Producer {
    fetcher: Arc<dyn FeedFetcher>,
    tracker: RunTracker,
    queue: TaskQueue,
}

impl Producer {
    pub fn new(fetcher: Arc<dyn FeedFetcher>, tracker: RunTracker, queue: TaskQueue) -> Self {
        Self {
            fetcher,
            tracker,
            queue,
        }
    }

    /// Fetches `source`, opens a run for it and enqueues its items.
    ///
    /// Fetch and normalization failures return before any run exists. Once
    /// the run is open, an enqueue failure fails the run; tasks that made it
    /// into the queue are still processed. Returns without waiting for the
    /// consumers.
    pub async fn fetch_and_enqueue(&self, source: &FeedSource) -> Result<String> {
        // Reject unknown names before touching the network.
        FeedFormat::for_source(&source.name)?;

        let fetched = self.fetcher.fetch(source).await?;
        let items = normalize_feed(&fetched.body, fetched.content_type.as_deref(), source)?;
        debug!("Source '{}' yielded {} item(s)", source.name, items.len());

        let run_id = self.tracker.create_run(&source.name, &source.url)?;
        self.tracker.begin(&run_id, items.len() as u64)?;

        if items.is_empty() {
            self.tracker.maybe_finalize(&run_id)?;
            info!("Source '{}' had no items; run {} closed", source.name, run_id);
            return Ok(run_id);
        }

        let tasks: Vec<NewTask> = items
            .into_iter()
            .map(|item| NewTask::new(run_id.clone(), source.name.clone(), item))
            .collect();

        let mut enqueued = 0usize;
        for chunk in tasks.chunks(ENQUEUE_CHUNK) {
            if let Err(e) = self.queue.enqueue_batch(chunk) {
                error!(
                    "Enqueue failed for run {} after {}/{} task(s): {}",
                    run_id,
                    enqueued,
                    tasks.len(),
                    e
                );
                let detail = ErrorDetail::from_error(&e);
                if let Err(fail_err) = self.tracker.fail_run(&run_id, &detail) {
                    warn!("Could not mark run {} failed: {}", run_id, fail_err);
                }
                return Err(JobsyncError::Queue(e));
            }
            enqueued += chunk.len();
        }

        info!(
            "Source '{}' ({}): run {} enqueued {} task(s)",
            source.name,
            redact_url(&source.url),
            run_id,
            enqueued
        );
        Ok(run_id)
    }

    /// Current queue depth with a timestamp.
    pub fn queue_status(&self) -> Result<QueueStatus> {
        Ok(QueueStatus {
            depth: self.queue.depth()?,
            timestamp: Utc::now(),
        })
    }

    pub fn tracker(&self) -> &RunTracker {
        &self.tracker
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }
}

/// True for errors that mean "nothing was fetched", as opposed to a run that
/// was opened and then failed.
pub fn is_pre_run_error(err: &JobsyncError) -> bool {
    matches!(err, JobsyncError::Feed(_))
}

//! Test harness for isolated pipeline runs.
//!
//! `TestHarness` opens a file-backed database in a temp directory and wires
//! the tracker, queue and producer around a `StubFetcher`, so a test can
//! serve canned feed bodies and drive consumption synchronously.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use jobsync::db::job_repo;
use jobsync::feed::{FeedFetcher, FeedSource, FetchedFeed};
use jobsync::queue::{BackoffPolicy, RetryPolicy, TaskQueue};
use jobsync::worker::{process_task, TaskReport};
use jobsync::{Database, FeedError, JobRecord, Producer, RunTracker};

#[derive(Debug, Clone)]
enum StubResponse {
    Body {
        body: String,
        content_type: Option<String>,
    },
    Status(u16),
}

/// Serves canned responses keyed by source name. Unknown sources get 404.
#[derive(Default)]
pub struct StubFetcher {
    responses: Mutex<HashMap<String, StubResponse>>,
    calls: Mutex<Vec<String>>,
}

impl StubFetcher {
    pub fn serve(&self, source: &str, body: impl Into<String>, content_type: Option<&str>) {
        self.responses.lock().unwrap().insert(
            source.to_string(),
            StubResponse::Body {
                body: body.into(),
                content_type: content_type.map(str::to_string),
            },
        );
    }

    pub fn fail_with_status(&self, source: &str, status: u16) {
        self.responses
            .lock()
            .unwrap()
            .insert(source.to_string(), StubResponse::Status(status));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FeedFetcher for StubFetcher {
    async fn fetch(&self, source: &FeedSource) -> Result<FetchedFeed, FeedError> {
        self.calls.lock().unwrap().push(source.name.clone());
        let response = self.responses.lock().unwrap().get(&source.name).cloned();
        match response {
            Some(StubResponse::Body { body, content_type }) => Ok(FetchedFeed {
                body,
                content_type,
                status: 200,
            }),
            Some(StubResponse::Status(status)) => Err(FeedError::HttpStatus {
                url: source.url.clone(),
                status,
            }),
            None => Err(FeedError::HttpStatus {
                url: source.url.clone(),
                status: 404,
            }),
        }
    }
}

/// Test harness providing an isolated pipeline.
pub struct TestHarness {
    temp_dir: TempDir,
    pub db: Database,
    pub tracker: RunTracker,
    pub queue: TaskQueue,
    pub fetcher: Arc<StubFetcher>,
    pub producer: Arc<Producer>,
}

impl TestHarness {
    /// Harness with three attempts per task and no backoff delay.
    pub fn new() -> Self {
        Self::with_policy(RetryPolicy {
            max_attempts: 3,
            backoff: BackoffPolicy::new(Duration::ZERO, Duration::ZERO),
        })
    }

    pub fn with_policy(policy: RetryPolicy) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db = Database::open(&temp_dir.path().join("data").join("jobsync.db"))
            .expect("Failed to open database");
        let tracker = RunTracker::new(db.clone());
        let queue = TaskQueue::with_policy(db.clone(), policy);
        let fetcher = Arc::new(StubFetcher::default());
        let producer = Arc::new(Producer::new(
            fetcher.clone(),
            tracker.clone(),
            queue.clone(),
        ));

        Self {
            temp_dir,
            db,
            tracker,
            queue,
            fetcher,
            producer,
        }
    }

    pub fn source(name: &str) -> FeedSource {
        let url = if name == "higheredjobs" {
            "https://www.higheredjobs.com/rss/articleFeed.cfm".to_string()
        } else {
            format!("https://jobicy.com/?feed=job_feed&source={}", name)
        };
        FeedSource::new(name, url)
    }

    /// Serves `body` for `source`, runs the producer for it and returns the
    /// run id.
    pub async fn import(&self, source: &str, body: &str) -> String {
        self.fetcher.serve(source, body, Some("application/rss+xml"));
        self.producer
            .fetch_and_enqueue(&Self::source(source))
            .await
            .expect("fetch_and_enqueue failed")
    }

    /// Processes ready tasks on the calling thread until none is left.
    pub fn drain(&self) -> Vec<TaskReport> {
        let mut reports = Vec::new();
        while let Some(task) = self.queue.dequeue("test-worker").expect("dequeue failed") {
            reports.push(process_task(&self.queue, &task).expect("process_task failed"));
        }
        reports
    }

    pub fn record_count(&self) -> u64 {
        self.db.with_conn(job_repo::count).unwrap()
    }

    pub fn record(&self, source: &str, external_id: &str) -> Option<JobRecord> {
        self.db
            .with_conn(|conn| job_repo::find_by_key(conn, source, external_id))
            .unwrap()
    }

    /// Executes raw SQL against the test database.
    pub fn execute(&self, sql: &str) {
        self.db
            .with_conn(|conn| {
                conn.execute_batch(sql)?;
                Ok(())
            })
            .unwrap();
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

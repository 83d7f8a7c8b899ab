//! Periodic feed sweeps and the stuck-run reaper.
//!
//! One background thread runs a sweep at startup, every `sweep_interval`
//! and on manual trigger. Every `reaper_interval` it reaps stuck runs and
//! requeues tasks whose claim outlived `claim_lease`.
//! At most one sweep dispatches at a time; a sweep requested while another
//! is running is skipped, not queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::Instrument;

use crate::error::{TrackerError, WorkerError};
use crate::feed::FeedSource;
use crate::producer::Producer;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_STUCK_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSettings {
    pub sweep_interval: Duration,
    pub reaper_interval: Duration,
    pub stuck_timeout: Duration,
    /// How long a worker may hold a task before it is handed out again.
    pub claim_lease: Duration,
    pub sweep_on_startup: bool,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            reaper_interval: DEFAULT_REAPER_INTERVAL,
            stuck_timeout: DEFAULT_STUCK_TIMEOUT,
            claim_lease: DEFAULT_CLAIM_LEASE,
            sweep_on_startup: true,
        }
    }
}

/// A source that could not be dispatched during a sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceFailure {
    pub source: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepSummary {
    /// Runs opened, in source order.
    pub runs: Vec<String>,
    pub failures: Vec<SourceFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Another sweep was already dispatching.
    Skipped,
    Completed(SweepSummary),
}

/// Clears the in-flight flag when the sweep ends, however it ends.
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Scheduler {
    producer: Arc<Producer>,
    sources: Arc<Vec<FeedSource>>,
    settings: ScheduleSettings,
    sweeping: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        producer: Arc<Producer>,
        sources: Vec<FeedSource>,
        settings: ScheduleSettings,
    ) -> Self {
        Self {
            producer,
            sources: Arc::new(sources),
            settings,
            sweeping: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn settings(&self) -> ScheduleSettings {
        self.settings
    }

    /// Dispatches every configured source once, unless a sweep is running.
    pub async fn run_sweep(&self) -> SweepOutcome {
        sweep(&self.producer, &self.sources, &self.sweeping).await
    }

    /// Fails runs stuck in progress longer than the configured timeout and
    /// requeues tasks whose claim expired.
    pub fn reap(&self) -> Result<Vec<String>, TrackerError> {
        if let Err(e) = self.producer.queue().requeue_expired(self.settings.claim_lease) {
            error!("Requeueing expired claims failed: {}", e);
        }
        self.producer.tracker().reap_stuck(self.settings.stuck_timeout)
    }

    /// Starts the scheduling loop on a background thread.
    /// `trigger_rx` requests an immediate sweep.
    pub fn start(
        &self,
        mut trigger_rx: broadcast::Receiver<()>,
    ) -> Result<JoinHandle<()>, WorkerError> {
        let producer = Arc::clone(&self.producer);
        let sources = Arc::clone(&self.sources);
        let sweeping = Arc::clone(&self.sweeping);
        let shutdown = Arc::clone(&self.shutdown);
        let settings = self.settings;

        let spawned = std::thread::Builder::new()
            .name("jobsync-scheduler".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Scheduler could not start its runtime: {}", e);
                        return;
                    }
                };

                rt.block_on(async {
                    if settings.sweep_on_startup {
                        reap(&producer, settings);
                        log_sweep(sweep(&producer, &sources, &sweeping).await);
                    }

                    let mut sweep_timer = tokio::time::interval(settings.sweep_interval);
                    let mut reaper_timer = tokio::time::interval(settings.reaper_interval);
                    // skip immediate first ticks
                    sweep_timer.tick().await;
                    reaper_timer.tick().await;

                    loop {
                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }

                        let run_sweep = tokio::select! {
                            _ = sweep_timer.tick() => true,
                            _ = reaper_timer.tick() => false,
                            Ok(()) = trigger_rx.recv() => {
                                info!("Manual sweep triggered");
                                true
                            },
                        };

                        if shutdown.load(Ordering::Acquire) {
                            break;
                        }

                        if run_sweep {
                            log_sweep(sweep(&producer, &sources, &sweeping).await);
                        } else {
                            reap(&producer, settings);
                        }
                    }
                });
            });

        spawned.map_err(|e| WorkerError::SpawnFailed(e.to_string()))
    }

    /// Signals the loop to stop. A sweep already dispatching finishes first.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

async fn sweep(producer: &Producer, sources: &[FeedSource], sweeping: &AtomicBool) -> SweepOutcome {
    if sweeping
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        warn!("Sweep already in progress, skipping");
        return SweepOutcome::Skipped;
    }
    let _guard = SweepGuard(sweeping);

    let span = tracing::info_span!("sweep", sources = sources.len());
    let summary = dispatch_all(producer, sources).instrument(span).await;
    SweepOutcome::Completed(summary)
}

async fn dispatch_all(producer: &Producer, sources: &[FeedSource]) -> SweepSummary {
    let mut summary = SweepSummary::default();

    for source in sources {
        match producer.fetch_and_enqueue(source).await {
            Ok(run_id) => summary.runs.push(run_id),
            Err(e) => {
                error!("Source '{}' failed: {}", source.name, e);
                summary.failures.push(SourceFailure {
                    source: source.name.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    summary
}

fn log_sweep(outcome: SweepOutcome) {
    if let SweepOutcome::Completed(summary) = outcome {
        info!(
            "Sweep finished: {} run(s) started, {} source(s) failed",
            summary.runs.len(),
            summary.failures.len()
        );
    }
}

fn reap(producer: &Producer, settings: ScheduleSettings) {
    if let Err(e) = producer.queue().requeue_expired(settings.claim_lease) {
        error!("Requeueing expired claims failed: {}", e);
    }
    match producer.tracker().reap_stuck(settings.stuck_timeout) {
        Ok(reaped) if !reaped.is_empty() => info!("Reaped {} stuck run(s)", reaped.len()),
        Err(e) => error!("Stuck-run reaper failed: {}", e),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::error::FeedError;
    use crate::feed::{FeedFetcher, FetchedFeed};
    use crate::queue::TaskQueue;
    use crate::tracker::RunTracker;
    use async_trait::async_trait;

    struct SlowFetcher {
        delay: Duration,
    }

    #[async_trait]
    impl FeedFetcher for SlowFetcher {
        async fn fetch(&self, source: &FeedSource) -> Result<FetchedFeed, FeedError> {
            tokio::time::sleep(self.delay).await;
            if source.name == "higheredjobs" {
                return Err(FeedError::HttpStatus {
                    url: source.url.clone(),
                    status: 500,
                });
            }
            Ok(FetchedFeed {
                body: "<rss><channel></channel></rss>".to_string(),
                content_type: None,
                status: 200,
            })
        }
    }

    fn scheduler(delay: Duration, settings: ScheduleSettings) -> Scheduler {
        let db = Database::open_in_memory().unwrap();
        let producer = Producer::new(
            Arc::new(SlowFetcher { delay }),
            RunTracker::new(db.clone()),
            TaskQueue::new(db),
        );
        let sources = vec![
            FeedSource::new("jobicy_all", "https://jobicy.com/?feed=job_feed"),
            FeedSource::new("higheredjobs", "https://www.higheredjobs.com/rss"),
            FeedSource::new(
                "jobicy_design",
                "https://jobicy.com/?feed=job_feed&job_categories=design",
            ),
        ];
        Scheduler::new(Arc::new(producer), sources, settings)
    }

    #[tokio::test]
    async fn test_sweep_continues_past_failing_source() {
        let s = scheduler(Duration::ZERO, ScheduleSettings::default());
        let SweepOutcome::Completed(summary) = s.run_sweep().await else {
            panic!("sweep was skipped");
        };
        assert_eq!(summary.runs.len(), 2);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].source, "higheredjobs");
    }

    #[tokio::test]
    async fn test_overlapping_sweep_is_skipped() {
        let s = scheduler(Duration::from_millis(50), ScheduleSettings::default());
        let (first, second) = tokio::join!(s.run_sweep(), s.run_sweep());
        assert!(matches!(first, SweepOutcome::Completed(_)));
        assert_eq!(second, SweepOutcome::Skipped);

        // The guard is released afterwards.
        assert!(matches!(s.run_sweep().await, SweepOutcome::Completed(_)));
    }

    #[test]
    fn test_reap_requeues_expired_claims() {
        let s = scheduler(
            Duration::ZERO,
            ScheduleSettings {
                claim_lease: Duration::ZERO,
                ..ScheduleSettings::default()
            },
        );
        let queue = s.producer.queue();
        let item = crate::feed::NormalizedItem {
            title: "Designer".into(),
            company: "Acme".into(),
            description: String::new(),
            location: None,
            job_type: crate::feed::JobType::Other,
            category: None,
            url: "https://example.com/1".into(),
            source: "jobicy".into(),
            external_id: "1".into(),
        };
        queue
            .enqueue(&crate::queue::NewTask::new("run-1", "jobicy_all", item))
            .unwrap();
        queue.dequeue("lost-worker").unwrap().unwrap();

        std::thread::sleep(Duration::from_millis(5));
        assert!(s.reap().unwrap().is_empty());
        let depth = queue.depth().unwrap();
        assert_eq!((depth.ready, depth.running), (1, 0));
    }

    #[test]
    fn test_scheduler_shutdown() {
        let s = scheduler(
            Duration::ZERO,
            ScheduleSettings {
                sweep_interval: Duration::from_millis(50),
                reaper_interval: Duration::from_millis(50),
                ..ScheduleSettings::default()
            },
        );

        let (trigger_tx, trigger_rx) = broadcast::channel(16);
        let handle = s.start(trigger_rx).unwrap();

        std::thread::sleep(Duration::from_millis(100));
        s.stop();

        // Wake the select loop so it sees the shutdown.
        let _ = trigger_tx.send(());

        handle.join().expect("scheduler thread panicked");

        // The startup sweep opened a run per healthy source.
        let runs = s.producer.tracker().recent_runs(100).unwrap();
        assert!(runs.len() >= 2);
    }
}

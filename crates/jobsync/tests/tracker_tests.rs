//! Run lifecycle: finalization races, reaping and statistics.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use common::TestHarness;
use jobsync::error::TrackerError;
use jobsync::records::Outcome;
use jobsync::{ErrorCode, RunStatus};

const STUCK_TIMEOUT: Duration = Duration::from_secs(60 * 60);

fn backdate_start(h: &TestHarness, run_id: &str, minutes: i64) {
    let start = jobsync::db::timestamp(Utc::now() - chrono::Duration::minutes(minutes));
    h.execute(&format!(
        "UPDATE import_runs SET start_time = '{}' WHERE id = '{}'",
        start, run_id
    ));
}

#[test]
fn test_concurrent_finalize_happens_once() {
    let h = TestHarness::new();
    let run_id = h.tracker.create_run("jobicy_all", "https://jobicy.com/feed").unwrap();
    h.tracker.begin(&run_id, 8).unwrap();

    let tracker = Arc::new(h.tracker.clone());
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let tracker = Arc::clone(&tracker);
            let run_id = run_id.clone();
            thread::spawn(move || {
                let outcome = if i % 2 == 0 { Outcome::New } else { Outcome::Unchanged };
                tracker.record_outcome(&run_id, outcome, 5, None).unwrap();
                tracker.maybe_finalize(&run_id).unwrap()
            })
        })
        .collect();

    let closed: Vec<RunStatus> = handles
        .into_iter()
        .filter_map(|h| h.join().unwrap())
        .collect();
    assert_eq!(closed, vec![RunStatus::Completed]);

    let run = h.tracker.get_run(&run_id).unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.new_jobs, 4);
    assert_eq!(run.counters.skipped_jobs, 4);
    assert_eq!(run.processing.count, 8);
    assert_eq!(run.processing.min_ms, Some(5));
    assert_eq!(h.tracker.maybe_finalize(&run_id).unwrap(), None);
}

#[test]
fn test_reaper_only_fails_runs_past_timeout() {
    let h = TestHarness::new();
    let stale = h.tracker.create_run("jobicy_all", "https://jobicy.com/feed").unwrap();
    let fresh = h.tracker.create_run("higheredjobs", "https://h.example/rss").unwrap();
    h.tracker.begin(&stale, 10).unwrap();
    h.tracker.begin(&fresh, 10).unwrap();
    backdate_start(&h, &stale, 61);
    backdate_start(&h, &fresh, 59);

    let reaped = h.tracker.reap_stuck(STUCK_TIMEOUT).unwrap();
    assert_eq!(reaped, vec![stale.clone()]);

    let run = h.tracker.get_run(&stale).unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.end_time.is_some());
    assert_eq!(run.error_counts.get(&ErrorCode::Processing), Some(&1));
    let errors = h.tracker.list_errors(&stale).unwrap();
    assert!(errors[0].message.contains("60 minutes"));

    assert_eq!(h.tracker.get_run(&fresh).unwrap().status, RunStatus::InProgress);
    assert!(h.tracker.reap_stuck(STUCK_TIMEOUT).unwrap().is_empty());
}

#[test]
fn test_outcomes_after_reaping_do_not_reopen_run() {
    let h = TestHarness::new();
    let run_id = h.tracker.create_run("jobicy_all", "https://jobicy.com/feed").unwrap();
    h.tracker.begin(&run_id, 1).unwrap();
    backdate_start(&h, &run_id, 120);
    h.tracker.reap_stuck(STUCK_TIMEOUT).unwrap();

    h.tracker.record_outcome(&run_id, Outcome::New, 3, None).unwrap();
    assert_eq!(h.tracker.maybe_finalize(&run_id).unwrap(), None);

    let run = h.tracker.get_run(&run_id).unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.counters.new_jobs, 1);
}

#[test]
fn test_terminal_runs_reject_transitions() {
    let h = TestHarness::new();
    let run_id = h.tracker.create_run("jobicy_all", "https://jobicy.com/feed").unwrap();
    h.tracker.begin(&run_id, 0).unwrap();
    assert_eq!(
        h.tracker.maybe_finalize(&run_id).unwrap(),
        Some(RunStatus::Completed)
    );

    let err = h.tracker.transition(&run_id, RunStatus::InProgress).unwrap_err();
    assert!(matches!(
        err,
        TrackerError::InvalidTransition {
            from: RunStatus::Completed,
            to: RunStatus::InProgress
        }
    ));
}

#[test]
fn test_stats_aggregate_runs_in_window() {
    let h = TestHarness::new();

    let done = h.tracker.create_run("jobicy_all", "https://jobicy.com/feed").unwrap();
    h.tracker.begin(&done, 2).unwrap();
    h.tracker.record_outcome(&done, Outcome::New, 10, None).unwrap();
    h.tracker.record_outcome(&done, Outcome::Updated, 20, None).unwrap();
    h.tracker.maybe_finalize(&done).unwrap();

    let failed = h.tracker.create_run("higheredjobs", "https://h.example/rss").unwrap();
    h.tracker.begin(&failed, 1).unwrap();
    h.tracker.record_outcome(&failed, Outcome::Failed, 5, None).unwrap();
    h.tracker.maybe_finalize(&failed).unwrap();

    h.tracker.create_run("jobicy_all", "https://jobicy.com/feed").unwrap();

    let now = Utc::now();
    let stats = h
        .tracker
        .stats(now - chrono::Duration::hours(1), now + chrono::Duration::hours(1))
        .unwrap();
    assert_eq!(stats.total_runs, 3);
    assert_eq!(stats.by_status.get(&RunStatus::Completed), Some(&1));
    assert_eq!(stats.by_status.get(&RunStatus::Failed), Some(&1));
    assert_eq!(stats.by_status.get(&RunStatus::Pending), Some(&1));
    assert_eq!(stats.totals.new_jobs, 1);
    assert_eq!(stats.totals.updated_jobs, 1);
    assert_eq!(stats.totals.total_imported, 2);
    assert_eq!(stats.totals.failed_jobs, 1);

    let empty = h
        .tracker
        .stats(now - chrono::Duration::days(30), now - chrono::Duration::days(29))
        .unwrap();
    assert_eq!(empty.total_runs, 0);
    assert!(empty.by_status.is_empty());
}

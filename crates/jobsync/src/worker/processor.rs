//! Applying one claimed task to the job store.
//!
//! Every branch commits its queue transition and its run bookkeeping in a
//! single transaction: a success deletes the task, upserts the record and
//! counts the outcome; a failure reschedules or dead-letters the task and
//! logs the error. A redelivered task whose claim was voided changes nothing.
//! A task whose run row is gone still gets its queue transition.

use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rusqlite::Connection;
use serde::Serialize;

use crate::db::job_repo;
use crate::error::{QueueError, TrackerError, WorkerError};
use crate::feed::NormalizedItem;
use crate::queue::{ClaimedTask, FailDisposition, TaskQueue};
use crate::records::{validate_item, JobRecord, Outcome};
use crate::tracker::{
    maybe_finalize_in, record_outcome_in, record_warning_in, ErrorDetail, RunStatus, Severity,
};

/// What became of a task after one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum TaskOutcome {
    /// The item was applied to the store.
    Applied { outcome: Outcome },
    /// Failed; the queue will deliver it again after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// Failed for good and moved to the dead-letter set.
    DeadLettered,
    /// The claim was no longer valid; nothing was written.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub task_id: String,
    pub run_id: String,
    pub external_id: String,
    pub outcome: TaskOutcome,
    pub processing_ms: u64,
    /// Set when this task closed its run.
    pub run_finished: Option<RunStatus>,
}

/// Processes one claimed task end to end.
///
/// Returns `Err` only when the queue transition itself could not be
/// committed; the task is then still claimed and the caller should
/// [`release`](TaskQueue::release) it.
pub fn process_task(queue: &TaskQueue, task: &ClaimedTask) -> Result<TaskReport, WorkerError> {
    let started = Instant::now();
    debug!(
        "Processing task {} (item '{}', attempt {}/{})",
        task.id, task.item.external_id, task.attempt, task.max_attempts
    );

    let applied = catch_panic(|| {
        queue.ack_with(task, |conn| -> Result<_, WorkerError> {
            let outcome = upsert_item(conn, &task.item, &task.run_id, Utc::now())?;
            if task.replayed {
                return Ok((outcome, None));
            }
            let counted = record_outcome_in(conn, &task.run_id, outcome, elapsed_ms(started), None)
                .and_then(|_| maybe_finalize_in(conn, &task.run_id));
            let finished = match counted {
                Err(TrackerError::RunNotFound(run_id)) => {
                    warn!("Task {} belongs to unknown run {}", task.id, run_id);
                    None
                }
                other => other?,
            };
            Ok((outcome, finished))
        })
    });

    let (outcome, run_finished) = match applied {
        Ok((outcome, finished)) => (TaskOutcome::Applied { outcome }, finished),
        Err(WorkerError::Queue(QueueError::TaskNotFound(_))) => (TaskOutcome::Stale, None),
        Err(err) => fail_task(queue, task, &err, started)?,
    };

    if let Some(status) = run_finished {
        info!("Run {} finished: {}", task.run_id, status);
    }

    Ok(TaskReport {
        task_id: task.id.clone(),
        run_id: task.run_id.clone(),
        external_id: task.item.external_id.clone(),
        outcome,
        processing_ms: elapsed_ms(started),
        run_finished,
    })
}

fn fail_task(
    queue: &TaskQueue,
    task: &ClaimedTask,
    err: &WorkerError,
    started: Instant,
) -> Result<(TaskOutcome, Option<RunStatus>), WorkerError> {
    let detail = ErrorDetail::from_error(err)
        .with_item(task.item.external_id.clone())
        .with_attempt(task.attempt);
    let mut finished = None;

    let disposition = queue.fail_with(
        task,
        &err.to_string(),
        err.is_retryable(),
        |conn, disposition| -> Result<(), WorkerError> {
            if task.replayed {
                return Ok(());
            }
            let result = match disposition {
                FailDisposition::Retry { .. } => record_warning_in(
                    conn,
                    &task.run_id,
                    &detail.clone().with_severity(Severity::Warning),
                ),
                FailDisposition::DeadLettered => record_outcome_in(
                    conn,
                    &task.run_id,
                    Outcome::Failed,
                    elapsed_ms(started),
                    Some(&detail),
                )
                .and_then(|_| {
                    finished = maybe_finalize_in(conn, &task.run_id)?;
                    Ok(())
                }),
            };
            match result {
                // The queue transition still has to happen for orphaned tasks.
                Err(TrackerError::RunNotFound(run_id)) => {
                    warn!("Task {} belongs to unknown run {}", task.id, run_id);
                    Ok(())
                }
                other => other.map_err(WorkerError::from),
            }
        },
    );

    match disposition {
        Ok(FailDisposition::Retry { delay }) => {
            debug!(
                "Task {} failed on attempt {}: {} (retry in {:?})",
                task.id, task.attempt, err, delay
            );
            Ok((
                TaskOutcome::Retrying {
                    attempt: task.attempt,
                    delay,
                },
                None,
            ))
        }
        Ok(FailDisposition::DeadLettered) => Ok((TaskOutcome::DeadLettered, finished)),
        Err(WorkerError::Queue(QueueError::TaskNotFound(_))) => Ok((TaskOutcome::Stale, None)),
        Err(e) => Err(e),
    }
}

/// Inserts or updates the record for `item`, keyed by (source, external id).
///
/// A unique violation on insert means another writer got there first; the
/// row is re-read and the item applied as an update.
pub fn upsert_item(
    conn: &Connection,
    item: &NormalizedItem,
    run_id: &str,
    now: DateTime<Utc>,
) -> Result<Outcome, WorkerError> {
    validate_item(item)?;

    if let Some(mut existing) = job_repo::find_by_key(conn, &item.source, &item.external_id)? {
        return apply_to_existing(conn, &mut existing, item, run_id, now);
    }

    insert_new(conn, item, run_id, now)
}

/// Inserts a record for an item the lookup did not find.
fn insert_new(
    conn: &Connection,
    item: &NormalizedItem,
    run_id: &str,
    now: DateTime<Utc>,
) -> Result<Outcome, WorkerError> {
    let record = JobRecord::from_item(item, run_id, now);
    match job_repo::insert(conn, &record) {
        Ok(()) => Ok(Outcome::New),
        Err(e) if e.is_unique_violation() => {
            match job_repo::find_by_key(conn, &item.source, &item.external_id)? {
                Some(mut existing) => apply_to_existing(conn, &mut existing, item, run_id, now),
                None => Err(WorkerError::Duplicate {
                    source_name: item.source.clone(),
                    external_id: item.external_id.clone(),
                }),
            }
        }
        Err(e) => Err(e.into()),
    }
}

fn apply_to_existing(
    conn: &Connection,
    existing: &mut JobRecord,
    item: &NormalizedItem,
    run_id: &str,
    now: DateTime<Utc>,
) -> Result<Outcome, WorkerError> {
    if !existing.apply_item(item, run_id, now) {
        return Ok(Outcome::Unchanged);
    }
    job_repo::update(conn, existing)?;
    Ok(Outcome::Updated)
}

/// Runs `f`, turning a panic into a retryable processing error.
fn catch_panic<T, F>(f: F) -> Result<T, WorkerError>
where
    F: FnOnce() -> Result<T, WorkerError>,
{
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(WorkerError::Processing(format!("panicked: {}", message)))
    })
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

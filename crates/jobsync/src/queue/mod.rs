//! Durable task queue on top of the `tasks` table.
//!
//! Delivery is at-least-once. A task is claimed by [`TaskQueue::dequeue`],
//! then either acknowledged (deleted), rescheduled with exponential backoff,
//! or moved to the dead-letter set once its attempts are used up. Dead
//! letters are kept with their last error until replayed or cleared.

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db::task_repo::{self, TaskRow};
use crate::db::{parse_timestamp, timestamp, Database, DatabaseError};
use crate::error::QueueError;
use crate::feed::NormalizedItem;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(1000);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_millis(60_000);

/// Exponential backoff: attempt `n` waits `min(base * 2^(n-1), cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base
            .checked_mul(factor)
            .map_or(self.cap, |d| d.min(self.cap))
    }
}

/// Per-task retry settings, stored with the task at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Work to enqueue: one item and the run it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub run_id: String,
    pub source: String,
    pub item: NormalizedItem,
}

impl NewTask {
    pub fn new(run_id: impl Into<String>, source: impl Into<String>, item: NormalizedItem) -> Self {
        Self {
            run_id: run_id.into(),
            source: source.into(),
            item,
        }
    }
}

/// A task handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedTask {
    pub id: String,
    pub seq: i64,
    pub run_id: String,
    pub source: String,
    pub item: NormalizedItem,
    /// 1-based number of this delivery.
    pub attempt: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Requeued from the dead-letter set; its run already counted it.
    pub replayed: bool,
    pub last_error: Option<String>,
}

impl ClaimedTask {
    fn from_row(row: TaskRow) -> Result<Self, QueueError> {
        let item = serde_json::from_str(&row.payload).map_err(|source| QueueError::Decode {
            task_id: row.id.clone(),
            source,
        })?;
        Ok(Self {
            id: row.id,
            seq: row.seq,
            run_id: row.run_id,
            source: row.source,
            item,
            attempt: row.attempts,
            max_attempts: row.max_attempts,
            backoff: BackoffPolicy::new(
                Duration::from_millis(row.backoff_base_ms),
                Duration::from_millis(row.backoff_cap_ms),
            ),
            replayed: row.replayed,
            last_error: row.last_error,
        })
    }

    pub fn attempts_left(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt)
    }
}

/// What [`TaskQueue::fail`] did with a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// Rescheduled; becomes ready again after `delay`.
    Retry { delay: Duration },
    /// Moved to the dead-letter set.
    DeadLettered,
}

impl FailDisposition {
    /// Decides the fate of a failed delivery.
    pub fn decide(task: &ClaimedTask, retryable: bool) -> Self {
        if retryable && task.attempt < task.max_attempts {
            FailDisposition::Retry {
                delay: task.backoff.delay_for(task.attempt),
            }
        } else {
            FailDisposition::DeadLettered
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FailDisposition::DeadLettered)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDepth {
    /// Queued and available now.
    pub ready: u64,
    /// Queued, waiting out a backoff delay.
    pub delayed: u64,
    pub running: u64,
    pub dead: u64,
}

impl QueueDepth {
    /// Tasks that still need a worker.
    pub fn pending(&self) -> u64 {
        self.ready + self.delayed + self.running
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub id: String,
    pub run_id: String,
    pub source: String,
    pub external_id: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    fn from_row(row: TaskRow) -> Result<Self, QueueError> {
        let external_id = serde_json::from_str::<NormalizedItem>(&row.payload)
            .ok()
            .map(|item| item.external_id);
        Ok(Self {
            id: row.id,
            run_id: row.run_id,
            source: row.source,
            external_id,
            attempts: row.attempts,
            last_error: row.last_error,
            failed_at: parse_timestamp(&row.updated_at)?,
        })
    }
}

/// Handle to the durable queue. Cheap to clone.
#[derive(Clone)]
pub struct TaskQueue {
    db: Database,
    policy: RetryPolicy,
}

impl TaskQueue {
    pub fn new(db: Database) -> Self {
        Self::with_policy(db, RetryPolicy::default())
    }

    pub fn with_policy(db: Database, policy: RetryPolicy) -> Self {
        Self { db, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Enqueues one task with the queue's default retry policy.
    pub fn enqueue(&self, task: &NewTask) -> Result<String, QueueError> {
        self.enqueue_with(task, self.policy)
    }

    /// Enqueues one task with an explicit retry policy.
    pub fn enqueue_with(&self, task: &NewTask, policy: RetryPolicy) -> Result<String, QueueError> {
        let row = new_row(task, policy, Utc::now())?;
        self.db.with_conn(|conn| task_repo::insert(conn, &row))?;
        debug!("Enqueued task {} for run {}", row.id, row.run_id);
        Ok(row.id)
    }

    /// Enqueues all tasks in one transaction. Either every task is stored or
    /// none is.
    pub fn enqueue_batch(&self, tasks: &[NewTask]) -> Result<Vec<String>, QueueError> {
        let now = Utc::now();
        let rows = tasks
            .iter()
            .map(|t| new_row(t, self.policy, now))
            .collect::<Result<Vec<_>, _>>()?;

        self.db.transaction(|conn| -> Result<(), QueueError> {
            for row in &rows {
                task_repo::insert(conn, row)?;
            }
            Ok(())
        })?;

        debug!("Enqueued batch of {} task(s)", rows.len());
        Ok(rows.into_iter().map(|r| r.id).collect())
    }

    /// Claims the oldest ready task for `worker_id`.
    ///
    /// A task whose payload no longer decodes is dead-lettered on the spot
    /// and the next one is tried.
    pub fn dequeue(&self, worker_id: &str) -> Result<Option<ClaimedTask>, QueueError> {
        loop {
            let row = self
                .db
                .transaction(|conn| task_repo::claim_next(conn, worker_id, Utc::now()))?;
            let Some(row) = row else {
                return Ok(None);
            };

            let (id, attempt) = (row.id.clone(), row.attempts);
            match ClaimedTask::from_row(row) {
                Ok(task) => return Ok(Some(task)),
                Err(e) => {
                    warn!("Dead-lettering undecodable task {}: {}", id, e);
                    let message = e.to_string();
                    self.db.with_conn(|conn| {
                        task_repo::mark_dead(conn, &id, attempt, &message, Utc::now())
                    })?;
                }
            }
        }
    }

    /// Acknowledges a finished task (deletes it).
    pub fn ack(&self, task: &ClaimedTask) -> Result<(), QueueError> {
        self.ack_with(task, |_| Ok::<_, QueueError>(()))
    }

    /// Runs `f` and acknowledges the task in one transaction.
    ///
    /// If the task is no longer claimed, `f` is not run and the call fails
    /// with `TaskNotFound`, so a redelivered task cannot be counted twice.
    pub fn ack_with<T, E, F>(&self, task: &ClaimedTask, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<QueueError> + From<DatabaseError>,
    {
        self.db.transaction(|conn| {
            if task_repo::delete_running(conn, &task.id, task.attempt)? == 0 {
                return Err(QueueError::TaskNotFound(task.id.clone()).into());
            }
            f(conn)
        })
    }

    /// Records a failed delivery: reschedules it with backoff if it is
    /// retryable and has attempts left, dead-letters it otherwise.
    pub fn fail(
        &self,
        task: &ClaimedTask,
        error: &str,
        retryable: bool,
    ) -> Result<FailDisposition, QueueError> {
        self.fail_with(task, error, retryable, |_, _| Ok::<_, QueueError>(()))
    }

    /// Like [`fail`](Self::fail), running `f` with the chosen disposition in
    /// the same transaction.
    pub fn fail_with<E, F>(
        &self,
        task: &ClaimedTask,
        error: &str,
        retryable: bool,
        f: F,
    ) -> Result<FailDisposition, E>
    where
        F: FnOnce(&Connection, FailDisposition) -> Result<(), E>,
        E: From<QueueError> + From<DatabaseError>,
    {
        let disposition = FailDisposition::decide(task, retryable);
        let now = Utc::now();

        self.db.transaction(|conn| {
            let changed = match disposition {
                FailDisposition::Retry { delay } => {
                    let available_at = now
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::days(1));
                    task_repo::reschedule(conn, &task.id, task.attempt, available_at, error, now)?
                }
                FailDisposition::DeadLettered => {
                    task_repo::mark_dead(conn, &task.id, task.attempt, error, now)?
                }
            };
            if changed == 0 {
                return Err(QueueError::TaskNotFound(task.id.clone()).into());
            }
            f(conn, disposition)
        })?;

        match disposition {
            FailDisposition::Retry { delay } => debug!(
                "Task {} attempt {}/{} failed, retrying in {:?}",
                task.id, task.attempt, task.max_attempts, delay
            ),
            FailDisposition::DeadLettered => warn!(
                "Task {} dead-lettered after {} attempt(s): {}",
                task.id, task.attempt, error
            ),
        }
        Ok(disposition)
    }

    /// Requeues tasks left running by a previous process.
    pub fn recover_in_flight(&self) -> Result<usize, QueueError> {
        let count = self
            .db
            .with_conn(|conn| task_repo::requeue_running(conn, Utc::now()))?;
        if count > 0 {
            info!("Recovered {} in-flight task(s)", count);
        }
        Ok(count)
    }

    /// Requeues tasks whose claim is older than `lease`. A worker that lost
    /// track of its task, or died with it, no longer holds it forever.
    pub fn requeue_expired(&self, lease: Duration) -> Result<usize, QueueError> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(1));
        let cutoff = now - lease;
        let count = self
            .db
            .with_conn(|conn| task_repo::requeue_expired(conn, cutoff, now))?;
        if count > 0 {
            warn!("Requeued {} task(s) with an expired claim", count);
        }
        Ok(count)
    }

    /// Hands a claimed task back to the queue without settling it, e.g. when
    /// its outcome could not be committed. The spent attempt stays counted.
    pub fn release(&self, task: &ClaimedTask, error: &str) -> Result<(), QueueError> {
        let now = Utc::now();
        let changed = self.db.with_conn(|conn| {
            task_repo::reschedule(conn, &task.id, task.attempt, now, error, now)
        })?;
        if changed == 0 {
            return Err(QueueError::TaskNotFound(task.id.clone()));
        }
        debug!("Released task {} back to the queue", task.id);
        Ok(())
    }

    pub fn depth(&self) -> Result<QueueDepth, QueueError> {
        let counts = self
            .db
            .with_conn(|conn| task_repo::state_counts(conn, Utc::now()))?;
        Ok(QueueDepth {
            ready: counts.ready,
            delayed: counts.delayed,
            running: counts.running,
            dead: counts.dead,
        })
    }

    pub fn dead_letters(&self, limit: u32) -> Result<Vec<DeadLetter>, QueueError> {
        let rows = self.db.with_conn(|conn| task_repo::list_dead(conn, limit))?;
        rows.into_iter().map(DeadLetter::from_row).collect()
    }

    /// Puts a dead letter back in the queue with a fresh attempt budget.
    pub fn replay_dead_letter(&self, task_id: &str) -> Result<(), QueueError> {
        let changed = self
            .db
            .with_conn(|conn| task_repo::revive(conn, task_id, Utc::now()))?;
        if changed == 0 {
            return Err(QueueError::TaskNotFound(task_id.to_string()));
        }
        info!("Replaying dead letter {}", task_id);
        Ok(())
    }

    /// Drops every task, dead letters included.
    pub fn clear(&self) -> Result<usize, QueueError> {
        let count = self.db.with_conn(task_repo::clear)?;
        info!("Cleared {} task(s) from the queue", count);
        Ok(count)
    }
}

fn new_row(task: &NewTask, policy: RetryPolicy, now: DateTime<Utc>) -> Result<TaskRow, QueueError> {
    let payload = serde_json::to_string(&task.item).map_err(QueueError::Encode)?;
    let stamp = timestamp(now);
    Ok(TaskRow {
        seq: 0,
        id: uuid::Uuid::new_v4().to_string(),
        run_id: task.run_id.clone(),
        source: task.source.clone(),
        payload,
        state: "queued".to_string(),
        attempts: 0,
        max_attempts: policy.max_attempts.max(1),
        backoff_base_ms: policy.backoff.base.as_millis() as u64,
        backoff_cap_ms: policy.backoff.cap.as_millis() as u64,
        available_at: stamp.clone(),
        locked_by: None,
        locked_at: None,
        replayed: false,
        last_error: None,
        created_at: stamp.clone(),
        updated_at: stamp,
    })
}

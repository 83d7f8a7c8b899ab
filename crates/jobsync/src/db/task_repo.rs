//! Task repository: the `tasks` table backing the durable queue.
//!
//! States: `queued` (ready or delayed by `available_at`), `running`
//! (claimed by a worker), `dead` (retries exhausted, kept for inspection).
//! Acknowledged tasks are deleted.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{timestamp, DatabaseError};

/// A raw `tasks` row.
#[derive(Debug, Clone)]
pub struct TaskRow {
    pub seq: i64,
    pub id: String,
    pub run_id: String,
    pub source: String,
    pub payload: String,
    pub state: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub available_at: String,
    pub locked_by: Option<String>,
    /// When the current claim was taken.
    pub locked_at: Option<String>,
    pub replayed: bool,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            seq: row.get("seq")?,
            id: row.get("id")?,
            run_id: row.get("run_id")?,
            source: row.get("source")?,
            payload: row.get("payload")?,
            state: row.get("state")?,
            attempts: row.get("attempts")?,
            max_attempts: row.get("max_attempts")?,
            backoff_base_ms: row.get("backoff_base_ms")?,
            backoff_cap_ms: row.get("backoff_cap_ms")?,
            available_at: row.get("available_at")?,
            locked_by: row.get("locked_by")?,
            locked_at: row.get("locked_at")?,
            replayed: row.get("replayed")?,
            last_error: row.get("last_error")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Counts per state. `queued` rows are split by availability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub ready: u64,
    pub delayed: u64,
    pub running: u64,
    pub dead: u64,
}

/// Inserts a queued task. `seq` is assigned by SQLite.
pub fn insert(conn: &Connection, task: &TaskRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO tasks (id, run_id, source, payload, state, attempts, max_attempts,
         backoff_base_ms, backoff_cap_ms, available_at, replayed, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'queued', 0, ?5, ?6, ?7, ?8, 0, ?9, ?9)",
        params![
            task.id,
            task.run_id,
            task.source,
            task.payload,
            task.max_attempts,
            task.backoff_base_ms as i64,
            task.backoff_cap_ms as i64,
            task.available_at,
            task.created_at,
        ],
    )?;
    Ok(())
}

/// Claims the oldest ready task: marks it running, records the worker and
/// increments its attempt counter. Call inside a transaction.
pub fn claim_next(
    conn: &Connection,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<TaskRow>, DatabaseError> {
    let stamp = timestamp(now);
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM tasks WHERE state = 'queued' AND available_at <= ?1
             ORDER BY seq LIMIT 1",
            params![stamp],
            |r| r.get(0),
        )
        .optional()?;

    let Some(id) = id else {
        return Ok(None);
    };

    let changed = conn.execute(
        "UPDATE tasks SET state = 'running', attempts = attempts + 1, locked_by = ?2,
         locked_at = ?3, updated_at = ?3
         WHERE id = ?1 AND state = 'queued'",
        params![id, worker_id, stamp],
    )?;
    if changed == 0 {
        return Ok(None);
    }

    find(conn, &id)
}

pub fn find(conn: &Connection, id: &str) -> Result<Option<TaskRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM tasks WHERE id = ?1",
            params![id],
            TaskRow::from_row,
        )
        .optional()?)
}

/// Deletes a running task. Returns rows changed (0 when the claim made on
/// `attempt` is no longer current, e.g. after recovery handed the task to
/// someone else).
pub fn delete_running(conn: &Connection, id: &str, attempt: u32) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "DELETE FROM tasks WHERE id = ?1 AND state = 'running' AND attempts = ?2",
        params![id, attempt],
    )?)
}

/// Puts a running task back in the queue, not before `available_at`.
pub fn reschedule(
    conn: &Connection,
    id: &str,
    attempt: u32,
    available_at: DateTime<Utc>,
    error: &str,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "UPDATE tasks SET state = 'queued', available_at = ?2, last_error = ?3,
         locked_by = NULL, locked_at = NULL, updated_at = ?4
         WHERE id = ?1 AND state = 'running' AND attempts = ?5",
        params![id, timestamp(available_at), error, timestamp(now), attempt],
    )?)
}

/// Moves a running task to the dead-letter set with its last error.
pub fn mark_dead(
    conn: &Connection,
    id: &str,
    attempt: u32,
    error: &str,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "UPDATE tasks SET state = 'dead', last_error = ?2, locked_by = NULL, locked_at = NULL,
         updated_at = ?3
         WHERE id = ?1 AND state = 'running' AND attempts = ?4",
        params![id, error, timestamp(now), attempt],
    )?)
}

/// Returns every running task to the queue. Used at startup, when nothing
/// can legitimately be running.
pub fn requeue_running(conn: &Connection, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
    let stamp = timestamp(now);
    Ok(conn.execute(
        "UPDATE tasks SET state = 'queued', locked_by = NULL, locked_at = NULL,
         available_at = ?1, updated_at = ?1
         WHERE state = 'running'",
        params![stamp],
    )?)
}

/// Returns running tasks claimed before `claimed_before` to the queue.
/// The attempt already spent on the lost claim stays counted.
pub fn requeue_expired(
    conn: &Connection,
    claimed_before: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let stamp = timestamp(now);
    Ok(conn.execute(
        "UPDATE tasks SET state = 'queued', locked_by = NULL, locked_at = NULL,
         available_at = ?2, updated_at = ?2
         WHERE state = 'running' AND (locked_at IS NULL OR locked_at < ?1)",
        params![timestamp(claimed_before), stamp],
    )?)
}

pub fn state_counts(conn: &Connection, now: DateTime<Utc>) -> Result<StateCounts, DatabaseError> {
    Ok(conn.query_row(
        "SELECT
            COALESCE(SUM(state = 'queued' AND available_at <= ?1), 0),
            COALESCE(SUM(state = 'queued' AND available_at > ?1), 0),
            COALESCE(SUM(state = 'running'), 0),
            COALESCE(SUM(state = 'dead'), 0)
         FROM tasks",
        params![timestamp(now)],
        |r| {
            Ok(StateCounts {
                ready: r.get(0)?,
                delayed: r.get(1)?,
                running: r.get(2)?,
                dead: r.get(3)?,
            })
        },
    )?)
}

/// Dead tasks, most recently failed first.
pub fn list_dead(conn: &Connection, limit: u32) -> Result<Vec<TaskRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM tasks WHERE state = 'dead' ORDER BY updated_at DESC, seq DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit], TaskRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Requeues a dead task with a fresh attempt budget and marks it replayed.
pub fn revive(conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
    let stamp = timestamp(now);
    Ok(conn.execute(
        "UPDATE tasks SET state = 'queued', attempts = 0, replayed = 1, available_at = ?2,
         updated_at = ?2
         WHERE id = ?1 AND state = 'dead'",
        params![id, stamp],
    )?)
}

/// Deletes every task, including dead letters.
pub fn clear(conn: &Connection) -> Result<usize, DatabaseError> {
    Ok(conn.execute("DELETE FROM tasks", [])?)
}

//! Import run repository: `import_runs`, `run_errors`, `run_error_counts`.
//!
//! Every counter change is a single `UPDATE ... SET x = x + ?` statement and
//! every status change is guarded by the status it expects to replace, so
//! callers never read-modify-write run state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{parse_timestamp, timestamp, DatabaseError};
use crate::tracker::classify::{ErrorCode, Severity};
use crate::tracker::{
    ErrorDetail, ImportRun, ProcessingStats, RunCounters, RunErrorEntry, RunStats, RunStatus,
};

/// Counter deltas for one outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub new_jobs: i64,
    pub updated_jobs: i64,
    pub skipped_jobs: i64,
    pub failed_jobs: i64,
}

impl CounterDelta {
    fn imported(&self) -> i64 {
        self.new_jobs + self.updated_jobs
    }
}

fn status_from_row(value: String) -> Result<RunStatus, DatabaseError> {
    RunStatus::from_stored(&value)
        .ok_or_else(|| DatabaseError::InvalidData(format!("unknown run status '{}'", value)))
}

fn optional_time(value: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    value.as_deref().map(parse_timestamp).transpose()
}

/// A raw `import_runs` row.
struct RunRow {
    id: String,
    source: String,
    source_url: String,
    status: String,
    start_time: Option<String>,
    end_time: Option<String>,
    duration_ms: Option<i64>,
    counters: RunCounters,
    proc_count: u64,
    proc_total_ms: u64,
    proc_min_ms: Option<u64>,
    proc_max_ms: Option<u64>,
    created_at: String,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            source: row.get("source")?,
            source_url: row.get("source_url")?,
            status: row.get("status")?,
            start_time: row.get("start_time")?,
            end_time: row.get("end_time")?,
            duration_ms: row.get("duration_ms")?,
            counters: RunCounters {
                total_fetched: row.get("total_fetched")?,
                total_imported: row.get("total_imported")?,
                new_jobs: row.get("new_jobs")?,
                updated_jobs: row.get("updated_jobs")?,
                failed_jobs: row.get("failed_jobs")?,
                skipped_jobs: row.get("skipped_jobs")?,
            },
            proc_count: row.get("proc_count")?,
            proc_total_ms: row.get("proc_total_ms")?,
            proc_min_ms: row.get("proc_min_ms")?,
            proc_max_ms: row.get("proc_max_ms")?,
            created_at: row.get("created_at")?,
        })
    }

    fn into_run(self) -> Result<ImportRun, DatabaseError> {
        Ok(ImportRun {
            id: self.id,
            source: self.source,
            source_url: self.source_url,
            status: status_from_row(self.status)?,
            start_time: optional_time(self.start_time)?,
            end_time: optional_time(self.end_time)?,
            duration_ms: self.duration_ms,
            counters: self.counters,
            processing: ProcessingStats::new(
                self.proc_count,
                self.proc_total_ms,
                self.proc_min_ms,
                self.proc_max_ms,
            ),
            error_counts: BTreeMap::new(),
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

/// Inserts a fresh pending run.
pub fn insert(conn: &Connection, run: &ImportRun) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO import_runs (id, source, source_url, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            run.id,
            run.source,
            run.source_url,
            run.status.as_str(),
            timestamp(run.created_at),
        ],
    )?;
    Ok(())
}

/// Loads a run with its error histogram. Error entries are loaded separately.
pub fn find(conn: &Connection, id: &str) -> Result<Option<ImportRun>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM import_runs WHERE id = ?1",
            params![id],
            RunRow::from_row,
        )
        .optional()?;

    let Some(row) = row else {
        return Ok(None);
    };
    let mut run = row.into_run()?;
    run.error_counts = error_counts(conn, id)?;
    Ok(Some(run))
}

/// Current status only.
pub fn status(conn: &Connection, id: &str) -> Result<Option<RunStatus>, DatabaseError> {
    let value: Option<String> = conn
        .query_row(
            "SELECT status FROM import_runs WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )
        .optional()?;
    value.map(status_from_row).transpose()
}

/// pending → in_progress. Returns the number of rows changed (0 or 1).
pub fn begin(
    conn: &Connection,
    id: &str,
    total_fetched: u64,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "UPDATE import_runs SET status = 'in_progress', start_time = ?2, total_fetched = ?3
         WHERE id = ?1 AND status = 'pending'",
        params![id, timestamp(now), total_fetched as i64],
    )?)
}

/// Guarded status change from `from` to `to`. Terminal targets also stamp
/// end time and duration.
pub fn transition(
    conn: &Connection,
    id: &str,
    from: RunStatus,
    to: RunStatus,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let stamp = timestamp(now);
    let changed = if to.is_terminal() {
        conn.execute(
            "UPDATE import_runs SET status = ?3, end_time = ?4,
             duration_ms = CASE WHEN start_time IS NULL THEN NULL
                 ELSE CAST(ROUND((julianday(?4) - julianday(start_time)) * 86400000.0) AS INTEGER)
             END
             WHERE id = ?1 AND status = ?2",
            params![id, from.as_str(), to.as_str(), stamp],
        )?
    } else if to == RunStatus::InProgress {
        conn.execute(
            "UPDATE import_runs SET status = ?3, start_time = ?4 WHERE id = ?1 AND status = ?2",
            params![id, from.as_str(), to.as_str(), stamp],
        )?
    } else {
        conn.execute(
            "UPDATE import_runs SET status = ?3 WHERE id = ?1 AND status = ?2",
            params![id, from.as_str(), to.as_str()],
        )?
    };
    Ok(changed)
}

/// Folds one outcome into the run counters and latency stats.
pub fn apply_outcome(
    conn: &Connection,
    id: &str,
    delta: CounterDelta,
    processing_ms: u64,
) -> Result<usize, DatabaseError> {
    let ms = processing_ms as i64;
    Ok(conn.execute(
        "UPDATE import_runs SET
            new_jobs = new_jobs + ?2,
            updated_jobs = updated_jobs + ?3,
            skipped_jobs = skipped_jobs + ?4,
            failed_jobs = failed_jobs + ?5,
            total_imported = total_imported + ?6,
            proc_count = proc_count + 1,
            proc_total_ms = proc_total_ms + ?7,
            proc_min_ms = MIN(COALESCE(proc_min_ms, ?7), ?7),
            proc_max_ms = MAX(COALESCE(proc_max_ms, ?7), ?7)
         WHERE id = ?1",
        params![
            id,
            delta.new_jobs,
            delta.updated_jobs,
            delta.skipped_jobs,
            delta.failed_jobs,
            delta.imported(),
            ms,
        ],
    )?)
}

/// Appends an entry to the run's error log.
pub fn append_error(
    conn: &Connection,
    id: &str,
    detail: &ErrorDetail,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO run_errors (run_id, code, severity, message, external_id, attempt, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            id,
            detail.code.as_str(),
            detail.severity.as_str(),
            detail.message,
            detail.external_id,
            detail.attempt,
            timestamp(now),
        ],
    )?;
    Ok(())
}

/// Increments the histogram bucket for `code`.
pub fn bump_error_count(conn: &Connection, id: &str, code: ErrorCode) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO run_error_counts (run_id, code, count) VALUES (?1, ?2, 1)
         ON CONFLICT(run_id, code) DO UPDATE SET count = count + 1",
        params![id, code.as_str()],
    )?;
    Ok(())
}

/// Closes an in-progress run whose processed tally has reached
/// `total_fetched`. The final status is derived from the counters inside the
/// statement. Returns the number of rows changed (0 or 1).
pub fn finalize(conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "UPDATE import_runs SET
            status = CASE
                WHEN total_fetched > 0 AND failed_jobs >= total_fetched THEN 'failed'
                WHEN failed_jobs > 0 THEN 'partially_completed'
                ELSE 'completed'
            END,
            end_time = ?2,
            duration_ms = CASE WHEN start_time IS NULL THEN NULL
                ELSE CAST(ROUND((julianday(?2) - julianday(start_time)) * 86400000.0) AS INTEGER)
            END
         WHERE id = ?1
           AND status = 'in_progress'
           AND total_imported + skipped_jobs + failed_jobs >= total_fetched",
        params![id, timestamp(now)],
    )?)
}

/// Ids of in-progress runs started before `cutoff`.
pub fn stuck_runs(conn: &Connection, cutoff: DateTime<Utc>) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id FROM import_runs
         WHERE status = 'in_progress' AND start_time < ?1
         ORDER BY start_time",
    )?;
    let ids = stmt
        .query_map(params![timestamp(cutoff)], |r| r.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Fails a run only if it is still in progress and still older than
/// `cutoff`. Returns the number of rows changed (0 or 1).
pub fn fail_stuck(
    conn: &Connection,
    id: &str,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    Ok(conn.execute(
        "UPDATE import_runs SET status = 'failed', end_time = ?3,
            duration_ms = CAST(ROUND((julianday(?3) - julianday(start_time)) * 86400000.0) AS INTEGER)
         WHERE id = ?1 AND status = 'in_progress' AND start_time < ?2",
        params![id, timestamp(cutoff), timestamp(now)],
    )?)
}

/// Error log entries in insertion order.
pub fn list_errors(conn: &Connection, id: &str) -> Result<Vec<RunErrorEntry>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT seq, code, severity, message, external_id, attempt, created_at
         FROM run_errors WHERE run_id = ?1 ORDER BY seq",
    )?;
    let rows = stmt
        .query_map(params![id], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, Option<String>>(4)?,
                r.get::<_, Option<u32>>(5)?,
                r.get::<_, String>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(seq, code, severity, message, external_id, attempt, created_at)| {
            Ok(RunErrorEntry {
                seq,
                code: ErrorCode::from_stored(&code),
                severity: Severity::from_stored(&severity),
                message,
                external_id,
                attempt,
                created_at: parse_timestamp(&created_at)?,
            })
        })
        .collect()
}

/// Error histogram for one run.
pub fn error_counts(
    conn: &Connection,
    id: &str,
) -> Result<BTreeMap<ErrorCode, u64>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT code, count FROM run_error_counts WHERE run_id = ?1")?;
    let rows = stmt
        .query_map(params![id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, u64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut counts = BTreeMap::new();
    for (code, count) in rows {
        *counts.entry(ErrorCode::from_stored(&code)).or_insert(0) += count;
    }
    Ok(counts)
}

/// Most recently created runs, newest first.
pub fn recent(conn: &Connection, limit: u32) -> Result<Vec<ImportRun>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT * FROM import_runs ORDER BY created_at DESC, rowid DESC LIMIT ?1")?;
    let rows = stmt
        .query_map(params![limit], RunRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|row| {
            let mut run = row.into_run()?;
            run.error_counts = error_counts(conn, &run.id)?;
            Ok(run)
        })
        .collect()
}

/// Aggregates runs created in `[from, to]`.
pub fn stats(
    conn: &Connection,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<RunStats, DatabaseError> {
    let (from, to) = (timestamp(from), timestamp(to));

    let mut totals = conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(total_fetched), 0), COALESCE(SUM(total_imported), 0),
                COALESCE(SUM(new_jobs), 0), COALESCE(SUM(updated_jobs), 0),
                COALESCE(SUM(failed_jobs), 0), COALESCE(SUM(skipped_jobs), 0),
                AVG(duration_ms)
         FROM import_runs WHERE created_at >= ?1 AND created_at <= ?2",
        params![from, to],
        |r| {
            Ok(RunStats {
                total_runs: r.get(0)?,
                by_status: BTreeMap::new(),
                totals: RunCounters {
                    total_fetched: r.get(1)?,
                    total_imported: r.get(2)?,
                    new_jobs: r.get(3)?,
                    updated_jobs: r.get(4)?,
                    failed_jobs: r.get(5)?,
                    skipped_jobs: r.get(6)?,
                },
                avg_duration_ms: r.get(7)?,
            })
        },
    )?;

    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*) FROM import_runs
         WHERE created_at >= ?1 AND created_at <= ?2 GROUP BY status",
    )?;
    let rows = stmt
        .query_map(params![from, to], |r| Ok((r.get::<_, String>(0)?, r.get::<_, u64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    for (status, count) in rows {
        totals.by_status.insert(status_from_row(status)?, count);
    }

    Ok(totals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn pending(id: &str, created_at: DateTime<Utc>) -> ImportRun {
        ImportRun::pending(id.to_string(), "jobicy_all", "https://jobicy.com/feed", created_at)
    }

    #[test]
    fn test_insert_begin_and_find() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        db.with_conn(|conn| {
            insert(conn, &pending("r1", now))?;
            assert_eq!(status(conn, "r1")?, Some(RunStatus::Pending));
            assert_eq!(begin(conn, "r1", 5, now)?, 1);
            // Second begin is rejected by the status guard.
            assert_eq!(begin(conn, "r1", 9, now)?, 0);

            let run = find(conn, "r1")?.unwrap();
            assert_eq!(run.status, RunStatus::InProgress);
            assert_eq!(run.counters.total_fetched, 5);
            assert!(run.start_time.is_some());
            assert!(find(conn, "missing")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_apply_outcome_tracks_latency() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        db.with_conn(|conn| {
            insert(conn, &pending("r1", now))?;
            begin(conn, "r1", 3, now)?;
            let new = CounterDelta {
                new_jobs: 1,
                ..Default::default()
            };
            let failed = CounterDelta {
                failed_jobs: 1,
                ..Default::default()
            };
            apply_outcome(conn, "r1", new, 40)?;
            apply_outcome(conn, "r1", new, 10)?;
            apply_outcome(conn, "r1", failed, 70)?;

            let run = find(conn, "r1")?.unwrap();
            assert_eq!(run.counters.new_jobs, 2);
            assert_eq!(run.counters.total_imported, 2);
            assert_eq!(run.counters.failed_jobs, 1);
            assert_eq!(run.processing.count, 3);
            assert_eq!(run.processing.min_ms, Some(10));
            assert_eq!(run.processing.max_ms, Some(70));
            assert_eq!(run.processing.avg_ms, Some(40.0));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_finalize_requires_full_tally_and_happens_once() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        db.with_conn(|conn| {
            insert(conn, &pending("r1", now))?;
            begin(conn, "r1", 2, now)?;
            let skipped = CounterDelta {
                skipped_jobs: 1,
                ..Default::default()
            };
            apply_outcome(conn, "r1", skipped, 1)?;
            assert_eq!(finalize(conn, "r1", now)?, 0);

            apply_outcome(
                conn,
                "r1",
                CounterDelta {
                    failed_jobs: 1,
                    ..Default::default()
                },
                1,
            )?;
            assert_eq!(finalize(conn, "r1", now)?, 1);
            assert_eq!(finalize(conn, "r1", now)?, 0);
            assert_eq!(status(conn, "r1")?, Some(RunStatus::PartiallyCompleted));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_histogram_and_error_log() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        db.with_conn(|conn| {
            insert(conn, &pending("r1", now))?;
            let detail = ErrorDetail::new(ErrorCode::Validation, "missing title")
                .with_item("ext-1")
                .with_attempt(1);
            append_error(conn, "r1", &detail, now)?;
            bump_error_count(conn, "r1", ErrorCode::Validation)?;
            bump_error_count(conn, "r1", ErrorCode::Validation)?;
            bump_error_count(conn, "r1", ErrorCode::Database)?;

            let errors = list_errors(conn, "r1")?;
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].external_id.as_deref(), Some("ext-1"));
            assert_eq!(errors[0].attempt, Some(1));
            assert_eq!(errors[0].severity, Severity::Warning);

            let counts = error_counts(conn, "r1")?;
            assert_eq!(counts[&ErrorCode::Validation], 2);
            assert_eq!(counts[&ErrorCode::Database], 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_stats_groups_by_status() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        db.with_conn(|conn| {
            insert(conn, &pending("r1", now))?;
            insert(conn, &pending("r2", now))?;
            insert(conn, &pending("old", now - chrono::Duration::days(30)))?;
            begin(conn, "r1", 0, now)?;
            finalize(conn, "r1", now)?;

            let stats = stats(conn, now - chrono::Duration::days(1), now)?;
            assert_eq!(stats.total_runs, 2);
            assert_eq!(stats.by_status[&RunStatus::Completed], 1);
            assert_eq!(stats.by_status[&RunStatus::Pending], 1);

            let recent = recent(conn, 2)?;
            assert_eq!(recent.len(), 2);
            assert!(recent.iter().all(|r| r.id != "old"));
            Ok(())
        })
        .unwrap();
    }
}

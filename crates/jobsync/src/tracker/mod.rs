//! Import run tracking.
//!
//! A run is created per source fetch and moves through
//! `pending → in_progress → {completed, partially_completed, failed}`.
//! Workers fold one outcome per task into the run; whichever worker sees the
//! tally reach `total_fetched` finalizes it, and the guarded UPDATE in
//! [`run_repo::finalize`] makes that happen exactly once.

pub mod classify;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::db::run_repo::{self, CounterDelta};
use crate::db::Database;
use crate::error::TrackerError;
use crate::records::Outcome;

pub use classify::{Classify, ErrorCode, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    InProgress,
    Completed,
    PartiallyCompleted,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::PartiallyCompleted => "partially_completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn from_stored(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RunStatus::Pending),
            "in_progress" => Some(RunStatus::InProgress),
            "completed" => Some(RunStatus::Completed),
            "partially_completed" => Some(RunStatus::PartiallyCompleted),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    /// States reachable in one step.
    pub fn allowed_transitions(&self) -> &'static [RunStatus] {
        match self {
            RunStatus::Pending => &[RunStatus::InProgress],
            RunStatus::InProgress => &[
                RunStatus::Completed,
                RunStatus::PartiallyCompleted,
                RunStatus::Failed,
            ],
            RunStatus::Completed | RunStatus::PartiallyCompleted | RunStatus::Failed => &[],
        }
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_transitions().is_empty()
    }

    pub fn description(&self) -> &'static str {
        match self {
            RunStatus::Pending => "Import run is queued and waiting to start",
            RunStatus::InProgress => "Import run is currently processing items",
            RunStatus::Completed => "Import run completed successfully",
            RunStatus::PartiallyCompleted => "Import run completed with some failed items",
            RunStatus::Failed => "Import run failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCounters {
    pub total_fetched: u64,
    pub total_imported: u64,
    pub new_jobs: u64,
    pub updated_jobs: u64,
    pub failed_jobs: u64,
    pub skipped_jobs: u64,
}

impl RunCounters {
    /// Items with a recorded outcome.
    pub fn processed(&self) -> u64 {
        self.total_imported + self.skipped_jobs + self.failed_jobs
    }
}

/// Per-item processing latency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStats {
    pub count: u64,
    pub total_ms: u64,
    pub min_ms: Option<u64>,
    pub max_ms: Option<u64>,
    pub avg_ms: Option<f64>,
}

impl ProcessingStats {
    pub fn new(count: u64, total_ms: u64, min_ms: Option<u64>, max_ms: Option<u64>) -> Self {
        let avg_ms = (count > 0).then(|| total_ms as f64 / count as f64);
        Self {
            count,
            total_ms,
            min_ms,
            max_ms,
            avg_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRun {
    pub id: String,
    pub source: String,
    pub source_url: String,
    pub status: RunStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub counters: RunCounters,
    pub processing: ProcessingStats,
    pub error_counts: BTreeMap<ErrorCode, u64>,
    pub created_at: DateTime<Utc>,
}

impl ImportRun {
    pub fn pending(
        id: String,
        source: impl Into<String>,
        source_url: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            source: source.into(),
            source_url: source_url.into(),
            status: RunStatus::Pending,
            start_time: None,
            end_time: None,
            duration_ms: None,
            counters: RunCounters::default(),
            processing: ProcessingStats::default(),
            error_counts: BTreeMap::new(),
            created_at,
        }
    }
}

/// An error to be appended to a run's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    pub code: ErrorCode,
    pub severity: Severity,
    pub message: String,
    pub external_id: Option<String>,
    pub attempt: Option<u32>,
}

impl ErrorDetail {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            severity: code.severity(),
            message: message.into(),
            external_id: None,
            attempt: None,
        }
    }

    /// Classifies `err` and keeps its display text.
    pub fn from_error<E>(err: &E) -> Self
    where
        E: Classify + std::fmt::Display,
    {
        Self::new(err.error_code(), err.to_string())
    }

    pub fn with_item(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

/// A stored error log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunErrorEntry {
    pub seq: i64,
    pub code: ErrorCode,
    pub severity: Severity,
    pub message: String,
    pub external_id: Option<String>,
    pub attempt: Option<u32>,
    pub created_at: DateTime<Utc>,
}

/// Status view for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDetails {
    pub status: RunStatus,
    pub description: String,
    pub is_terminal: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub processing: ProcessingStats,
    pub counters: RunCounters,
    pub error_summary: BTreeMap<ErrorCode, u64>,
}

/// Aggregates over runs created in a time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub total_runs: u64,
    pub by_status: BTreeMap<RunStatus, u64>,
    pub totals: RunCounters,
    pub avg_duration_ms: Option<f64>,
}

/// Persisted run state machine.
#[derive(Clone)]
pub struct RunTracker {
    db: Database,
}

impl RunTracker {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Creates a pending run with zeroed counters.
    pub fn create_run(&self, source: &str, source_url: &str) -> Result<String, TrackerError> {
        let run = ImportRun::pending(
            uuid::Uuid::new_v4().to_string(),
            source,
            source_url,
            Utc::now(),
        );
        self.db.with_conn(|conn| run_repo::insert(conn, &run))?;
        debug!("Created run {} for source '{}'", run.id, source);
        Ok(run.id)
    }

    /// pending → in_progress, recording the start time and expected item count.
    pub fn begin(&self, run_id: &str, total_expected: u64) -> Result<(), TrackerError> {
        self.db.transaction(|conn| {
            let current = current_status(conn, run_id)?;
            if !current.can_transition_to(RunStatus::InProgress) {
                return Err(TrackerError::InvalidTransition {
                    from: current,
                    to: RunStatus::InProgress,
                });
            }
            if run_repo::begin(conn, run_id, total_expected, Utc::now())? == 0 {
                return Err(TrackerError::ConcurrentModification(run_id.to_string()));
            }
            Ok(())
        })?;
        info!("Run {} started with {} item(s)", run_id, total_expected);
        Ok(())
    }

    /// Moves a run to `to` if the transition table allows it.
    ///
    /// Fails with `InvalidTransition` otherwise and leaves the run untouched.
    pub fn transition(&self, run_id: &str, to: RunStatus) -> Result<(), TrackerError> {
        self.db.transaction(|conn| {
            let from = current_status(conn, run_id)?;
            if !from.can_transition_to(to) {
                return Err(TrackerError::InvalidTransition { from, to });
            }
            if run_repo::transition(conn, run_id, from, to, Utc::now())? == 0 {
                return Err(TrackerError::ConcurrentModification(run_id.to_string()));
            }
            Ok(())
        })
    }

    /// Folds one task outcome into the run.
    pub fn record_outcome(
        &self,
        run_id: &str,
        outcome: Outcome,
        processing_ms: u64,
        error: Option<&ErrorDetail>,
    ) -> Result<(), TrackerError> {
        self.db
            .transaction(|conn| record_outcome_in(conn, run_id, outcome, processing_ms, error))
    }

    /// Appends a non-terminal entry (e.g. a failure that will be retried).
    /// Counters and the histogram are left alone.
    pub fn record_warning(&self, run_id: &str, detail: &ErrorDetail) -> Result<(), TrackerError> {
        self.db
            .transaction(|conn| record_warning_in(conn, run_id, detail))
    }

    /// Fails an in-progress run with an error entry, e.g. when the queue
    /// rejects its remaining items.
    pub fn fail_run(&self, run_id: &str, detail: &ErrorDetail) -> Result<(), TrackerError> {
        self.db.transaction(|conn| {
            let from = current_status(conn, run_id)?;
            if !from.can_transition_to(RunStatus::Failed) {
                return Err(TrackerError::InvalidTransition {
                    from,
                    to: RunStatus::Failed,
                });
            }
            let now = Utc::now();
            if run_repo::transition(conn, run_id, from, RunStatus::Failed, now)? == 0 {
                return Err(TrackerError::ConcurrentModification(run_id.to_string()));
            }
            run_repo::append_error(conn, run_id, detail, now)?;
            run_repo::bump_error_count(conn, run_id, detail.code)?;
            Ok(())
        })?;
        warn!("Run {} failed: {}", run_id, detail.message);
        Ok(())
    }

    /// Closes the run if every item has an outcome.
    ///
    /// Returns the final status for the one caller that closed it and `None`
    /// for everyone else, including calls on runs that are already terminal.
    pub fn maybe_finalize(&self, run_id: &str) -> Result<Option<RunStatus>, TrackerError> {
        let status = self.db.transaction(|conn| maybe_finalize_in(conn, run_id))?;
        if let Some(status) = status {
            info!("Run {} finished: {}", run_id, status);
        }
        Ok(status)
    }

    /// Fails every in-progress run that started more than `timeout` ago.
    pub fn reap_stuck(&self, timeout: Duration) -> Result<Vec<String>, TrackerError> {
        let now = Utc::now();
        let cutoff = now
            - chrono::Duration::from_std(timeout)
                .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let minutes = timeout.as_secs() / 60;

        let candidates = self.db.with_conn(|conn| run_repo::stuck_runs(conn, cutoff))?;
        let mut reaped = Vec::new();

        for run_id in candidates {
            let changed = self.db.transaction(|conn| -> Result<bool, TrackerError> {
                if run_repo::fail_stuck(conn, &run_id, cutoff, now)? == 0 {
                    return Ok(false);
                }
                let detail = ErrorDetail::new(
                    ErrorCode::Processing,
                    format!("Run timed out after {} minutes in progress", minutes),
                )
                .with_severity(Severity::Critical);
                run_repo::append_error(conn, &run_id, &detail, now)?;
                run_repo::bump_error_count(conn, &run_id, detail.code)?;
                Ok(true)
            })?;

            if changed {
                warn!("Reaped stuck run {} (timeout {}m)", run_id, minutes);
                reaped.push(run_id);
            }
        }

        Ok(reaped)
    }

    pub fn get_run(&self, run_id: &str) -> Result<ImportRun, TrackerError> {
        self.db
            .with_conn(|conn| run_repo::find(conn, run_id))?
            .ok_or_else(|| TrackerError::RunNotFound(run_id.to_string()))
    }

    pub fn list_errors(&self, run_id: &str) -> Result<Vec<RunErrorEntry>, TrackerError> {
        self.db.with_conn(|conn| {
            if run_repo::status(conn, run_id)?.is_none() {
                return Ok(None);
            }
            run_repo::list_errors(conn, run_id).map(Some)
        })?
        .ok_or_else(|| TrackerError::RunNotFound(run_id.to_string()))
    }

    pub fn error_summary(&self, run_id: &str) -> Result<BTreeMap<ErrorCode, u64>, TrackerError> {
        Ok(self.get_run(run_id)?.error_counts)
    }

    pub fn status_details(&self, run_id: &str) -> Result<StatusDetails, TrackerError> {
        let run = self.get_run(run_id)?;
        Ok(StatusDetails {
            status: run.status,
            description: run.status.description().to_string(),
            is_terminal: run.status.is_terminal(),
            start_time: run.start_time,
            end_time: run.end_time,
            duration_ms: run.duration_ms,
            processing: run.processing,
            counters: run.counters,
            error_summary: run.error_counts,
        })
    }

    pub fn recent_runs(&self, limit: u32) -> Result<Vec<ImportRun>, TrackerError> {
        Ok(self.db.with_conn(|conn| run_repo::recent(conn, limit))?)
    }

    pub fn stats(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<RunStats, TrackerError> {
        Ok(self.db.with_conn(|conn| run_repo::stats(conn, from, to))?)
    }
}

fn current_status(conn: &Connection, run_id: &str) -> Result<RunStatus, TrackerError> {
    run_repo::status(conn, run_id)?.ok_or_else(|| TrackerError::RunNotFound(run_id.to_string()))
}

/// Connection-level form of [`RunTracker::record_outcome`], for callers that
/// need the outcome in the same transaction as other writes.
pub fn record_outcome_in(
    conn: &Connection,
    run_id: &str,
    outcome: Outcome,
    processing_ms: u64,
    error: Option<&ErrorDetail>,
) -> Result<(), TrackerError> {
    let delta = match outcome {
        Outcome::New => CounterDelta {
            new_jobs: 1,
            ..Default::default()
        },
        Outcome::Updated => CounterDelta {
            updated_jobs: 1,
            ..Default::default()
        },
        Outcome::Unchanged => CounterDelta {
            skipped_jobs: 1,
            ..Default::default()
        },
        Outcome::Failed => CounterDelta {
            failed_jobs: 1,
            ..Default::default()
        },
    };

    if run_repo::apply_outcome(conn, run_id, delta, processing_ms)? == 0 {
        return Err(TrackerError::RunNotFound(run_id.to_string()));
    }

    if outcome == Outcome::Failed {
        let fallback;
        let detail = match error {
            Some(detail) => detail,
            None => {
                fallback = ErrorDetail::new(ErrorCode::Unknown, "item failed without error detail");
                &fallback
            }
        };
        run_repo::append_error(conn, run_id, detail, Utc::now())?;
        run_repo::bump_error_count(conn, run_id, detail.code)?;
    }

    Ok(())
}

/// Connection-level form of [`RunTracker::record_warning`].
pub fn record_warning_in(
    conn: &Connection,
    run_id: &str,
    detail: &ErrorDetail,
) -> Result<(), TrackerError> {
    current_status(conn, run_id)?;
    run_repo::append_error(conn, run_id, detail, Utc::now())?;
    Ok(())
}

/// Connection-level form of [`RunTracker::maybe_finalize`].
pub fn maybe_finalize_in(
    conn: &Connection,
    run_id: &str,
) -> Result<Option<RunStatus>, TrackerError> {
    if run_repo::finalize(conn, run_id, Utc::now())? == 0 {
        return Ok(None);
    }
    Ok(Some(current_status(conn, run_id)?))
}

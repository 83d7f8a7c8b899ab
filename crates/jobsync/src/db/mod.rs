//! SQLite storage shared by the tracker, the queue and the job store.
//!
//! One connection sits behind a `Mutex`; [`Database`] is the cloneable handle
//! to it. Repository modules expose free functions over `&Connection` so a
//! caller can run several of them in one [`Database::transaction`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

pub mod error;
pub mod job_repo;
pub mod migrations;
pub mod run_repo;
pub mod task_repo;

pub use error::DatabaseError;

const FILE_PRAGMAS: &str =
    "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;";
const MEMORY_PRAGMAS: &str = "PRAGMA foreign_keys=ON;";

/// Cloneable handle to the store. Every clone shares one connection, so
/// writers are serialized in-process as well as by SQLite.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens the database file at `path`, creating parent directories and
    /// applying pending migrations.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| DatabaseError::Io {
                path: dir.to_path_buf(),
                source: e,
            })?;
        }

        let db = Self::prepare(Connection::open(path)?, FILE_PRAGMAS)?;
        log::info!("Storage ready at {}", path.display());
        Ok(db)
    }

    /// Fresh migrated database that lives only as long as the handle.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::prepare(Connection::open_in_memory()?, MEMORY_PRAGMAS)
    }

    fn prepare(conn: Connection, pragmas: &str) -> Result<Self, DatabaseError> {
        conn.execute_batch(pragmas)?;
        migrations::run_all(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Locks the connection. A lock poisoned by a panicking holder is taken
    /// over; any transaction that holder left open is rolled back first.
    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DatabaseError> {
        match self.conn.lock() {
            Ok(guard) => Ok(guard),
            Err(poisoned) => {
                log::warn!("Recovering database connection after a panic");
                let guard = poisoned.into_inner();
                if !guard.is_autocommit() {
                    guard.execute_batch("ROLLBACK")?;
                }
                self.conn.clear_poison();
                Ok(guard)
            }
        }
    }

    /// Runs `f` with the connection locked. No transaction is opened.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let guard = self.lock()?;
        f(&guard)
    }

    /// Runs `f` inside a transaction. Commits when `f` returns `Ok`,
    /// rolls back otherwise.
    pub fn transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<DatabaseError>,
    {
        let guard = self.lock()?;
        let tx = guard.unchecked_transaction().map_err(DatabaseError::from)?;
        let value = f(&tx)?;
        tx.commit().map_err(DatabaseError::from)?;
        Ok(value)
    }
}

/// Returns the canonical database path: `~/.jobsync/data/jobsync.db`.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".jobsync").join("data").join("jobsync.db"))
}

/// Formats a timestamp the way every table stores it.
///
/// Fixed width (millisecond precision, `Z` suffix) so that string
/// comparison in SQL orders the same as time.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses a stored timestamp back into a `DateTime<Utc>`.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::InvalidData(format!("bad timestamp '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn applied_migrations(db: &Database) -> u32 {
        db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))?)
        })
        .unwrap()
    }

    #[test]
    fn test_in_memory_is_migrated() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(applied_migrations(&db), migrations::MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_file_db_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("test.db");
        let db = Database::open(&path).unwrap();
        assert!(path.exists());
        assert!(applied_migrations(&db) > 0);

        // Reopening applies nothing twice.
        drop(db);
        let again = Database::open(&path).unwrap();
        assert_eq!(applied_migrations(&again), migrations::MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_default_database_path() {
        let path = default_database_path();
        assert!(path.is_some());
        let path = path.unwrap();
        assert!(path.ends_with("jobsync.db"));
        assert!(path.to_string_lossy().contains(".jobsync"));
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();
        let result: Result<(), DatabaseError> = db.transaction(|conn| {
            conn.execute(
                "INSERT INTO import_runs (id, source, source_url, status, created_at)
                 VALUES ('r1', 's', 'u', 'pending', '2026-01-01T00:00:00.000Z')",
                [],
            )?;
            Err(DatabaseError::InvalidData("boom".to_string()))
        });
        assert!(result.is_err());

        let count: u32 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM import_runs", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_survives_panic_inside_transaction() {
        let db = Database::open_in_memory().unwrap();
        let panicking = db.clone();
        let joined = std::thread::spawn(move || {
            let _: Result<(), DatabaseError> = panicking.transaction(|conn| {
                conn.execute(
                    "INSERT INTO import_runs (id, source, source_url, status, created_at)
                     VALUES ('r1', 's', 'u', 'pending', '2026-01-01T00:00:00.000Z')",
                    [],
                )?;
                panic!("worker blew up mid-write");
            });
        })
        .join();
        assert!(joined.is_err());

        let count: u32 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM import_runs", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);

        let committed: Result<(), DatabaseError> = db.transaction(|conn| {
            conn.execute(
                "INSERT INTO import_runs (id, source, source_url, status, created_at)
                 VALUES ('r2', 's', 'u', 'pending', '2026-01-01T00:00:00.000Z')",
                [],
            )?;
            Ok(())
        });
        assert!(committed.is_ok());
    }

    #[test]
    fn test_timestamp_roundtrip_and_ordering() {
        let a = DateTime::parse_from_rfc3339("2026-01-01T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let b = a + chrono::Duration::milliseconds(1500);
        let (sa, sb) = (timestamp(a), timestamp(b));
        assert_eq!(sa, "2026-01-01T09:00:00.000Z");
        assert!(sa < sb);
        assert_eq!(parse_timestamp(&sb).unwrap(), b);
    }
}

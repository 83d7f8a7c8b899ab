//! Schema migrations.
//!
//! Versions are recorded in `_migrations`; [`run_all`] applies every newer
//! entry of [`MIGRATIONS`] in order, each in its own transaction.

use rusqlite::{params, Connection};

use super::error::DatabaseError;

pub(crate) struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

pub(crate) const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_import_runs_tables",
        sql: include_str!("sql/001_create_import_runs.sql"),
    },
    Migration {
        version: 2,
        description: "create_job_records_table",
        sql: include_str!("sql/002_create_job_records.sql"),
    },
    Migration {
        version: 3,
        description: "create_tasks_table",
        sql: include_str!("sql/003_create_tasks.sql"),
    },
    Migration {
        version: 4,
        description: "add_task_lease",
        sql: include_str!("sql/004_add_task_lease.sql"),
    },
];

fn applied_version(conn: &Connection) -> Result<u32, DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );",
    )?;
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?)
}

/// Brings the schema up to the latest version.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    let current = applied_version(conn)?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        log::info!("Applying migration v{} ({})", migration.version, migration.description);

        let failed = |e: rusqlite::Error| DatabaseError::Migration {
            version: migration.version,
            reason: e.to_string(),
        };
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.sql).map_err(failed)?;
        tx.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            params![migration.version, migration.description],
        )?;
        tx.commit()?;
    }

    Ok(())
}

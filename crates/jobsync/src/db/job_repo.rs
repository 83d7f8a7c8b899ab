//! Job record repository: operations on the `job_records` table.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{parse_timestamp, timestamp, DatabaseError};
use crate::feed::JobType;
use crate::records::{ExperienceRange, JobRecord, PostingStatus, RecordMetadata, SalaryRange};

/// A raw `job_records` row.
#[derive(Debug, Clone)]
struct JobRow {
    id: String,
    source: String,
    external_id: String,
    title: String,
    company: String,
    description: String,
    location: Option<String>,
    job_type: String,
    category: Option<String>,
    url: String,
    status: String,
    salary_min: Option<i64>,
    salary_max: Option<i64>,
    salary_currency: Option<String>,
    experience_min: Option<i64>,
    experience_max: Option<i64>,
    skills: String,
    import_run_id: Option<String>,
    last_checked: String,
    last_modified: String,
    is_verified: bool,
    created_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            source: row.get("source")?,
            external_id: row.get("external_id")?,
            title: row.get("title")?,
            company: row.get("company")?,
            description: row.get("description")?,
            location: row.get("location")?,
            job_type: row.get("job_type")?,
            category: row.get("category")?,
            url: row.get("url")?,
            status: row.get("status")?,
            salary_min: row.get("salary_min")?,
            salary_max: row.get("salary_max")?,
            salary_currency: row.get("salary_currency")?,
            experience_min: row.get("experience_min")?,
            experience_max: row.get("experience_max")?,
            skills: row.get("skills")?,
            import_run_id: row.get("import_run_id")?,
            last_checked: row.get("last_checked")?,
            last_modified: row.get("last_modified")?,
            is_verified: row.get("is_verified")?,
            created_at: row.get("created_at")?,
        })
    }

    fn into_record(self) -> Result<JobRecord, DatabaseError> {
        let status = PostingStatus::from_stored(&self.status).ok_or_else(|| {
            DatabaseError::InvalidData(format!("unknown posting status '{}'", self.status))
        })?;
        let skills: Vec<String> = serde_json::from_str(&self.skills)
            .map_err(|e| DatabaseError::InvalidData(format!("bad skills column: {}", e)))?;

        let salary = if self.salary_min.is_some() || self.salary_max.is_some() {
            Some(SalaryRange {
                min: self.salary_min,
                max: self.salary_max,
                currency: self.salary_currency,
            })
        } else {
            None
        };
        let experience = if self.experience_min.is_some() || self.experience_max.is_some() {
            Some(ExperienceRange {
                min: self.experience_min,
                max: self.experience_max,
            })
        } else {
            None
        };

        Ok(JobRecord {
            id: self.id,
            source: self.source,
            external_id: self.external_id,
            title: self.title,
            company: self.company,
            description: self.description,
            location: self.location,
            job_type: JobType::from_stored(&self.job_type),
            category: self.category,
            url: self.url,
            status,
            salary,
            experience,
            skills,
            metadata: RecordMetadata {
                import_run_id: self.import_run_id,
                last_checked: parse_timestamp(&self.last_checked)?,
                last_modified: parse_timestamp(&self.last_modified)?,
                is_verified: self.is_verified,
            },
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

fn skills_json(record: &JobRecord) -> Result<String, DatabaseError> {
    serde_json::to_string(&record.skills)
        .map_err(|e| DatabaseError::InvalidData(format!("cannot encode skills: {}", e)))
}

/// Inserts a new record. Fails with a unique violation when
/// `(source, external_id)` already exists.
pub fn insert(conn: &Connection, record: &JobRecord) -> Result<(), DatabaseError> {
    let salary = record.salary.as_ref();
    let experience = record.experience.as_ref();
    conn.execute(
        "INSERT INTO job_records (id, source, external_id, title, company, description,
         location, job_type, category, url, status, salary_min, salary_max, salary_currency,
         experience_min, experience_max, skills, import_run_id, last_checked, last_modified,
         is_verified, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
         ?18, ?19, ?20, ?21, ?22)",
        params![
            record.id,
            record.source,
            record.external_id,
            record.title,
            record.company,
            record.description,
            record.location,
            record.job_type.as_str(),
            record.category,
            record.url,
            record.status.as_str(),
            salary.and_then(|s| s.min),
            salary.and_then(|s| s.max),
            salary.and_then(|s| s.currency.clone()),
            experience.and_then(|e| e.min),
            experience.and_then(|e| e.max),
            skills_json(record)?,
            record.metadata.import_run_id,
            timestamp(record.metadata.last_checked),
            timestamp(record.metadata.last_modified),
            record.metadata.is_verified,
            timestamp(record.created_at),
        ],
    )?;
    Ok(())
}

/// Overwrites the mutable columns of an existing record, matched by id.
pub fn update(conn: &Connection, record: &JobRecord) -> Result<(), DatabaseError> {
    let salary = record.salary.as_ref();
    let experience = record.experience.as_ref();
    let changed = conn.execute(
        "UPDATE job_records SET title=?2, company=?3, description=?4, location=?5,
         job_type=?6, category=?7, url=?8, status=?9, salary_min=?10, salary_max=?11,
         salary_currency=?12, experience_min=?13, experience_max=?14, skills=?15,
         import_run_id=?16, last_checked=?17, last_modified=?18, is_verified=?19
         WHERE id=?1",
        params![
            record.id,
            record.title,
            record.company,
            record.description,
            record.location,
            record.job_type.as_str(),
            record.category,
            record.url,
            record.status.as_str(),
            salary.and_then(|s| s.min),
            salary.and_then(|s| s.max),
            salary.and_then(|s| s.currency.clone()),
            experience.and_then(|e| e.min),
            experience.and_then(|e| e.max),
            skills_json(record)?,
            record.metadata.import_run_id,
            timestamp(record.metadata.last_checked),
            timestamp(record.metadata.last_modified),
            record.metadata.is_verified,
        ],
    )?;

    if changed == 0 {
        return Err(DatabaseError::InvalidData(format!(
            "job record {} vanished during update",
            record.id
        )));
    }
    Ok(())
}

/// Looks up a record by its dedup key.
pub fn find_by_key(
    conn: &Connection,
    source: &str,
    external_id: &str,
) -> Result<Option<JobRecord>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM job_records WHERE source = ?1 AND external_id = ?2",
            params![source, external_id],
            JobRow::from_row,
        )
        .optional()?;
    row.map(JobRow::into_record).transpose()
}

/// Total number of stored records.
pub fn count(conn: &Connection) -> Result<u64, DatabaseError> {
    Ok(conn.query_row("SELECT COUNT(*) FROM job_records", [], |r| r.get(0))?)
}

/// Records last written by the given run, oldest first.
pub fn list_by_run(conn: &Connection, run_id: &str) -> Result<Vec<JobRecord>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM job_records WHERE import_run_id = ?1 ORDER BY created_at, external_id",
    )?;
    let rows = stmt
        .query_map(params![run_id], JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(JobRow::into_record).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::feed::NormalizedItem;
    use chrono::Utc;

    fn item(external_id: &str) -> NormalizedItem {
        NormalizedItem {
            title: "Data Analyst".into(),
            company: "Acme".into(),
            description: "$70,000 - $85,000, 2+ years of SQL and Python".into(),
            location: Some("Remote".into()),
            job_type: JobType::FullTime,
            category: Some("Data Science".into()),
            url: format!("https://example.com/{}", external_id),
            source: "jobicy".into(),
            external_id: external_id.into(),
        }
    }

    #[test]
    fn test_insert_and_find_by_key() {
        let db = Database::open_in_memory().unwrap();
        let record = JobRecord::from_item(&item("a"), "run-1", Utc::now());

        db.with_conn(|conn| {
            insert(conn, &record)?;
            let found = find_by_key(conn, "jobicy", "a")?.unwrap();
            assert_eq!(found.id, record.id);
            assert_eq!(found.skills, vec!["python", "sql"]);
            assert_eq!(found.salary.as_ref().unwrap().max, Some(85_000));
            assert_eq!(found.experience.unwrap().min, Some(2));
            assert_eq!(
                timestamp(found.metadata.last_modified),
                timestamp(record.metadata.last_modified)
            );
            assert!(find_by_key(conn, "jobicy", "b")?.is_none());
            assert!(find_by_key(conn, "higheredjobs", "a")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_duplicate_insert_is_unique_violation() {
        let db = Database::open_in_memory().unwrap();
        let first = JobRecord::from_item(&item("a"), "run-1", Utc::now());
        let second = JobRecord::from_item(&item("a"), "run-2", Utc::now());

        let err = db
            .with_conn(|conn| {
                insert(conn, &first)?;
                insert(conn, &second)
            })
            .unwrap_err();
        assert!(err.is_unique_violation());
        assert_eq!(db.with_conn(|c| count(c)).unwrap(), 1);
    }

    #[test]
    fn test_update_overwrites_mutable_fields() {
        let db = Database::open_in_memory().unwrap();
        let mut record = JobRecord::from_item(&item("a"), "run-1", Utc::now());
        db.with_conn(|conn| insert(conn, &record)).unwrap();

        let mut next = item("a");
        next.title = "Senior Data Analyst".into();
        assert!(record.apply_item(&next, "run-2", Utc::now()));

        db.with_conn(|conn| {
            update(conn, &record)?;
            let found = find_by_key(conn, "jobicy", "a")?.unwrap();
            assert_eq!(found.title, "Senior Data Analyst");
            assert_eq!(found.metadata.import_run_id.as_deref(), Some("run-2"));
            assert_eq!(list_by_run(conn, "run-2")?.len(), 1);
            assert!(list_by_run(conn, "run-1")?.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_update_missing_row_fails() {
        let db = Database::open_in_memory().unwrap();
        let record = JobRecord::from_item(&item("a"), "run-1", Utc::now());
        assert!(db.with_conn(|conn| update(conn, &record)).is_err());
    }
}

//! Persisted job postings and the create-vs-update decision.

pub mod enrich;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WorkerError;
use crate::feed::{JobType, NormalizedItem};

pub use enrich::{extract_experience, extract_salary, extract_skills};

/// Lifecycle flag of a posting. Expiry is a status, never a deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PostingStatus {
    #[default]
    Active,
    Expired,
    Filled,
    Draft,
}

impl PostingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostingStatus::Active => "active",
            PostingStatus::Expired => "expired",
            PostingStatus::Filled => "filled",
            PostingStatus::Draft => "draft",
        }
    }

    pub fn from_stored(value: &str) -> Option<Self> {
        match value {
            "active" => Some(PostingStatus::Active),
            "expired" => Some(PostingStatus::Expired),
            "filled" => Some(PostingStatus::Filled),
            "draft" => Some(PostingStatus::Draft),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalaryRange {
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub currency: Option<String>,
}

/// Years of experience asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperienceRange {
    pub min: Option<i64>,
    pub max: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    pub import_run_id: Option<String>,
    pub last_checked: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub is_verified: bool,
}

/// A stored posting, unique on `(source, external_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub source: String,
    pub external_id: String,
    pub title: String,
    pub company: String,
    pub description: String,
    pub location: Option<String>,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub category: Option<String>,
    pub url: String,
    pub status: PostingStatus,
    pub salary: Option<SalaryRange>,
    pub experience: Option<ExperienceRange>,
    pub skills: Vec<String>,
    pub metadata: RecordMetadata,
    pub created_at: DateTime<Utc>,
}

/// What happened to a record when an item was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    New,
    Updated,
    Unchanged,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::New => "new",
            Outcome::Updated => "updated",
            Outcome::Unchanged => "unchanged",
            Outcome::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejects items missing a field every record needs.
pub fn validate_item(item: &NormalizedItem) -> Result<(), WorkerError> {
    let required = [
        ("title", &item.title),
        ("company", &item.company),
        ("url", &item.url),
        ("source", &item.source),
        ("externalId", &item.external_id),
    ];

    let missing: Vec<&str> = required
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| *name)
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(WorkerError::Validation {
            external_id: item.external_id.clone(),
            reason: format!("missing required field(s): {}", missing.join(", ")),
        })
    }
}

impl JobRecord {
    /// Builds a fresh record for a first sighting.
    pub fn from_item(item: &NormalizedItem, run_id: &str, now: DateTime<Utc>) -> Self {
        let mut record = Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: item.source.clone(),
            external_id: item.external_id.clone(),
            title: item.title.clone(),
            company: item.company.clone(),
            description: item.description.clone(),
            location: item.location.clone(),
            job_type: item.job_type,
            category: item.category.clone(),
            url: item.url.clone(),
            status: PostingStatus::Active,
            salary: None,
            experience: None,
            skills: Vec::new(),
            metadata: RecordMetadata {
                import_run_id: Some(run_id.to_string()),
                last_checked: now,
                last_modified: now,
                is_verified: false,
            },
            created_at: now,
        };
        record.derive_fields();
        record
    }

    /// Names of the tracked fields whose values differ from `item`.
    pub fn changed_fields(&self, item: &NormalizedItem) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.title != item.title {
            changed.push("title");
        }
        if self.description != item.description {
            changed.push("description");
        }
        if self.location != item.location {
            changed.push("location");
        }
        if self.job_type != item.job_type {
            changed.push("type");
        }
        if self.category != item.category {
            changed.push("category");
        }
        if self.url != item.url {
            changed.push("url");
        }
        changed
    }

    /// Copies the tracked fields from `item` and stamps the metadata.
    ///
    /// Returns `false` and leaves the record untouched when nothing differs.
    pub fn apply_item(&mut self, item: &NormalizedItem, run_id: &str, now: DateTime<Utc>) -> bool {
        if self.changed_fields(item).is_empty() {
            return false;
        }

        self.title = item.title.clone();
        self.description = item.description.clone();
        self.location = item.location.clone();
        self.job_type = item.job_type;
        self.category = item.category.clone();
        self.url = item.url.clone();
        self.metadata.import_run_id = Some(run_id.to_string());
        self.metadata.last_checked = now;
        self.metadata.last_modified = now;
        self.derive_fields();
        true
    }

    fn derive_fields(&mut self) {
        self.salary = extract_salary(&self.description);
        self.experience = extract_experience(&self.description);
        self.skills = extract_skills(&self.title, &self.description);
    }
}

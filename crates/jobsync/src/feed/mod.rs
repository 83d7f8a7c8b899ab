//! Feed sources, fetching, and normalization into canonical job items.

pub mod fetch;
pub mod normalize;
pub mod xml;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::FeedError;

pub use fetch::{FeedFetcher, FetchedFeed, HttpFeedFetcher};
pub use normalize::normalize_feed;

/// A configured feed endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedSource {
    /// Logical name, e.g. `jobicy_design`. Selects the extraction rules.
    pub name: String,
    /// Feed URL.
    pub url: String,
    /// Extra request headers (user agent, accept, auth).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl FeedSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Extraction rules for a family of feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFormat {
    Jobicy,
    HigherEdJobs,
}

impl FeedFormat {
    /// Resolves the rules for a logical source name.
    pub fn for_source(name: &str) -> Result<Self, FeedError> {
        if name.starts_with("jobicy") {
            Ok(FeedFormat::Jobicy)
        } else if name == "higheredjobs" {
            Ok(FeedFormat::HigherEdJobs)
        } else {
            Err(FeedError::UnsupportedSource(name.to_string()))
        }
    }

    /// The `source` value stamped on every item, shared by all feeds of
    /// the family so postings dedup across them.
    pub fn record_source(&self) -> &'static str {
        match self {
            FeedFormat::Jobicy => "jobicy",
            FeedFormat::HigherEdJobs => "higheredjobs",
        }
    }
}

/// Employment type, normalized from free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    FullTime,
    PartTime,
    Contract,
    Internship,
    #[default]
    Other,
}

impl JobType {
    /// Maps feed text onto the enum.
    ///
    /// Comma-joined values ("Contract, Part Time") use the first segment.
    pub fn normalize(raw: &str) -> Self {
        let first = raw.split(',').next().unwrap_or("").trim();
        let key = first.to_lowercase().replace(['-', '_'], " ");
        match key.as_str() {
            "full time" | "fulltime" => JobType::FullTime,
            "part time" | "parttime" => JobType::PartTime,
            "contract" | "contractor" | "freelance" => JobType::Contract,
            "internship" | "intern" => JobType::Internship,
            _ => JobType::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::FullTime => "full_time",
            JobType::PartTime => "part_time",
            JobType::Contract => "contract",
            JobType::Internship => "internship",
            JobType::Other => "other",
        }
    }

    /// Parses the stored representation. Unknown values become `Other`.
    pub fn from_stored(value: &str) -> Self {
        match value {
            "full_time" => JobType::FullTime,
            "part_time" => JobType::PartTime,
            "contract" => JobType::Contract,
            "internship" => JobType::Internship,
            _ => JobType::Other,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One posting in canonical shape. This is the task payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedItem {
    pub title: String,
    pub company: String,
    pub description: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(rename = "type", default)]
    pub job_type: JobType,
    #[serde(default)]
    pub category: Option<String>,
    pub url: String,
    pub source: String,
    pub external_id: String,
}

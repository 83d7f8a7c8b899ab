use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::feed::FeedSource;
use crate::queue::{BackoffPolicy, RetryPolicy, DEFAULT_MAX_ATTEMPTS};
use crate::scheduler::ScheduleSettings;
use crate::worker::DEFAULT_WORKER_COUNT;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    /// Overrides the default `~/.jobsync/data/jobsync.db`.
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceConfig>,
}

fn default_worker_count() -> usize {
    num_cpus::get().clamp(1, DEFAULT_WORKER_COUNT)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            database_path: None,
            worker_count: default_worker_count(),
            schedule: ScheduleConfig::default(),
            queue: QueueConfig::default(),
            http: HttpConfig::default(),
            logging: LoggingConfig::default(),
            sources: default_sources(),
        }
    }
}

impl Config {
    /// Database location: the configured path, else the per-user default.
    pub fn resolved_database_path(&self) -> Option<PathBuf> {
        match &self.database_path {
            Some(path) => Some(PathBuf::from(path)),
            None => crate::db::default_database_path(),
        }
    }

    pub fn feed_sources(&self) -> Vec<FeedSource> {
        self.sources.iter().map(SourceConfig::to_feed_source).collect()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.queue.max_attempts,
            backoff: BackoffPolicy::new(
                Duration::from_millis(self.queue.backoff_base_ms),
                Duration::from_millis(self.queue.backoff_cap_ms),
            ),
        }
    }

    pub fn schedule_settings(&self) -> ScheduleSettings {
        ScheduleSettings {
            sweep_interval: Duration::from_secs(self.schedule.sweep_interval_secs),
            reaper_interval: Duration::from_secs(self.schedule.reaper_interval_secs),
            stuck_timeout: Duration::from_secs(self.schedule.stuck_timeout_secs),
            claim_lease: Duration::from_secs(self.schedule.claim_lease_secs),
            sweep_on_startup: self.schedule.sweep_on_startup,
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
    #[serde(default = "default_stuck_timeout")]
    pub stuck_timeout_secs: u64,
    #[serde(default = "default_claim_lease")]
    pub claim_lease_secs: u64,
    #[serde(default = "default_true")]
    pub sweep_on_startup: bool,
}

fn default_sweep_interval() -> u64 {
    6 * 60 * 60
}

fn default_reaper_interval() -> u64 {
    5 * 60
}

fn default_stuck_timeout() -> u64 {
    60 * 60
}

fn default_claim_lease() -> u64 {
    10 * 60
}

fn default_true() -> bool {
    true
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            reaper_interval_secs: default_reaper_interval(),
            stuck_timeout_secs: default_stuck_timeout(),
            claim_lease_secs: default_claim_lease(),
            sweep_on_startup: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_cap_ms() -> u64 {
    60_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

fn default_http_timeout() -> u64 {
    30
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives; `RUST_LOG` wins when set.
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl SourceConfig {
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            headers: BTreeMap::new(),
        }
    }

    pub fn to_feed_source(&self) -> FeedSource {
        FeedSource {
            name: self.name.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
        }
    }
}

/// The stock feed list.
pub fn default_sources() -> Vec<SourceConfig> {
    const JOBICY: &str = "https://jobicy.com/?feed=job_feed";
    vec![
        SourceConfig::new("jobicy_all", JOBICY),
        SourceConfig::new(
            "jobicy_smm",
            "https://jobicy.com/?feed=job_feed&job_categories=smm&job_types=full-time",
        ),
        SourceConfig::new(
            "jobicy_france",
            "https://jobicy.com/?feed=job_feed&job_categories=seller&job_types=full-time&search_region=france",
        ),
        SourceConfig::new(
            "jobicy_design",
            "https://jobicy.com/?feed=job_feed&job_categories=design-multimedia",
        ),
        SourceConfig::new(
            "jobicy_data_science",
            "https://jobicy.com/?feed=job_feed&job_categories=data-science",
        ),
        SourceConfig::new(
            "jobicy_copywriting",
            "https://jobicy.com/?feed=job_feed&job_categories=copywriting",
        ),
        SourceConfig::new(
            "jobicy_business",
            "https://jobicy.com/?feed=job_feed&job_categories=business",
        ),
        SourceConfig::new(
            "jobicy_management",
            "https://jobicy.com/?feed=job_feed&job_categories=management",
        ),
        SourceConfig::new("higheredjobs", "https://www.higheredjobs.com/rss/articleFeed.cfm"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.version, "1.0");
        assert!(config.worker_count >= 1 && config.worker_count <= DEFAULT_WORKER_COUNT);
        assert_eq!(config.sources.len(), 9);

        let schedule = config.schedule_settings();
        assert_eq!(schedule.sweep_interval, Duration::from_secs(21_600));
        assert_eq!(schedule.reaper_interval, Duration::from_secs(300));
        assert_eq!(schedule.stuck_timeout, Duration::from_secs(3_600));
        assert!(schedule.sweep_on_startup);

        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.http_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_source_headers_carry_over() {
        let mut source = SourceConfig::new("jobicy_all", "https://jobicy.com/?feed=job_feed");
        source
            .headers
            .insert("User-Agent".to_string(), "Mozilla/5.0".to_string());
        let feed = source.to_feed_source();
        assert_eq!(feed.name, "jobicy_all");
        assert_eq!(feed.headers.get("User-Agent").map(String::as_str), Some("Mozilla/5.0"));
    }

    #[test]
    fn test_explicit_database_path() {
        let config = Config {
            database_path: Some("/tmp/jobs.db".to_string()),
            ..Config::default()
        };
        assert_eq!(
            config.resolved_database_path(),
            Some(PathBuf::from("/tmp/jobs.db"))
        );
    }
}

use std::collections::HashSet;
use std::path::Path;

use log::debug;

use crate::config::schema::Config;
use crate::error::ConfigError;
use crate::feed::FeedFormat;

const SCHEMA_JSON: &str = include_str!("../../schema/config-v1.json");

pub const ENV_DATABASE: &str = "JOBSYNC_DATABASE";
pub const ENV_WORKERS: &str = "JOBSYNC_WORKERS";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

/// Loads `path` when given, otherwise the built-in defaults, then applies
/// environment overrides.
pub fn load_or_default(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Applies `JOBSYNC_DATABASE` and `JOBSYNC_WORKERS` from the process
/// environment.
pub fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    apply_overrides(config, |key| std::env::var(key).ok())
}

fn apply_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = lookup(ENV_DATABASE).filter(|v| !v.trim().is_empty()) {
        debug!("Database path overridden by {}", ENV_DATABASE);
        config.database_path = Some(path);
    }

    if let Some(raw) = lookup(ENV_WORKERS) {
        let workers: usize = raw.trim().parse().map_err(|_| ConfigError::Validation {
            message: format!("{} must be a positive integer, got '{}'", ENV_WORKERS, raw),
        })?;
        if workers == 0 {
            return Err(ConfigError::Validation {
                message: format!("{} must be at least 1", ENV_WORKERS),
            });
        }
        config.worker_count = workers;
    }

    Ok(())
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| format!("{} at {}", e, e.instance_path()))
        .collect();

    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.worker_count == 0 {
        return Err(ConfigError::Validation {
            message: "worker_count must be at least 1".to_string(),
        });
    }

    let schedule = &config.schedule;
    for (name, value) in [
        ("schedule.sweep_interval_secs", schedule.sweep_interval_secs),
        ("schedule.reaper_interval_secs", schedule.reaper_interval_secs),
        ("schedule.stuck_timeout_secs", schedule.stuck_timeout_secs),
        ("schedule.claim_lease_secs", schedule.claim_lease_secs),
    ] {
        if value == 0 {
            return Err(ConfigError::Validation {
                message: format!("{} must be positive", name),
            });
        }
    }

    if config.queue.max_attempts == 0 {
        return Err(ConfigError::Validation {
            message: "queue.max_attempts must be at least 1".to_string(),
        });
    }
    if config.queue.backoff_base_ms > config.queue.backoff_cap_ms {
        return Err(ConfigError::Validation {
            message: "queue.backoff_base_ms must not exceed queue.backoff_cap_ms".to_string(),
        });
    }

    let mut names = HashSet::new();
    for source in &config.sources {
        if !names.insert(source.name.as_str()) {
            return Err(ConfigError::InvalidSource {
                name: source.name.clone(),
                reason: "Duplicate source name".to_string(),
            });
        }

        if let Err(e) = FeedFormat::for_source(&source.name) {
            return Err(ConfigError::InvalidSource {
                name: source.name.clone(),
                reason: e.to_string(),
            });
        }

        if !(source.url.starts_with("http://") || source.url.starts_with("https://")) {
            return Err(ConfigError::InvalidSource {
                name: source.name.clone(),
                reason: "URL must use http or https".to_string(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;
    use std::time::Duration;

    #[test]
    fn test_load_minimal_config() {
        let config = load_config_from_str(r#"{ "version": "1.0" }"#).unwrap();
        assert_eq!(config.sources.len(), 9);
        assert_eq!(config.queue.max_attempts, 3);
        assert!(config.database_path.is_none());
    }

    #[test]
    fn test_load_full_config() {
        let config_json = r#"
        {
            "version": "1.0",
            "database_path": "/var/lib/jobsync/jobs.db",
            "worker_count": 8,
            "schedule": {
                "sweep_interval_secs": 3600,
                "reaper_interval_secs": 60,
                "stuck_timeout_secs": 1800,
                "sweep_on_startup": false
            },
            "queue": { "max_attempts": 5, "backoff_base_ms": 500, "backoff_cap_ms": 10000 },
            "http": { "timeout_secs": 15 },
            "logging": { "filter": "warn", "json": true },
            "sources": [
                {
                    "name": "jobicy_design",
                    "url": "https://jobicy.com/?feed=job_feed&job_categories=design-multimedia",
                    "headers": { "User-Agent": "Mozilla/5.0" }
                },
                { "name": "higheredjobs", "url": "https://www.higheredjobs.com/rss/articleFeed.cfm" }
            ]
        }
        "#;

        let config = load_config_from_str(config_json).unwrap();
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].headers["User-Agent"], "Mozilla/5.0");
        assert!(config.logging.json);

        let schedule = config.schedule_settings();
        assert_eq!(schedule.sweep_interval, Duration::from_secs(3600));
        assert!(!schedule.sweep_on_startup);

        let retry = config.retry_policy();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.backoff.base, Duration::from_millis(500));
        assert_eq!(config.http_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_schema_rejects_unknown_field() {
        let result = load_config_from_str(r#"{ "version": "1.0", "input_directory": "/in" }"#);
        assert!(matches!(result, Err(ConfigError::SchemaValidation { .. })));
    }

    #[test]
    fn test_schema_rejects_bad_version() {
        let result = load_config_from_str(r#"{ "version": "2.0" }"#);
        assert!(matches!(result, Err(ConfigError::SchemaValidation { .. })));
    }

    #[test]
    fn test_schema_rejects_zero_interval() {
        let result =
            load_config_from_str(r#"{ "version": "1.0", "schedule": { "sweep_interval_secs": 0 } }"#);
        assert!(matches!(result, Err(ConfigError::SchemaValidation { .. })));
    }

    #[test]
    fn test_duplicate_source_name() {
        let config_json = r#"
        {
            "version": "1.0",
            "sources": [
                { "name": "jobicy_all", "url": "https://jobicy.com/?feed=job_feed" },
                { "name": "jobicy_all", "url": "https://jobicy.com/?feed=job_feed" }
            ]
        }
        "#;
        match load_config_from_str(config_json) {
            Err(ConfigError::InvalidSource { name, reason }) => {
                assert_eq!(name, "jobicy_all");
                assert!(reason.contains("Duplicate"));
            }
            other => panic!("expected InvalidSource, got {:?}", other.map(|c| c.version)),
        }
    }

    #[test]
    fn test_unsupported_source_name() {
        let config_json = r#"
        {
            "version": "1.0",
            "sources": [ { "name": "indeed", "url": "https://indeed.example/rss" } ]
        }
        "#;
        assert!(matches!(
            load_config_from_str(config_json),
            Err(ConfigError::InvalidSource { .. })
        ));
    }

    #[test]
    fn test_backoff_base_above_cap() {
        let result = load_config_from_str(
            r#"{ "version": "1.0", "queue": { "backoff_base_ms": 5000, "backoff_cap_ms": 1000 } }"#,
        );
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            load_config_from_str("{ not json"),
            Err(ConfigError::ParseJson(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            load_config("/nonexistent/jobsync.json"),
            Err(ConfigError::ReadFile { .. })
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("jobsync.json");
        std::fs::write(&path, r#"{ "version": "1.0", "worker_count": 2 }"#).unwrap();
        assert_eq!(load_config(&path).unwrap().worker_count, 2);
    }

    #[test]
    fn test_overrides_from_lookup() {
        let env: HashMap<&str, &str> =
            HashMap::from([(ENV_DATABASE, "/data/jobs.db"), (ENV_WORKERS, " 6 ")]);
        let mut config = Config::default();
        apply_overrides(&mut config, |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.database_path.as_deref(), Some("/data/jobs.db"));
        assert_eq!(config.worker_count, 6);
    }

    #[test]
    fn test_invalid_worker_override() {
        let mut config = Config::default();
        let result = apply_overrides(&mut config, |k| (k == ENV_WORKERS).then(|| "0".to_string()));
        assert!(matches!(result, Err(ConfigError::Validation { .. })));

        let result =
            apply_overrides(&mut config, |k| (k == ENV_WORKERS).then(|| "many".to_string()));
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var(ENV_WORKERS, "3");
        std::env::remove_var(ENV_DATABASE);
        let config = load_or_default(None).unwrap();
        std::env::remove_var(ENV_WORKERS);

        assert_eq!(config.worker_count, 3);
        assert!(config.database_path.is_none());
    }
}

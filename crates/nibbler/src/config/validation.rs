//! Configuration validation.

use super::Config;
use crate::error::{ReconcileError, Result};
use crate::state::validate_job_id;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_job_id(&config.job.id)
        .map_err(|e| ReconcileError::Config(format!("job.id: {}", e)))?;

    if config.job.limit == 0 {
        return Err(ReconcileError::Config("job.limit must be at least 1".into()));
    }
    if config.job.max_limit < config.job.limit {
        return Err(ReconcileError::Config(format!(
            "job.max_limit ({}) must not be below job.limit ({})",
            config.job.max_limit, config.job.limit
        )));
    }
    if let Some(0) = config.job.stop_on_streak {
        return Err(ReconcileError::Config(
            "job.stop_on_streak must be at least 1".into(),
        ));
    }
    if config.job.sample && config.job.sample_size == 0 {
        return Err(ReconcileError::Config(
            "job.sample_size must be at least 1 when sampling".into(),
        ));
    }

    for (side, source) in [("master", &config.master), ("slave", &config.slave)] {
        if source.path.as_os_str().is_empty() {
            return Err(ReconcileError::Config(format!("{}.path is required", side)));
        }
        if source.key.is_empty() {
            return Err(ReconcileError::Config(format!("{}.key is required", side)));
        }
    }

    // Both sides are parsed with one key type
    if config.master.key_type != config.slave.key_type {
        return Err(ReconcileError::Config(
            "master.key_type and slave.key_type must match".into(),
        ));
    }

    // Cannot reconcile a store with itself
    if config.master.path == config.slave.path {
        return Err(ReconcileError::Config(
            "master and slave cannot be the same file".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JobConfig, KeyType, SourceConfig, StateConfig};
    use std::path::PathBuf;

    fn source(path: &str) -> SourceConfig {
        SourceConfig {
            path: PathBuf::from(path),
            key: "id".to_string(),
            key_type: KeyType::Integer,
            alt_id: None,
        }
    }

    fn valid_config() -> Config {
        Config {
            job: JobConfig {
                id: "orders".to_string(),
                reverse: false,
                skip_batch: false,
                stop_on_streak: None,
                sample: false,
                sample_size: 4,
                sample_seed: None,
                should_delete: false,
                limit: 1000,
                max_limit: 1_000_000,
                min_key: None,
                max_key: None,
                time_budget_secs: None,
                transport_retries: 3,
                retry_backoff_ms: 500,
            },
            master: source("master.jsonl"),
            slave: source("slave.jsonl"),
            state: StateConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = valid_config();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_bad_job_id() {
        let mut config = valid_config();
        config.job.id = "../orders".to_string();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("job.id"));
    }

    #[test]
    fn test_zero_limit() {
        let mut config = valid_config();
        config.job.limit = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_max_limit_below_limit() {
        let mut config = valid_config();
        config.job.max_limit = 10;
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("job.max_limit"));
    }

    #[test]
    fn test_zero_streak() {
        let mut config = valid_config();
        config.job.stop_on_streak = Some(0);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_missing_key_field() {
        let mut config = valid_config();
        config.slave.key = String::new();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("slave.key"));
    }

    #[test]
    fn test_key_types_must_match() {
        let mut config = valid_config();
        config.slave.key_type = KeyType::String;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_same_file_rejected() {
        let mut config = valid_config();
        config.slave.path = config.master.path.clone();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("same file"));
    }
}

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use std::path::Path;
use thiserror::Error;

use crate::domain::models::Config;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid max_concurrent_agents: {0}. Must be between 1 and 1000")]
    InvalidMaxConcurrentAgents(usize),

    #[error("Invalid max_recursion_depth: {0}. Must be at least 1")]
    InvalidMaxRecursionDepth(u32),

    #[error("Invalid max_subtasks: {0}. Must be at least 2")]
    InvalidMaxSubtasks(usize),

    #[error("Invalid max_cost: {0}. Must be positive")]
    InvalidMaxCost(f64),

    #[error("Invalid max_execution_time_secs: {0}. Must be positive")]
    InvalidExecutionTime(u64),

    #[error(
        "Invalid backoff configuration: initial_backoff_ms ({0}) must be less than max_backoff_ms ({1})"
    )]
    InvalidBackoff(u64, u64),

    #[error("Invalid threshold {name}: {value}. Must be within (0, 1]")]
    InvalidThreshold { name: &'static str, value: f64 },

    #[error("Invalid monitor_interval_ms: {0}. Must be positive")]
    InvalidMonitorInterval(u64),

    #[error("Invalid learning window: {0}")]
    InvalidLearningWindow(String),

    #[error("Invalid score weights: components must be non-negative with a positive sum")]
    InvalidScoreWeights,

    #[error("Council needs at least one persona")]
    EmptyCouncil,

    #[error("Database URL cannot be empty")]
    EmptyDatabaseUrl,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidLogRotation(String),
}

fn unit_interval(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidThreshold { name, value })
    }
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. .arbor/config.yaml
    /// 3. .arbor/local.yaml (optional overrides)
    /// 4. `ARBOR_*` environment variables, `__` separating nested keys
    pub fn load() -> Result<Config> {
        Self::load_layered(Path::new(".arbor"))
    }

    /// Same layering as [`ConfigLoader::load`], rooted at `dir`.
    pub fn load_layered(dir: &Path) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(dir.join("config.yaml")))
            .merge(Yaml::file(dir.join("local.yaml")))
            .merge(Env::prefixed("ARBOR_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path))
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let resources = &config.resources;
        if resources.max_concurrent_agents == 0 || resources.max_concurrent_agents > 1000 {
            return Err(ConfigError::InvalidMaxConcurrentAgents(resources.max_concurrent_agents));
        }
        if resources.max_recursion_depth == 0 {
            return Err(ConfigError::InvalidMaxRecursionDepth(resources.max_recursion_depth));
        }
        if resources.max_subtasks < 2 {
            return Err(ConfigError::InvalidMaxSubtasks(resources.max_subtasks));
        }

        if config.budget.max_cost <= 0.0 || config.budget.max_cost.is_nan() {
            return Err(ConfigError::InvalidMaxCost(config.budget.max_cost));
        }
        if config.budget.max_execution_time_secs == 0 {
            return Err(ConfigError::InvalidExecutionTime(config.budget.max_execution_time_secs));
        }

        if config.retry.initial_backoff_ms >= config.retry.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                config.retry.initial_backoff_ms,
                config.retry.max_backoff_ms,
            ));
        }

        let recovery = &config.recovery;
        if recovery.monitor_interval_ms == 0 {
            return Err(ConfigError::InvalidMonitorInterval(recovery.monitor_interval_ms));
        }
        unit_interval("cost_overrun_threshold", recovery.cost_overrun_threshold)?;
        unit_interval("failure_rate_threshold", recovery.failure_rate_threshold)?;
        unit_interval("time_overrun_threshold", recovery.time_overrun_threshold)?;

        let learning = &config.learning;
        if learning.window_days <= 0 || learning.window_max_records == 0 {
            return Err(ConfigError::InvalidLearningWindow(format!(
                "{} days / {} records",
                learning.window_days, learning.window_max_records
            )));
        }
        if learning.min_samples == 0 {
            return Err(ConfigError::InvalidLearningWindow("min_samples must be at least 1".to_string()));
        }
        unit_interval("confidence_gate", learning.confidence_gate)?;
        unit_interval("max_confidence", learning.max_confidence)?;
        unit_interval("invalidation_fraction", learning.invalidation_fraction)?;
        let w = learning.weights;
        let components = [w.success, w.quality, w.speed, w.usefulness];
        if components.iter().any(|c| *c < 0.0 || c.is_nan()) || components.iter().sum::<f64>() <= 0.0 {
            return Err(ConfigError::InvalidScoreWeights);
        }

        if config.strategy.council_personas.is_empty() {
            return Err(ConfigError::EmptyCouncil);
        }

        if config.database.url.is_empty() {
            return Err(ConfigError::EmptyDatabaseUrl);
        }
        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(config.database.max_connections));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        if !["json", "pretty"].contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }
        if !["daily", "hourly", "never"].contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidLogRotation(config.logging.rotation.clone()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        ConfigLoader::validate(&Config::default()).expect("default config should be valid");
    }

    #[test]
    fn test_load_from_file_merges_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "resources:\n  max_concurrent_agents: 4\nlogging:\n  level: debug\n  format: pretty"
        )
        .unwrap();
        file.flush().unwrap();

        let config = ConfigLoader::load_from_file(file.path()).unwrap();
        assert_eq!(config.resources.max_concurrent_agents, 4);
        assert_eq!(config.resources.max_recursion_depth, 8);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_load_from_file_rejects_invalid_values() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "resources:\n  max_concurrent_agents: 0").unwrap();
        file.flush().unwrap();
        assert!(ConfigLoader::load_from_file(file.path()).is_err());
    }

    #[test]
    fn test_validate_concurrency_bounds() {
        let mut config = Config::default();
        config.resources.max_concurrent_agents = 1001;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidMaxConcurrentAgents(1001))
        ));
        config.resources.max_concurrent_agents = 1000;
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn test_validate_thresholds() {
        let mut config = Config::default();
        config.recovery.failure_rate_threshold = 1.5;
        match ConfigLoader::validate(&config) {
            Err(ConfigError::InvalidThreshold { name, .. }) => assert_eq!(name, "failure_rate_threshold"),
            other => panic!("expected InvalidThreshold, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_backoff_and_weights() {
        let mut config = Config::default();
        config.retry.initial_backoff_ms = 30_000;
        config.retry.max_backoff_ms = 10_000;
        assert!(matches!(ConfigLoader::validate(&config), Err(ConfigError::InvalidBackoff(30_000, 10_000))));

        let mut config = Config::default();
        config.learning.weights.success = 0.0;
        config.learning.weights.quality = 0.0;
        config.learning.weights.speed = 0.0;
        config.learning.weights.usefulness = 0.0;
        assert!(matches!(ConfigLoader::validate(&config), Err(ConfigError::InvalidScoreWeights)));
    }

    #[test]
    fn test_validate_logging_names() {
        let mut config = Config::default();
        config.logging.rotation = "weekly".to_string();
        assert!(matches!(ConfigLoader::validate(&config), Err(ConfigError::InvalidLogRotation(_))));

        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(matches!(ConfigLoader::validate(&config), Err(ConfigError::InvalidLogFormat(_))));
    }

    #[test]
    fn test_env_overrides_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.yaml"),
            "resources:\n  max_concurrent_agents: 5\nlearning:\n  min_samples: 7\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("local.yaml"), "resources:\n  max_concurrent_agents: 6\n").unwrap();

        temp_env::with_vars(
            [
                ("ARBOR_RESOURCES__MAX_CONCURRENT_AGENTS", Some("9")),
                ("ARBOR_LOGGING__LEVEL", Some("warn")),
            ],
            || {
                let config = ConfigLoader::load_layered(dir.path()).unwrap();
                assert_eq!(config.resources.max_concurrent_agents, 9);
                assert_eq!(config.learning.min_samples, 7);
                assert_eq!(config.logging.level, "warn");
            },
        );
    }

    #[test]
    fn test_local_overrides_project_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.yaml"), "budget:\n  max_cost: 10.0\n").unwrap();
        std::fs::write(dir.path().join("local.yaml"), "budget:\n  max_cost: 25.0\n").unwrap();

        temp_env::with_vars_unset(["ARBOR_BUDGET__MAX_COST"], || {
            let config = ConfigLoader::load_layered(dir.path()).unwrap();
            assert!((config.budget.max_cost - 25.0).abs() < f64::EPSILON);
            assert_eq!(config.budget.agent_timeout_secs, 60);
        });
    }
}

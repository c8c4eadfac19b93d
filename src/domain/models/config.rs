use serde::{Deserialize, Serialize};

/// Main configuration structure for Arbor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Concurrency and recursion governance
    #[serde(default)]
    pub resources: ResourceConfig,

    /// Default cost and time budgets
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Retry policy for transient failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Monitoring cadence and recovery trigger thresholds
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Adaptive learning engine settings
    #[serde(default)]
    pub learning: LearningConfig,

    /// Strategy-specific tuning
    #[serde(default)]
    pub strategy: StrategyConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Resource governance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ResourceConfig {
    /// Maximum concurrently Active agents per top-level orchestrator (1-1000)
    #[serde(default = "default_max_concurrent_agents")]
    pub max_concurrent_agents: usize,

    /// Recursion-depth ceiling for nodes, agents and sub-orchestrators
    #[serde(default = "default_max_recursion_depth")]
    pub max_recursion_depth: u32,

    /// How long a reservation waits for free slots
    #[serde(default = "default_reserve_timeout_ms")]
    pub reserve_timeout_ms: u64,

    /// Upper bound on a sub-orchestrator's carved budget
    #[serde(default = "default_sub_orchestrator_max_agents")]
    pub sub_orchestrator_max_agents: usize,

    /// Maximum subtasks a decomposition may produce
    #[serde(default = "default_max_subtasks")]
    pub max_subtasks: usize,
}

const fn default_max_concurrent_agents() -> usize {
    20
}

const fn default_max_recursion_depth() -> u32 {
    8
}

const fn default_reserve_timeout_ms() -> u64 {
    30_000
}

const fn default_sub_orchestrator_max_agents() -> usize {
    8
}

const fn default_max_subtasks() -> usize {
    6
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: default_max_concurrent_agents(),
            max_recursion_depth: default_max_recursion_depth(),
            reserve_timeout_ms: default_reserve_timeout_ms(),
            sub_orchestrator_max_agents: default_sub_orchestrator_max_agents(),
            max_subtasks: default_max_subtasks(),
        }
    }
}

/// Budget configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BudgetConfig {
    /// Default cost budget per workflow
    #[serde(default = "default_max_cost")]
    pub max_cost: f64,

    /// Default wall-clock budget per workflow
    #[serde(default = "default_max_execution_time_secs")]
    pub max_execution_time_secs: u64,

    /// Timeout for a single executor call
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,

    /// Workflows with less time than this have a tight time budget
    #[serde(default = "default_tight_time_budget_secs")]
    pub tight_time_budget_secs: u64,
}

const fn default_max_cost() -> f64 {
    100.0
}

const fn default_max_execution_time_secs() -> u64 {
    7200
}

const fn default_agent_timeout_secs() -> u64 {
    60
}

const fn default_tight_time_budget_secs() -> u64 {
    3600
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_cost: default_max_cost(),
            max_execution_time_secs: default_max_execution_time_secs(),
            agent_timeout_secs: default_agent_timeout_secs(),
            tight_time_budget_secs: default_tight_time_budget_secs(),
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    1000
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Failure recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RecoveryConfig {
    /// Monitoring loop cadence
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    /// Fraction of the cost budget that trips cost_overrun_risk
    #[serde(default = "default_cost_overrun_threshold")]
    pub cost_overrun_threshold: f64,

    /// Failed/resolved ratio that trips high_failure_rate
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,

    /// Stalled coordination points tolerated before coordination_bottleneck
    #[serde(default = "default_stalled_coordination_limit")]
    pub stalled_coordination_limit: usize,

    /// How long an agent may sit in Waiting before it counts as stalled
    #[serde(default = "default_stall_after_secs")]
    pub stall_after_secs: u64,

    /// Fraction of the time budget that trips time_overrun_risk
    #[serde(default = "default_time_overrun_threshold")]
    pub time_overrun_threshold: f64,

    /// Rolling window for failure escalation and mining
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,

    /// Permanent recurrences that escalate into a failure pattern
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: usize,
}

const fn default_monitor_interval_ms() -> u64 {
    500
}

const fn default_cost_overrun_threshold() -> f64 {
    0.8
}

const fn default_failure_rate_threshold() -> f64 {
    0.3
}

const fn default_stalled_coordination_limit() -> usize {
    2
}

const fn default_stall_after_secs() -> u64 {
    300
}

const fn default_time_overrun_threshold() -> f64 {
    0.8
}

const fn default_failure_window_secs() -> u64 {
    86_400
}

const fn default_escalation_threshold() -> usize {
    3
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            monitor_interval_ms: default_monitor_interval_ms(),
            cost_overrun_threshold: default_cost_overrun_threshold(),
            failure_rate_threshold: default_failure_rate_threshold(),
            stalled_coordination_limit: default_stalled_coordination_limit(),
            stall_after_secs: default_stall_after_secs(),
            time_overrun_threshold: default_time_overrun_threshold(),
            failure_window_secs: default_failure_window_secs(),
            escalation_threshold: default_escalation_threshold(),
        }
    }
}

/// Relative weights of the score components. Normalized before use.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ScoreWeights {
    #[serde(default = "default_weight")]
    pub success: f64,
    #[serde(default = "default_weight")]
    pub quality: f64,
    #[serde(default = "default_weight")]
    pub speed: f64,
    #[serde(default = "default_weight")]
    pub usefulness: f64,
}

const fn default_weight() -> f64 {
    0.25
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            success: default_weight(),
            quality: default_weight(),
            speed: default_weight(),
            usefulness: default_weight(),
        }
    }
}

/// Adaptive learning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LearningConfig {
    /// Sliding window length in days
    #[serde(default = "default_window_days")]
    pub window_days: i64,

    /// Sliding window length in records
    #[serde(default = "default_window_max_records")]
    pub window_max_records: usize,

    /// Samples required before a pattern is reportable
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// Confidence at which a learned recommendation overrides the heuristics
    #[serde(default = "default_confidence_gate")]
    pub confidence_gate: f64,

    /// Ceiling on recommendation confidence
    #[serde(default = "default_max_confidence")]
    pub max_confidence: f64,

    /// Time-to-live of cached statistics
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Fraction of changed window records that invalidates the cache early
    #[serde(default = "default_invalidation_fraction")]
    pub invalidation_fraction: f64,

    /// Score component weights
    #[serde(default)]
    pub weights: ScoreWeights,

    /// Apply optimize_parameters to each workflow's timeout, retries and concurrency
    #[serde(default = "default_auto_tune")]
    pub auto_tune: bool,
}

const fn default_window_days() -> i64 {
    30
}

const fn default_window_max_records() -> usize {
    1000
}

const fn default_min_samples() -> usize {
    5
}

const fn default_confidence_gate() -> f64 {
    0.6
}

const fn default_max_confidence() -> f64 {
    0.98
}

const fn default_cache_ttl_secs() -> u64 {
    7200
}

const fn default_invalidation_fraction() -> f64 {
    0.1
}

const fn default_auto_tune() -> bool {
    true
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            window_max_records: default_window_max_records(),
            min_samples: default_min_samples(),
            confidence_gate: default_confidence_gate(),
            max_confidence: default_max_confidence(),
            cache_ttl_secs: default_cache_ttl_secs(),
            invalidation_fraction: default_invalidation_fraction(),
            weights: ScoreWeights::default(),
            auto_tune: default_auto_tune(),
        }
    }
}

/// Strategy-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StrategyConfig {
    /// Personas a council consults in parallel
    #[serde(default = "default_council_personas")]
    pub council_personas: Vec<String>,

    /// Maximum execute/validate/refine rounds
    #[serde(default = "default_max_refinement_rounds")]
    pub max_refinement_rounds: u32,

    /// Score change below which two rounds count as a plateau
    #[serde(default = "default_plateau_epsilon")]
    pub plateau_epsilon: f64,
}

fn default_council_personas() -> Vec<String> {
    ["engineer", "strategist", "dissenter", "analyst"]
        .into_iter()
        .map(String::from)
        .collect()
}

const fn default_max_refinement_rounds() -> u32 {
    3
}

const fn default_plateau_epsilon() -> f64 {
    0.01
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            council_personas: default_council_personas(),
            max_refinement_rounds: default_max_refinement_rounds(),
            plateau_epsilon: default_plateau_epsilon(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DatabaseConfig {
    /// `SQLite` connection URL
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of database connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_url() -> String {
    "sqlite:.arbor/arbor.db".to_string()
}

const fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stdout only when unset
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Rotation policy: daily, hourly or never
    #[serde(default = "default_rotation")]
    pub rotation: String,

    /// Number of days to retain logs
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

const fn default_retention_days() -> u32 {
    30
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
            retention_days: default_retention_days(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.resources.max_concurrent_agents, 20);
        assert_eq!(config.resources.max_recursion_depth, 8);
        assert_eq!(config.retry.max_retries, 3);
        assert!((config.learning.confidence_gate - 0.6).abs() < f64::EPSILON);
        assert_eq!(config.learning.min_samples, 5);
        assert_eq!(config.learning.cache_ttl_secs, 7200);
        assert_eq!(config.strategy.council_personas.len(), 4);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = "resources:\n  max_concurrent_agents: 2\nlearning:\n  min_samples: 3\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.resources.max_concurrent_agents, 2);
        assert_eq!(config.resources.max_recursion_depth, 8);
        assert_eq!(config.learning.min_samples, 3);
        assert_eq!(config.learning.window_days, 30);
    }
}

pub mod agent;
pub mod complexity;
pub mod config;
pub mod execution_record;
pub mod failure;
pub mod monitoring;
pub mod orchestrator;
pub mod strategy;
pub mod thought_tree;
pub mod workflow;

pub use agent::{Agent, AgentFailure, AgentKind, AgentStatus};
pub use complexity::{ComplexityBucket, ComplexityLevel, ComplexityProfile};
pub use config::{
    BudgetConfig, Config, DatabaseConfig, LearningConfig, LoggingConfig, RecoveryConfig,
    ResourceConfig, RetryConfig, ScoreWeights, StrategyConfig,
};
pub use execution_record::{ExecutionRecord, OutcomeScores, ResourceUsage};
pub use failure::{error_signature, FailureEvent, FailurePattern};
pub use monitoring::{RecoveryTrigger, StatusSnapshot, WorkflowPhase};
pub use orchestrator::{
    AgentLog, ContextEntry, OrchestratorKind, OrchestratorRecord, OrchestratorStatus,
};
pub use strategy::Strategy;
pub use thought_tree::{ImportanceLevel, NodeScores, NodeStatus, ThoughtTreeNode};
pub use workflow::{
    ExecutionContext, FailureTolerance, OptimizationFocus, OrchestratorResult, Priority,
    ResultError, Urgency, ValidationLevel, WorkflowInput, WorkflowRequest, WorkflowType,
};

//! Arbor - Recursive Orchestration Engine
//!
//! Arbor turns a goal into a persisted thought tree and executes it with a
//! strategy chosen per workflow: direct execution, sequential or parallel
//! decomposition, recursive sub-orchestration, a multi-perspective council or
//! iterative refinement. Concurrency is capped per workflow, transient
//! failures are retried, and every run feeds an adaptive learning engine that
//! refines later strategy choices.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): models, error taxonomy and port traits
//! - **Service Layer** (`services`): orchestration, selection, learning, recovery
//! - **Adapters** (`adapters`): persistence stores and work executors
//! - **Infrastructure Layer** (`infrastructure`): configuration and logging
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use arbor::adapters::{InMemoryStore, MockExecutor};
//! use arbor::{Config, OrchestrationEngine, WorkflowInput};
//!
//! # async fn run() {
//! let engine = OrchestrationEngine::new(
//!     Config::default(),
//!     Arc::new(MockExecutor::new()),
//!     Arc::new(InMemoryStore::new()),
//! );
//! let result = engine.submit(WorkflowInput::user_prompt("Summarize the release notes")).await;
//! assert!(result.success);
//! # }
//! ```

pub mod adapters;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::errors::{DomainError, DomainResult, ErrorKind, OrchestrationError};
pub use domain::models::{
    Agent, AgentKind, AgentStatus, ComplexityProfile, Config, ExecutionRecord, NodeStatus,
    OrchestratorResult, StatusSnapshot, Strategy, ThoughtTreeNode, WorkflowInput, WorkflowRequest,
    WorkflowType,
};
pub use domain::ports::{ExecutionError, PersistenceStore, WorkContext, WorkExecutor, WorkOutput, WorkPurpose};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use infrastructure::logging::{LogConfig, LoggerImpl};
pub use services::{LearningEngine, OrchestrationEngine, Orchestrator, WorkflowHandle};

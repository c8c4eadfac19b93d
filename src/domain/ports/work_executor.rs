//! Work executor port.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::models::AgentKind;

/// What an executor call is for. Executors may route or script on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "purpose", content = "role")]
pub enum WorkPurpose {
    /// Perform a unit of work.
    Execute,
    /// Break work into numbered subtasks.
    Decompose,
    /// Judge an output; pass unless the content asks for improvement.
    Validate,
    /// One council persona's perspective.
    Perspective(String),
    /// Merge council perspectives into one decision.
    Facilitate,
    /// Analyse recent failures before the remaining work continues.
    FailureAnalysis,
}

impl WorkPurpose {
    pub fn label(&self) -> String {
        match self {
            Self::Execute => "execute".to_string(),
            Self::Decompose => "decompose".to_string(),
            Self::Validate => "validate".to_string(),
            Self::Perspective(role) => format!("perspective:{role}"),
            Self::Facilitate => "facilitate".to_string(),
            Self::FailureAnalysis => "failure_analysis".to_string(),
        }
    }
}

/// Context passed alongside a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkContext {
    pub workflow_id: Uuid,
    pub agent_id: Uuid,
    pub agent_kind: AgentKind,
    pub node_id: Uuid,
    pub depth: u32,
    pub purpose: WorkPurpose,
    /// Zero-based attempt number; greater than zero on retries.
    pub attempt: u32,
    /// Inherited or predecessor context.
    pub inputs: HashMap<String, serde_json::Value>,
}

/// A successful executor response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkOutput {
    pub content: String,
    pub tokens: u64,
    pub cost: f64,
    /// `false` means the executor ran but rejected the work.
    pub success: bool,
}

impl WorkOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self { content: content.into(), tokens: 0, cost: 0.0, success: true }
    }
}

/// Executor failure classification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// Retryable, e.g. timeout or rate limit.
    #[error("transient: {0}")]
    Transient(String),
    /// Non-retryable, e.g. validation rejection or malformed input.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ExecutionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) => m,
        }
    }
}

impl fmt::Display for WorkPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// The external component that performs a unit of work (an LLM call or tool
/// invocation). Caching and model selection are internal to implementations.
#[async_trait]
pub trait WorkExecutor: Send + Sync {
    /// Collaborator name used in failure signatures.
    fn name(&self) -> &str;

    async fn execute(&self, prompt: &str, context: &WorkContext) -> Result<WorkOutput, ExecutionError>;
}

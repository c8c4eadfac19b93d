use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::errors::ErrorKind;

/// Agent lifecycle status.
///
/// ```text
/// Spawned -> Active -> Completed
///                   -> Waiting -> Coordinating -> Completed | Failed
/// any non-terminal  -> Failed
/// Completed | Failed -> Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Spawned,
    Active,
    Waiting,
    Coordinating,
    Completed,
    Failed,
    Terminated,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawned => "spawned",
            Self::Active => "active",
            Self::Waiting => "waiting",
            Self::Coordinating => "coordinating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        }
    }

    /// Completed, Failed or Terminated: the agent will do no further work.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Terminated)
    }

    /// Waiting or Coordinating: blocked on children.
    pub fn is_coordinating(&self) -> bool {
        matches!(self, Self::Waiting | Self::Coordinating)
    }

    pub fn valid_transitions(&self) -> Vec<AgentStatus> {
        match self {
            Self::Spawned => vec![Self::Active, Self::Failed],
            Self::Active => vec![Self::Completed, Self::Waiting, Self::Failed],
            Self::Waiting => vec![Self::Coordinating, Self::Failed],
            Self::Coordinating => vec![Self::Completed, Self::Failed],
            Self::Completed | Self::Failed => vec![Self::Terminated],
            Self::Terminated => vec![],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "spawned" => Ok(Self::Spawned),
            "active" => Ok(Self::Active),
            "waiting" => Ok(Self::Waiting),
            "coordinating" => Ok(Self::Coordinating),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "terminated" => Ok(Self::Terminated),
            _ => Err(format!("Invalid agent status: {s}")),
        }
    }
}

/// The closed set of agent kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Performs one unit of work through the work executor.
    Task,
    /// Runs persona perspectives in parallel and synthesizes a decision.
    Council,
    /// Judges the output of a refinement round.
    Validator,
    /// Recalls inherited context from the persistence store.
    Memory,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Council => "council",
            Self::Validator => "validator",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure details recorded on an agent that ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub retry_count: u32,
    /// Errors of failed children, when the agent failed during coordination.
    #[serde(default)]
    pub child_errors: Vec<String>,
}

/// An ephemeral unit of work. Agents live in an arena keyed by id; parent and
/// child links are ids, never references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub thought_tree_node_id: Uuid,
    pub orchestrator_id: Uuid,
    pub kind: AgentKind,
    pub status: AgentStatus,
    pub spawned_by: Option<Uuid>,
    pub children: Vec<Uuid>,
    pub recursion_depth: u32,
    pub max_recursion_depth: u32,
    pub context: HashMap<String, serde_json::Value>,
    /// Only populated while Waiting or Coordinating.
    pub coordination_state: HashMap<String, serde_json::Value>,
    pub retry_count: u32,
    pub failure: Option<AgentFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the agent entered Waiting, used for stall detection.
    pub waiting_since: Option<DateTime<Utc>>,
    pub version: u64,
}

impl Agent {
    /// Create a spawned agent. Fails if `recursion_depth` exceeds the ceiling.
    pub fn new(
        kind: AgentKind,
        thought_tree_node_id: Uuid,
        orchestrator_id: Uuid,
        recursion_depth: u32,
        max_recursion_depth: u32,
    ) -> Result<Self, String> {
        if recursion_depth > max_recursion_depth {
            return Err(format!(
                "Agent recursion depth {recursion_depth} exceeds maximum {max_recursion_depth}"
            ));
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            thought_tree_node_id,
            orchestrator_id,
            kind,
            status: AgentStatus::Spawned,
            spawned_by: None,
            children: Vec::new(),
            recursion_depth,
            max_recursion_depth,
            context: HashMap::new(),
            coordination_state: HashMap::new(),
            retry_count: 0,
            failure: None,
            created_at: now,
            updated_at: now,
            waiting_since: None,
            version: 1,
        })
    }

    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.spawned_by = Some(parent);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn transition_to(&mut self, new_status: AgentStatus) -> Result<(), String> {
        if !self.status.can_transition_to(new_status) {
            return Err(format!(
                "Cannot transition agent {} from {} to {}",
                self.id,
                self.status.as_str(),
                new_status.as_str()
            ));
        }

        self.status = new_status;
        self.updated_at = Utc::now();
        self.version += 1;

        match new_status {
            AgentStatus::Waiting => self.waiting_since = Some(self.updated_at),
            AgentStatus::Coordinating => {}
            _ => {
                self.waiting_since = None;
                self.coordination_state.clear();
            }
        }
        Ok(())
    }

    /// Fail the agent from any non-terminal state.
    pub fn fail(&mut self, failure: AgentFailure) -> Result<(), String> {
        self.transition_to(AgentStatus::Failed)?;
        self.retry_count = failure.retry_count;
        self.failure = Some(failure);
        Ok(())
    }
}

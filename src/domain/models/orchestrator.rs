//! Orchestrator records and the append-only context log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorKind {
    TopLevel,
    Sub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorStatus {
    #[default]
    Active,
    Paused,
    Completed,
    Failed,
}

impl OrchestratorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for OrchestratorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in an agent's write log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub agent_id: Uuid,
    /// Spawn order of the writing agent within its orchestrator; merge key.
    pub sequence: u64,
    pub key: String,
    pub value: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Single-writer log owned by one agent. Merged into the orchestrator's
/// global context only at synthesis points.
#[derive(Debug, Clone, Default)]
pub struct AgentLog {
    agent_id: Uuid,
    sequence: u64,
    entries: Vec<ContextEntry>,
}

impl AgentLog {
    pub fn new(agent_id: Uuid, sequence: u64) -> Self {
        Self { agent_id, sequence, entries: Vec::new() }
    }

    pub fn append(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.entries.push(ContextEntry {
            agent_id: self.agent_id,
            sequence: self.sequence,
            key: key.into(),
            value,
            recorded_at: Utc::now(),
        });
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn entries(&self) -> &[ContextEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<ContextEntry> {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Persisted state of one orchestrator instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorRecord {
    pub id: Uuid,
    pub parent_orchestrator_id: Option<Uuid>,
    pub thought_tree_node_id: Uuid,
    pub kind: OrchestratorKind,
    pub status: OrchestratorStatus,
    pub max_concurrent_agents: usize,
    pub current_active_agents: usize,
    pub global_context: Vec<ContextEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl OrchestratorRecord {
    pub fn new(
        id: Uuid,
        kind: OrchestratorKind,
        parent_orchestrator_id: Option<Uuid>,
        thought_tree_node_id: Uuid,
        max_concurrent_agents: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            parent_orchestrator_id,
            thought_tree_node_id,
            kind,
            status: OrchestratorStatus::Active,
            max_concurrent_agents,
            current_active_agents: 0,
            global_context: Vec::new(),
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_log_stamps_writer() {
        let agent_id = Uuid::new_v4();
        let mut log = AgentLog::new(agent_id, 7);
        log.append("output", serde_json::json!("partial"));
        log.append("tokens", serde_json::json!(120));

        assert_eq!(log.entries().len(), 2);
        assert!(log.entries().iter().all(|e| e.agent_id == agent_id && e.sequence == 7));
    }
}

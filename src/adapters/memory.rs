//! In-memory persistence store.
//!
//! Keeps every appended version, so tests can assert on write history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    Agent, ExecutionRecord, FailureEvent, FailurePattern, OrchestratorRecord, ThoughtTreeNode,
};
use crate::domain::ports::PersistenceStore;

type Versions<T> = Arc<RwLock<HashMap<Uuid, Vec<T>>>>;

#[derive(Clone, Default)]
pub struct InMemoryStore {
    nodes: Versions<ThoughtTreeNode>,
    agents: Versions<Agent>,
    orchestrators: Versions<OrchestratorRecord>,
    records: Versions<ExecutionRecord>,
    failure_events: Arc<RwLock<Vec<FailureEvent>>>,
    failure_patterns: Arc<RwLock<HashMap<String, FailurePattern>>>,
}

async fn append<T: Clone>(versions: &Versions<T>, id: Uuid, value: &T) {
    versions.write().await.entry(id).or_default().push(value.clone());
}

async fn latest<T: Clone>(versions: &Versions<T>, id: Uuid) -> Option<T> {
    versions.read().await.get(&id).and_then(|v| v.last().cloned())
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every version appended for a node, oldest first.
    pub async fn node_history(&self, id: Uuid) -> Vec<ThoughtTreeNode> {
        self.nodes.read().await.get(&id).cloned().unwrap_or_default()
    }

    /// Every version appended for an agent, oldest first.
    pub async fn agent_history(&self, id: Uuid) -> Vec<Agent> {
        self.agents.read().await.get(&id).cloned().unwrap_or_default()
    }

    pub async fn agents(&self) -> Vec<Agent> {
        self.agents.read().await.values().filter_map(|v| v.last().cloned()).collect()
    }

    pub async fn orchestrators(&self) -> Vec<OrchestratorRecord> {
        self.orchestrators.read().await.values().filter_map(|v| v.last().cloned()).collect()
    }

    pub async fn execution_records(&self) -> Vec<ExecutionRecord> {
        self.records.read().await.values().filter_map(|v| v.last().cloned()).collect()
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn save_node(&self, node: &ThoughtTreeNode) -> DomainResult<()> {
        let mut nodes = self.nodes.write().await;
        let versions = nodes.entry(node.id).or_default();
        if let Some(current) = versions.last() {
            if current.is_terminal() && current.status != node.status {
                return Err(DomainError::InvalidStateTransition {
                    from: current.status.as_str().to_string(),
                    to: node.status.as_str().to_string(),
                    reason: format!("node {} is already terminal", node.id),
                });
            }
        }
        versions.push(node.clone());
        Ok(())
    }

    async fn get_node(&self, id: Uuid) -> DomainResult<Option<ThoughtTreeNode>> {
        Ok(latest(&self.nodes, id).await)
    }

    async fn node_children(&self, parent_id: Uuid) -> DomainResult<Vec<ThoughtTreeNode>> {
        let mut children: Vec<ThoughtTreeNode> = self
            .nodes
            .read()
            .await
            .values()
            .filter_map(|v| v.last())
            .filter(|n| n.parent_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|n| n.created_at);
        Ok(children)
    }

    async fn node_version_count(&self, id: Uuid) -> DomainResult<usize> {
        Ok(self.nodes.read().await.get(&id).map_or(0, Vec::len))
    }

    async fn save_agent(&self, agent: &Agent) -> DomainResult<()> {
        append(&self.agents, agent.id, agent).await;
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> DomainResult<Option<Agent>> {
        Ok(latest(&self.agents, id).await)
    }

    async fn save_orchestrator(&self, record: &OrchestratorRecord) -> DomainResult<()> {
        append(&self.orchestrators, record.id, record).await;
        Ok(())
    }

    async fn get_orchestrator(&self, id: Uuid) -> DomainResult<Option<OrchestratorRecord>> {
        Ok(latest(&self.orchestrators, id).await)
    }

    async fn save_execution_record(&self, record: &ExecutionRecord) -> DomainResult<()> {
        append(&self.records, record.id, record).await;
        Ok(())
    }

    async fn get_execution_record(&self, id: Uuid) -> DomainResult<Option<ExecutionRecord>> {
        Ok(latest(&self.records, id).await)
    }

    async fn execution_records_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> DomainResult<Vec<ExecutionRecord>> {
        let mut records: Vec<ExecutionRecord> = self
            .records
            .read()
            .await
            .values()
            .filter_map(|v| v.last())
            .filter(|r| r.ended_at >= since)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.ended_at.cmp(&a.ended_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn save_failure_event(&self, event: &FailureEvent) -> DomainResult<()> {
        self.failure_events.write().await.push(event.clone());
        Ok(())
    }

    async fn failure_events_since(&self, since: DateTime<Utc>) -> DomainResult<Vec<FailureEvent>> {
        Ok(self
            .failure_events
            .read()
            .await
            .iter()
            .filter(|e| e.occurred_at >= since)
            .cloned()
            .collect())
    }

    async fn save_failure_pattern(&self, pattern: &FailurePattern) -> DomainResult<()> {
        let key = FailurePattern::key(&pattern.collaborator, &pattern.error_signature);
        self.failure_patterns.write().await.insert(key, pattern.clone());
        Ok(())
    }

    async fn failure_patterns(&self) -> DomainResult<Vec<FailurePattern>> {
        Ok(self.failure_patterns.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::NodeStatus;

    #[tokio::test]
    async fn test_node_versions_are_appended() {
        let store = InMemoryStore::new();
        let mut node = ThoughtTreeNode::root("goal");
        store.save_node(&node).await.unwrap();
        node.transition_to(NodeStatus::InProgress).unwrap();
        store.save_node(&node).await.unwrap();

        assert_eq!(store.node_version_count(node.id).await.unwrap(), 2);
        assert_eq!(store.get_node(node.id).await.unwrap().unwrap().status, NodeStatus::InProgress);
        assert_eq!(store.node_history(node.id).await[0].status, NodeStatus::Pending);
    }

    #[tokio::test]
    async fn test_terminal_node_cannot_be_reopened() {
        let store = InMemoryStore::new();
        let mut node = ThoughtTreeNode::root("goal");
        node.transition_to(NodeStatus::InProgress).unwrap();
        node.transition_to(NodeStatus::Completed).unwrap();
        store.save_node(&node).await.unwrap();

        let mut reopened = node.clone();
        reopened.status = NodeStatus::InProgress;
        let err = store.save_node(&reopened).await.unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));

        node.record("note", serde_json::json!("scored"));
        store.save_node(&node).await.unwrap();
        assert_eq!(store.node_version_count(node.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_children_and_windowed_records() {
        let store = InMemoryStore::new();
        let root = ThoughtTreeNode::root("goal");
        let child = root.child("step");
        store.save_node(&root).await.unwrap();
        store.save_node(&child).await.unwrap();
        let children = store.node_children(root.id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].depth, 1);

        let now = Utc::now();
        for offset in [1, 2, 40] {
            let ended = now - chrono::Duration::days(offset);
            let record = ExecutionRecord::new(
                Uuid::new_v4(),
                root.id,
                crate::domain::models::Strategy::DirectExecution,
                Default::default(),
                ended,
                ended,
            );
            store.save_execution_record(&record).await.unwrap();
        }
        let recent = store.execution_records_since(now - chrono::Duration::days(30), 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].ended_at > recent[1].ended_at);
        assert_eq!(store.execution_records_since(now - chrono::Duration::days(30), 1).await.unwrap().len(), 1);
    }
}

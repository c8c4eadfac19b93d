use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{
    Agent, ExecutionRecord, FailureEvent, FailurePattern, OrchestratorRecord, ThoughtTreeNode,
};

/// Append-only persistence for orchestration state.
///
/// Every `save_*` appends a new version; reads return the latest version.
/// Implementations reject node writes that would leave a terminal status.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn save_node(&self, node: &ThoughtTreeNode) -> DomainResult<()>;

    async fn get_node(&self, id: Uuid) -> DomainResult<Option<ThoughtTreeNode>>;

    /// Latest versions of every node whose parent is `parent_id`.
    async fn node_children(&self, parent_id: Uuid) -> DomainResult<Vec<ThoughtTreeNode>>;

    /// Number of versions appended for a node.
    async fn node_version_count(&self, id: Uuid) -> DomainResult<usize>;

    async fn save_agent(&self, agent: &Agent) -> DomainResult<()>;

    async fn get_agent(&self, id: Uuid) -> DomainResult<Option<Agent>>;

    async fn save_orchestrator(&self, record: &OrchestratorRecord) -> DomainResult<()>;

    async fn get_orchestrator(&self, id: Uuid) -> DomainResult<Option<OrchestratorRecord>>;

    async fn save_execution_record(&self, record: &ExecutionRecord) -> DomainResult<()>;

    async fn get_execution_record(&self, id: Uuid) -> DomainResult<Option<ExecutionRecord>>;

    /// Latest versions of records that ended at or after `since`, newest
    /// first, at most `limit`. May be stale.
    async fn execution_records_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> DomainResult<Vec<ExecutionRecord>>;

    async fn save_failure_event(&self, event: &FailureEvent) -> DomainResult<()>;

    async fn failure_events_since(&self, since: DateTime<Utc>) -> DomainResult<Vec<FailureEvent>>;

    /// Insert or replace the pattern for its (collaborator, signature) pair.
    async fn save_failure_pattern(&self, pattern: &FailurePattern) -> DomainResult<()>;

    async fn failure_patterns(&self) -> DomainResult<Vec<FailurePattern>>;
}

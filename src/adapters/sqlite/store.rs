//! SQLite implementation of the persistence store.
//!
//! Each entity table is append-only: a save inserts a new row and the row
//! with the highest `seq` for an id is the current version. Full entities
//! are kept as JSON in `payload`; the other columns exist for lookups.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{parse_datetime, parse_uuid};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    Agent, ExecutionRecord, FailureEvent, FailurePattern, OrchestratorRecord, ThoughtTreeNode,
};
use crate::domain::ports::PersistenceStore;

/// Fixed-width timestamps so text comparison orders them correctly.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode<T: DeserializeOwned>(payload: &str) -> DomainResult<T> {
    Ok(serde_json::from_str(payload)?)
}

fn decode_all<T: DeserializeOwned>(rows: Vec<(String,)>) -> DomainResult<Vec<T>> {
    rows.iter().map(|(payload,)| decode(payload)).collect()
}

#[derive(sqlx::FromRow)]
struct FailurePatternRow {
    id: String,
    collaborator: String,
    error_signature: String,
    occurrences: i64,
    first_seen: String,
    last_seen: String,
    sample_message: String,
}

impl TryFrom<FailurePatternRow> for FailurePattern {
    type Error = DomainError;

    fn try_from(row: FailurePatternRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            collaborator: row.collaborator,
            error_signature: row.error_signature,
            occurrences: usize::try_from(row.occurrences)
                .map_err(|e| DomainError::SerializationError(e.to_string()))?,
            first_seen: parse_datetime(&row.first_seen)?,
            last_seen: parse_datetime(&row.last_seen)?,
            sample_message: row.sample_message,
        })
    }
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn latest_payload(&self, table: &str, id: Uuid) -> DomainResult<Option<String>> {
        let sql = format!("SELECT payload FROM {table} WHERE id = ? ORDER BY seq DESC LIMIT 1");
        let row: Option<(String,)> =
            sqlx::query_as(&sql).bind(id.to_string()).fetch_optional(&self.pool).await?;
        Ok(row.map(|(payload,)| payload))
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl PersistenceStore for SqliteStore {
    async fn save_node(&self, node: &ThoughtTreeNode) -> DomainResult<()> {
        let payload = serde_json::to_string(node)?;
        let mut tx = self.pool.begin().await?;

        let current: Option<(String, bool)> = sqlx::query_as(
            "SELECT status, terminal FROM thought_tree_nodes WHERE id = ? ORDER BY seq DESC LIMIT 1",
        )
        .bind(node.id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((status, true)) = current {
            if status != node.status.as_str() {
                return Err(DomainError::InvalidStateTransition {
                    from: status,
                    to: node.status.as_str().to_string(),
                    reason: format!("node {} is already terminal", node.id),
                });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO thought_tree_nodes
                (id, parent_id, root_id, status, terminal, depth, version, created_at, saved_at, payload)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(node.id.to_string())
        .bind(node.parent_id.map(|id| id.to_string()))
        .bind(node.root_id.to_string())
        .bind(node.status.as_str())
        .bind(node.is_terminal())
        .bind(i64::from(node.depth))
        .bind(i64::try_from(node.version).unwrap_or(i64::MAX))
        .bind(timestamp(node.created_at))
        .bind(timestamp(Utc::now()))
        .bind(payload)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_node(&self, id: Uuid) -> DomainResult<Option<ThoughtTreeNode>> {
        self.latest_payload("thought_tree_nodes", id).await?.as_deref().map(decode).transpose()
    }

    async fn node_children(&self, parent_id: Uuid) -> DomainResult<Vec<ThoughtTreeNode>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT n.payload FROM thought_tree_nodes n
            WHERE n.parent_id = ?
              AND n.seq = (SELECT MAX(seq) FROM thought_tree_nodes WHERE id = n.id)
            ORDER BY n.created_at, n.seq
            "#,
        )
        .bind(parent_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        decode_all(rows)
    }

    async fn node_version_count(&self, id: Uuid) -> DomainResult<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM thought_tree_nodes WHERE id = ?")
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await?;
        usize::try_from(count).map_err(|e| DomainError::DatabaseError(e.to_string()))
    }

    async fn save_agent(&self, agent: &Agent) -> DomainResult<()> {
        sqlx::query(
            r#"
            INSERT INTO agents
                (id, orchestrator_id, thought_tree_node_id, kind, status, version, saved_at, payload)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(agent.id.to_string())
        .bind(agent.orchestrator_id.to_string())
        .bind(agent.thought_tree_node_id.to_string())
        .bind(agent.kind.as_str())
        .bind(agent.status.as_str())
        .bind(i64::try_from(agent.version).unwrap_or(i64::MAX))
        .bind(timestamp(Utc::now()))
        .bind(serde_json::to_string(agent)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> DomainResult<Option<Agent>> {
        self.latest_payload("agents", id).await?.as_deref().map(decode).transpose()
    }

    async fn save_orchestrator(&self, record: &OrchestratorRecord) -> DomainResult<()> {
        sqlx::query(
            r#"
            INSERT INTO orchestrators
                (id, parent_orchestrator_id, thought_tree_node_id, status, version, saved_at, payload)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.parent_orchestrator_id.map(|id| id.to_string()))
        .bind(record.thought_tree_node_id.to_string())
        .bind(record.status.as_str())
        .bind(i64::try_from(record.version).unwrap_or(i64::MAX))
        .bind(timestamp(Utc::now()))
        .bind(serde_json::to_string(record)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_orchestrator(&self, id: Uuid) -> DomainResult<Option<OrchestratorRecord>> {
        self.latest_payload("orchestrators", id).await?.as_deref().map(decode).transpose()
    }

    async fn save_execution_record(&self, record: &ExecutionRecord) -> DomainResult<()> {
        sqlx::query(
            r#"
            INSERT INTO execution_records
                (id, workflow_id, node_id, strategy, complexity, ended_at, version, saved_at, payload)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.workflow_id.to_string())
        .bind(record.node_id.to_string())
        .bind(record.strategy.as_str())
        .bind(record.bucket().as_str())
        .bind(timestamp(record.ended_at))
        .bind(i64::try_from(record.version).unwrap_or(i64::MAX))
        .bind(timestamp(Utc::now()))
        .bind(serde_json::to_string(record)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_execution_record(&self, id: Uuid) -> DomainResult<Option<ExecutionRecord>> {
        self.latest_payload("execution_records", id).await?.as_deref().map(decode).transpose()
    }

    async fn execution_records_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> DomainResult<Vec<ExecutionRecord>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT r.payload FROM execution_records r
            WHERE r.ended_at >= ?
              AND r.seq = (SELECT MAX(seq) FROM execution_records WHERE id = r.id)
            ORDER BY r.ended_at DESC
            LIMIT ?
            "#,
        )
        .bind(timestamp(since))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        decode_all(rows)
    }

    async fn save_failure_event(&self, event: &FailureEvent) -> DomainResult<()> {
        sqlx::query(
            r#"
            INSERT INTO failure_events
                (id, collaborator, error_signature, kind, message, agent_id, occurred_at, payload)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.id.to_string())
        .bind(&event.collaborator)
        .bind(&event.error_signature)
        .bind(event.kind.as_str())
        .bind(&event.message)
        .bind(event.agent_id.map(|id| id.to_string()))
        .bind(timestamp(event.occurred_at))
        .bind(serde_json::to_string(event)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn failure_events_since(&self, since: DateTime<Utc>) -> DomainResult<Vec<FailureEvent>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT payload FROM failure_events WHERE occurred_at >= ? ORDER BY occurred_at")
                .bind(timestamp(since))
                .fetch_all(&self.pool)
                .await?;
        decode_all(rows)
    }

    async fn save_failure_pattern(&self, pattern: &FailurePattern) -> DomainResult<()> {
        sqlx::query(
            r#"
            INSERT INTO failure_patterns
                (pattern_key, id, collaborator, error_signature, occurrences, first_seen, last_seen, sample_message)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(pattern_key) DO UPDATE SET
                occurrences = excluded.occurrences,
                last_seen = excluded.last_seen,
                sample_message = excluded.sample_message
            "#,
        )
        .bind(FailurePattern::key(&pattern.collaborator, &pattern.error_signature))
        .bind(pattern.id.to_string())
        .bind(&pattern.collaborator)
        .bind(&pattern.error_signature)
        .bind(i64::try_from(pattern.occurrences).unwrap_or(i64::MAX))
        .bind(timestamp(pattern.first_seen))
        .bind(timestamp(pattern.last_seen))
        .bind(&pattern.sample_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn failure_patterns(&self) -> DomainResult<Vec<FailurePattern>> {
        let rows: Vec<FailurePatternRow> = sqlx::query_as(
            r#"
            SELECT id, collaborator, error_signature, occurrences, first_seen, last_seen, sample_message
            FROM failure_patterns
            ORDER BY occurrences DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(FailurePattern::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;
    use crate::domain::errors::ErrorKind;
    use crate::domain::models::{NodeStatus, Strategy};

    async fn store() -> SqliteStore {
        SqliteStore::new(create_migrated_test_pool().await.unwrap())
    }

    #[tokio::test]
    async fn test_node_versions_and_terminal_guard() {
        let store = store().await;
        let mut node = ThoughtTreeNode::root("ship the release");
        store.save_node(&node).await.unwrap();
        node.transition_to(NodeStatus::InProgress).unwrap();
        store.save_node(&node).await.unwrap();
        node.transition_to(NodeStatus::Failed).unwrap();
        store.save_node(&node).await.unwrap();

        let mut reopened = node.clone();
        reopened.status = NodeStatus::Completed;
        assert!(matches!(
            store.save_node(&reopened).await.unwrap_err(),
            DomainError::InvalidStateTransition { .. }
        ));

        assert_eq!(store.node_version_count(node.id).await.unwrap(), 3);
        assert_eq!(store.get_node(node.id).await.unwrap().unwrap().status, NodeStatus::Failed);
        assert!(store.get_node(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_children_return_latest_versions() {
        let store = store().await;
        let root = ThoughtTreeNode::root("goal");
        let mut child = root.child("step");
        store.save_node(&root).await.unwrap();
        store.save_node(&child).await.unwrap();
        child.transition_to(NodeStatus::Completed).unwrap();
        store.save_node(&child).await.unwrap();

        let children = store.node_children(root.id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].status, NodeStatus::Completed);
    }

    #[tokio::test]
    async fn test_records_window_uses_latest_version() {
        let store = store().await;
        let now = Utc::now();
        let mut record = ExecutionRecord::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Strategy::ParallelExecution,
            Default::default(),
            now,
            now,
        );
        store.save_execution_record(&record).await.unwrap();
        record.feedback = Some(0.5);
        record.version += 1;
        store.save_execution_record(&record).await.unwrap();

        let old_end = now - chrono::Duration::days(45);
        let old = ExecutionRecord::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Strategy::DirectExecution,
            Default::default(),
            old_end,
            old_end,
        );
        store.save_execution_record(&old).await.unwrap();

        let recent = store.execution_records_since(now - chrono::Duration::days(30), 100).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].feedback, Some(0.5));
        assert_eq!(store.get_execution_record(record.id).await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_failure_patterns_upsert_by_key() {
        let store = store().await;
        let event = FailureEvent::new("mock", ErrorKind::Permanent, "malformed request: step 3");
        store.save_failure_event(&event).await.unwrap();
        let events = store.failure_events_since(Utc::now() - chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(events, vec![event.clone()]);

        let mut pattern = FailurePattern {
            id: Uuid::new_v4(),
            collaborator: event.collaborator.clone(),
            error_signature: event.error_signature.clone(),
            occurrences: 1,
            first_seen: event.occurred_at,
            last_seen: event.occurred_at,
            sample_message: event.message.clone(),
        };
        store.save_failure_pattern(&pattern).await.unwrap();
        pattern.occurrences = 2;
        store.save_failure_pattern(&pattern).await.unwrap();

        let patterns = store.failure_patterns().await.unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].occurrences, 2);
    }
}

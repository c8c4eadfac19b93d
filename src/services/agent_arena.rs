//! Arena of agent records for one orchestrator.
//!
//! Agents reference each other only by id. Traversal is lookup-based, so
//! parent/child graphs never form ownership cycles.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Agent, AgentFailure, AgentStatus};

/// Status counts across the arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaCounts {
    pub total: usize,
    pub spawned: usize,
    pub active: usize,
    pub coordinating: usize,
    pub completed: usize,
    pub failed: usize,
}

impl ArenaCounts {
    pub fn resolved(&self) -> usize {
        self.completed + self.failed
    }
}

#[derive(Debug, Default)]
struct ArenaState {
    agents: HashMap<Uuid, Agent>,
    /// Nested sub-orchestrators per parent agent, with their resolution flag.
    sub_orchestrators: HashMap<Uuid, HashMap<Uuid, bool>>,
    /// Terminal status each agent reached before Terminated.
    outcomes: HashMap<Uuid, AgentStatus>,
}

#[derive(Debug, Default)]
pub struct AgentArena {
    state: RwLock<ArenaState>,
    next_sequence: AtomicU64,
}

fn not_found(id: Uuid) -> DomainError {
    DomainError::AgentNotFound(id)
}

fn invalid(err: String, from: AgentStatus, to: AgentStatus) -> DomainError {
    DomainError::InvalidStateTransition { from: from.to_string(), to: to.to_string(), reason: err }
}

impl AgentArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a spawned agent, linking it under its parent. Returns the
    /// agent's spawn sequence number.
    pub async fn insert(&self, agent: Agent) -> DomainResult<u64> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::AcqRel);
        let mut state = self.state.write().await;
        if let Some(parent_id) = agent.spawned_by {
            let parent = state.agents.get_mut(&parent_id).ok_or_else(|| not_found(parent_id))?;
            parent.children.push(agent.id);
        }
        state.agents.insert(agent.id, agent);
        Ok(sequence)
    }

    pub async fn get(&self, id: Uuid) -> Option<Agent> {
        self.state.read().await.agents.get(&id).cloned()
    }

    pub async fn children(&self, id: Uuid) -> Vec<Agent> {
        let state = self.state.read().await;
        state
            .agents
            .get(&id)
            .map(|parent| parent.children.iter().filter_map(|c| state.agents.get(c).cloned()).collect())
            .unwrap_or_default()
    }

    pub async fn transition(&self, id: Uuid, to: AgentStatus) -> DomainResult<Agent> {
        let mut state = self.state.write().await;

        if to == AgentStatus::Coordinating {
            let pending = Self::unresolved_children(&state, id);
            if pending > 0 {
                return Err(DomainError::InvalidStateTransition {
                    from: AgentStatus::Waiting.to_string(),
                    to: to.to_string(),
                    reason: format!("{pending} child unit(s) have not reached a terminal state"),
                });
            }
        }

        let agent = state.agents.get_mut(&id).ok_or_else(|| not_found(id))?;
        let from = agent.status;
        agent.transition_to(to).map_err(|e| invalid(e, from, to))?;
        let snapshot = agent.clone();
        if matches!(to, AgentStatus::Completed | AgentStatus::Failed) {
            state.outcomes.insert(id, to);
        }
        Ok(snapshot)
    }

    pub async fn fail(&self, id: Uuid, failure: AgentFailure) -> DomainResult<Agent> {
        let mut state = self.state.write().await;
        let agent = state.agents.get_mut(&id).ok_or_else(|| not_found(id))?;
        let from = agent.status;
        agent.fail(failure).map_err(|e| invalid(e, from, AgentStatus::Failed))?;
        let snapshot = agent.clone();
        state.outcomes.insert(id, AgentStatus::Failed);
        Ok(snapshot)
    }

    /// Record a value in the agent's coordination state.
    pub async fn set_coordination(&self, id: Uuid, key: &str, value: serde_json::Value) -> DomainResult<()> {
        let mut state = self.state.write().await;
        let agent = state.agents.get_mut(&id).ok_or_else(|| not_found(id))?;
        if agent.status.is_coordinating() {
            agent.coordination_state.insert(key.to_string(), value);
        }
        Ok(())
    }

    pub async fn record_retries(&self, id: Uuid, retries: u32) -> DomainResult<()> {
        let mut state = self.state.write().await;
        let agent = state.agents.get_mut(&id).ok_or_else(|| not_found(id))?;
        agent.retry_count = retries;
        Ok(())
    }

    pub async fn register_sub_orchestrator(&self, parent_agent: Uuid, orchestrator_id: Uuid) {
        self.state
            .write()
            .await
            .sub_orchestrators
            .entry(parent_agent)
            .or_default()
            .insert(orchestrator_id, false);
    }

    pub async fn resolve_sub_orchestrator(&self, parent_agent: Uuid, orchestrator_id: Uuid) {
        if let Some(children) = self.state.write().await.sub_orchestrators.get_mut(&parent_agent) {
            children.insert(orchestrator_id, true);
        }
    }

    pub async fn all_children_terminal(&self, id: Uuid) -> bool {
        Self::unresolved_children(&*self.state.read().await, id) == 0
    }

    fn unresolved_children(state: &ArenaState, id: Uuid) -> usize {
        let agents = state
            .agents
            .get(&id)
            .map(|a| {
                a.children
                    .iter()
                    .filter(|c| state.agents.get(c).is_some_and(|child| !child.status.is_terminal()))
                    .count()
            })
            .unwrap_or(0);
        let orchestrators = state
            .sub_orchestrators
            .get(&id)
            .map(|children| children.values().filter(|resolved| !**resolved).count())
            .unwrap_or(0);
        agents + orchestrators
    }

    pub async fn counts(&self) -> ArenaCounts {
        let state = self.state.read().await;
        let mut counts = ArenaCounts { total: state.agents.len(), ..ArenaCounts::default() };
        for agent in state.agents.values() {
            match agent.status {
                AgentStatus::Spawned => counts.spawned += 1,
                AgentStatus::Active => counts.active += 1,
                AgentStatus::Waiting | AgentStatus::Coordinating => counts.coordinating += 1,
                AgentStatus::Completed => counts.completed += 1,
                AgentStatus::Failed => counts.failed += 1,
                AgentStatus::Terminated => match state.outcomes.get(&agent.id) {
                    Some(AgentStatus::Failed) => counts.failed += 1,
                    _ => counts.completed += 1,
                },
            }
        }
        counts
    }

    /// Distinct agents that have sat in Waiting for longer than `threshold`.
    pub async fn stalled_coordination_points(&self, threshold: Duration) -> usize {
        let threshold = ChronoDuration::from_std(threshold).unwrap_or_else(|_| ChronoDuration::days(36_500));
        let now = Utc::now();
        self.state
            .read()
            .await
            .agents
            .values()
            .filter(|a| a.status == AgentStatus::Waiting)
            .filter(|a| a.waiting_since.is_some_and(|since| now - since > threshold))
            .count()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.agents.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn all(&self) -> Vec<Agent> {
        self.state.read().await.agents.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::ErrorKind;
    use crate::domain::models::AgentKind;

    fn agent(parent: Option<Uuid>, depth: u32) -> Agent {
        let a = Agent::new(AgentKind::Task, Uuid::new_v4(), Uuid::new_v4(), depth, 8).unwrap();
        match parent {
            Some(p) => a.with_parent(p),
            None => a,
        }
    }

    #[tokio::test]
    async fn test_children_are_linked_by_id() {
        let arena = AgentArena::new();
        let parent = agent(None, 0);
        let parent_id = parent.id;
        arena.insert(parent).await.unwrap();

        let first = arena.insert(agent(Some(parent_id), 1)).await.unwrap();
        let second = arena.insert(agent(Some(parent_id), 1)).await.unwrap();
        assert!(second > first);

        let children = arena.children(parent_id).await;
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|c| c.spawned_by == Some(parent_id)));
    }

    #[tokio::test]
    async fn test_coordination_waits_for_all_children() {
        let arena = AgentArena::new();
        let parent = agent(None, 0);
        let parent_id = parent.id;
        arena.insert(parent).await.unwrap();
        arena.transition(parent_id, AgentStatus::Active).await.unwrap();
        arena.transition(parent_id, AgentStatus::Waiting).await.unwrap();

        let child = agent(Some(parent_id), 1);
        let child_id = child.id;
        arena.insert(child).await.unwrap();
        arena.transition(child_id, AgentStatus::Active).await.unwrap();

        assert!(arena.transition(parent_id, AgentStatus::Coordinating).await.is_err());

        arena
            .fail(child_id, AgentFailure {
                kind: ErrorKind::Permanent,
                message: "rejected".into(),
                retry_count: 0,
                child_errors: vec![],
            })
            .await
            .unwrap();
        arena.transition(parent_id, AgentStatus::Coordinating).await.unwrap();
        arena.transition(parent_id, AgentStatus::Completed).await.unwrap();

        let counts = arena.counts().await;
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 1);
    }

    #[tokio::test]
    async fn test_sub_orchestrators_block_coordination() {
        let arena = AgentArena::new();
        let parent = agent(None, 0);
        let parent_id = parent.id;
        arena.insert(parent).await.unwrap();
        arena.transition(parent_id, AgentStatus::Active).await.unwrap();
        arena.transition(parent_id, AgentStatus::Waiting).await.unwrap();

        let sub = Uuid::new_v4();
        arena.register_sub_orchestrator(parent_id, sub).await;
        assert!(!arena.all_children_terminal(parent_id).await);

        arena.resolve_sub_orchestrator(parent_id, sub).await;
        assert!(arena.all_children_terminal(parent_id).await);
    }

    #[tokio::test]
    async fn test_terminated_agents_keep_outcome_in_counts() {
        let arena = AgentArena::new();
        let a = agent(None, 0);
        let id = a.id;
        arena.insert(a).await.unwrap();
        arena.transition(id, AgentStatus::Active).await.unwrap();
        arena.transition(id, AgentStatus::Completed).await.unwrap();
        arena.transition(id, AgentStatus::Terminated).await.unwrap();

        assert_eq!(arena.counts().await.completed, 1);
    }

    #[tokio::test]
    async fn test_stalled_detection() {
        let arena = AgentArena::new();
        let a = agent(None, 0);
        let id = a.id;
        arena.insert(a).await.unwrap();
        arena.transition(id, AgentStatus::Active).await.unwrap();
        arena.transition(id, AgentStatus::Waiting).await.unwrap();

        assert_eq!(arena.stalled_coordination_points(Duration::from_secs(60)).await, 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(arena.stalled_coordination_points(Duration::ZERO).await, 1);
    }
}

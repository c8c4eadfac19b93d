//! Orchestrator global context: copy-on-read views over an append-only log.
//!
//! Agents never write here directly. Each agent appends to its own
//! [`AgentLog`]; logs are merged in spawn order at synthesis points.

use std::sync::{Arc, PoisonError, RwLock};

use crate::domain::models::{AgentLog, ContextEntry};

#[derive(Debug, Default)]
pub struct GlobalContext {
    entries: RwLock<Arc<Vec<ContextEntry>>>,
}

impl GlobalContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the log. Later merges do not affect a taken view.
    pub fn view(&self) -> Arc<Vec<ContextEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Append `logs` ordered by writer sequence. Returns the number of entries added.
    pub fn merge(&self, mut logs: Vec<AgentLog>) -> usize {
        logs.sort_by_key(AgentLog::sequence);
        let added: Vec<ContextEntry> = logs.into_iter().flat_map(AgentLog::into_entries).collect();
        if added.is_empty() {
            return 0;
        }
        let count = added.len();

        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::with_capacity(guard.len() + count);
        next.extend(guard.iter().cloned());
        next.extend(added);
        *guard = Arc::new(next);
        count
    }

    /// Most recent value written under `key`.
    pub fn latest(&self, key: &str) -> Option<serde_json::Value> {
        self.view().iter().rev().find(|e| e.key == key).map(|e| e.value.clone())
    }

    pub fn len(&self) -> usize {
        self.view().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn log(sequence: u64, value: &str) -> AgentLog {
        let mut log = AgentLog::new(Uuid::new_v4(), sequence);
        log.append("output", json!(value));
        log
    }

    #[test]
    fn test_merge_orders_by_sequence() {
        let context = GlobalContext::new();
        context.merge(vec![log(2, "c"), log(0, "a"), log(1, "b")]);
        let values: Vec<_> = context.view().iter().map(|e| e.value.clone()).collect();
        assert_eq!(values, vec![json!("a"), json!("b"), json!("c")]);
        assert_eq!(context.latest("output"), Some(json!("c")));
    }

    #[test]
    fn test_views_are_isolated_from_later_merges() {
        let context = GlobalContext::new();
        context.merge(vec![log(0, "first")]);
        let view = context.view();
        context.merge(vec![log(1, "second")]);
        assert_eq!(view.len(), 1);
        assert_eq!(context.len(), 2);
    }

    #[test]
    fn test_empty_logs_are_ignored() {
        let context = GlobalContext::new();
        assert_eq!(context.merge(vec![AgentLog::new(Uuid::new_v4(), 0)]), 0);
        assert!(context.is_empty());
    }
}

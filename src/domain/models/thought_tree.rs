//! Thought tree domain model.
//!
//! A thought tree is the persisted hierarchy of goals, subtasks and outcomes
//! produced while executing a workflow. Nodes are never deleted; terminal
//! statuses are final.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Status of a thought tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Valid transitions from this status. Terminal statuses have none.
    pub fn valid_transitions(&self) -> Vec<NodeStatus> {
        match self {
            Self::Pending => vec![Self::InProgress, Self::Completed, Self::Failed, Self::Cancelled],
            Self::InProgress => vec![Self::Completed, Self::Failed, Self::Cancelled],
            Self::Completed | Self::Failed | Self::Cancelled => vec![],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid node status: {s}")),
        }
    }
}

/// Importance of a node relative to its siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ImportanceLevel {
    Low,
    #[default]
    Medium,
    High,
}

/// Outcome scores attached to a node once the learning engine has scored it.
/// Every component lies in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct NodeScores {
    pub success: f64,
    pub quality: f64,
    pub speed: f64,
    pub usefulness: f64,
    pub overall_weight: f64,
}

/// A persisted record of one goal, subtask or outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThoughtTreeNode {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub root_id: Uuid,
    pub goal: String,
    pub status: NodeStatus,
    pub depth: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub scores: Option<NodeScores>,
    pub importance_level: ImportanceLevel,
    pub metadata: HashMap<String, serde_json::Value>,
    /// Incremented on every owner mutation; each version is appended to the store.
    pub version: u64,
}

impl ThoughtTreeNode {
    /// Create a root node (depth 0) that is its own root.
    pub fn root(goal: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            parent_id: None,
            root_id: id,
            goal: goal.into(),
            status: NodeStatus::Pending,
            depth: 0,
            created_at: Utc::now(),
            completed_at: None,
            scores: None,
            importance_level: ImportanceLevel::default(),
            metadata: HashMap::new(),
            version: 1,
        }
    }

    /// Create a child one level below `self`, sharing its root.
    pub fn child(&self, goal: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: Some(self.id),
            root_id: self.root_id,
            goal: goal.into(),
            status: NodeStatus::Pending,
            depth: self.depth + 1,
            created_at: Utc::now(),
            completed_at: None,
            scores: None,
            importance_level: ImportanceLevel::default(),
            metadata: HashMap::new(),
            version: 1,
        }
    }

    pub fn with_importance(mut self, importance: ImportanceLevel) -> Self {
        self.importance_level = importance;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transition to a new status. Terminal statuses are final.
    pub fn transition_to(&mut self, new_status: NodeStatus) -> Result<(), String> {
        if !self.status.can_transition_to(new_status) {
            return Err(format!(
                "Cannot transition node from {} to {}",
                self.status.as_str(),
                new_status.as_str()
            ));
        }

        self.status = new_status;
        self.version += 1;
        if new_status.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Record an outcome value in the metadata map.
    pub fn record(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.insert(key.into(), value);
        self.version += 1;
    }

    pub fn set_scores(&mut self, scores: NodeScores) {
        self.scores = Some(scores);
        self.version += 1;
    }

    /// Check the structural invariants against the parent node, if any.
    pub fn validate_against(&self, parent: Option<&ThoughtTreeNode>) -> Result<(), String> {
        match parent {
            None => {
                if self.parent_id.is_some() {
                    return Err(format!("Node {} names a parent that was not supplied", self.id));
                }
                if self.depth != 0 {
                    return Err(format!("Root node {} must have depth 0, found {}", self.id, self.depth));
                }
                if self.root_id != self.id {
                    return Err(format!("Root node {} must be its own root", self.id));
                }
            }
            Some(parent) => {
                if self.parent_id != Some(parent.id) {
                    return Err(format!("Node {} is not a child of {}", self.id, parent.id));
                }
                if self.depth != parent.depth + 1 {
                    return Err(format!(
                        "Node {} depth {} must equal parent depth {} + 1",
                        self.id, self.depth, parent.depth
                    ));
                }
                if self.root_id != parent.root_id {
                    return Err(format!("Node {} does not share its parent's root", self.id));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_depth_and_root() {
        let root = ThoughtTreeNode::root("improve performance");
        let child = root.child("profile hot paths");
        let grandchild = child.child("flamegraph the parser");

        assert_eq!(root.depth, 0);
        assert_eq!(child.depth, 1);
        assert_eq!(grandchild.depth, 2);
        assert_eq!(grandchild.root_id, root.id);
        assert!(child.validate_against(Some(&root)).is_ok());
        assert!(grandchild.validate_against(Some(&child)).is_ok());
        assert!(root.validate_against(None).is_ok());
        assert!(grandchild.validate_against(Some(&root)).is_err());
    }

    #[test]
    fn test_terminal_status_is_final() {
        let mut node = ThoughtTreeNode::root("goal");
        node.transition_to(NodeStatus::InProgress).unwrap();
        node.transition_to(NodeStatus::Completed).unwrap();
        assert!(node.completed_at.is_some());

        assert!(node.transition_to(NodeStatus::Failed).is_err());
        assert!(node.transition_to(NodeStatus::InProgress).is_err());
        assert_eq!(node.status, NodeStatus::Completed);
    }

    #[test]
    fn test_version_increments_on_mutation() {
        let mut node = ThoughtTreeNode::root("goal");
        assert_eq!(node.version, 1);
        node.transition_to(NodeStatus::InProgress).unwrap();
        node.record("result", serde_json::json!("done"));
        assert_eq!(node.version, 3);
    }

    #[test]
    fn test_node_status_from_str() {
        assert_eq!("in_progress".parse::<NodeStatus>().unwrap(), NodeStatus::InProgress);
        assert_eq!("CANCELLED".parse::<NodeStatus>().unwrap(), NodeStatus::Cancelled);
        assert!("archived".parse::<NodeStatus>().is_err());
    }
}

//! Workflow submission and result types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use super::complexity::ComplexityLevel;
use super::strategy::Strategy;
use crate::domain::errors::ErrorKind;

/// The typed payload of a workflow submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowRequest {
    UserPrompt {
        prompt: String,
    },
    StructuredTask {
        objective: String,
        #[serde(default)]
        deliverables: Vec<String>,
        #[serde(default)]
        technical_requirements: Vec<String>,
        #[serde(default)]
        constraints: Vec<String>,
    },
    GoalWorkflow {
        goal: String,
        #[serde(default)]
        success_criteria: Vec<String>,
    },
    ScheduledTrigger {
        schedule: String,
        task: String,
    },
    ReactiveTrigger {
        event: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
    Continuation {
        parent_node_id: Uuid,
        follow_up: String,
        #[serde(default)]
        inherit_context: bool,
    },
}

/// Discriminant of [`WorkflowRequest`], used for logging and strategy rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    UserPrompt,
    StructuredTask,
    GoalWorkflow,
    ScheduledTrigger,
    ReactiveTrigger,
    Continuation,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserPrompt => "user_prompt",
            Self::StructuredTask => "structured_task",
            Self::GoalWorkflow => "goal_workflow",
            Self::ScheduledTrigger => "scheduled_trigger",
            Self::ReactiveTrigger => "reactive_trigger",
            Self::Continuation => "continuation",
        }
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl WorkflowRequest {
    pub fn workflow_type(&self) -> WorkflowType {
        match self {
            Self::UserPrompt { .. } => WorkflowType::UserPrompt,
            Self::StructuredTask { .. } => WorkflowType::StructuredTask,
            Self::GoalWorkflow { .. } => WorkflowType::GoalWorkflow,
            Self::ScheduledTrigger { .. } => WorkflowType::ScheduledTrigger,
            Self::ReactiveTrigger { .. } => WorkflowType::ReactiveTrigger,
            Self::Continuation { .. } => WorkflowType::Continuation,
        }
    }

    /// The goal text a thought tree node is created for.
    pub fn goal_text(&self) -> String {
        match self {
            Self::UserPrompt { prompt } => prompt.clone(),
            Self::StructuredTask { objective, .. } => objective.clone(),
            Self::GoalWorkflow { goal, .. } => goal.clone(),
            Self::ScheduledTrigger { task, .. } => task.clone(),
            Self::ReactiveTrigger { event, payload } => {
                if payload.is_null() {
                    format!("React to event: {event}")
                } else {
                    format!("React to event: {event} ({payload})")
                }
            }
            Self::Continuation { follow_up, .. } => follow_up.clone(),
        }
    }

    /// Explicit work items carried by the request, if any.
    pub fn explicit_items(&self) -> &[String] {
        match self {
            Self::StructuredTask { deliverables, .. } => deliverables,
            Self::GoalWorkflow { success_criteria, .. } => success_criteria,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Acceptable fraction of failed children before a coordinating agent fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureTolerance {
    Low,
    #[default]
    Medium,
    High,
}

impl FailureTolerance {
    pub fn max_failure_fraction(&self) -> f64 {
        match self {
            Self::Low => 0.0,
            Self::Medium => 0.3,
            Self::High => 0.5,
        }
    }

    /// Whether `failed` out of `total` children is within tolerance.
    pub fn accepts(&self, failed: usize, total: usize) -> bool {
        if total == 0 {
            return true;
        }
        #[allow(clippy::cast_precision_loss)]
        let fraction = failed as f64 / total as f64;
        fraction <= self.max_failure_fraction() + f64::EPSILON
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationFocus {
    Speed,
    Quality,
    Cost,
    #[default]
    Balanced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Minimal,
    #[default]
    Standard,
    Strict,
    Critical,
}

/// Caller-supplied execution preferences and limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ExecutionContext {
    pub failure_tolerance: FailureTolerance,
    pub optimization_focus: OptimizationFocus,
    pub validation_level: ValidationLevel,
    /// Explicit risk override; the analyzer derives risk from urgency otherwise.
    pub risk_level: Option<ComplexityLevel>,
    pub data_sources: Vec<String>,
    pub max_cost: Option<f64>,
    pub max_execution_time_secs: Option<u64>,
    /// Execute the council's decision as a follow-up task.
    pub execute_council_decision: bool,
    pub extra: HashMap<String, serde_json::Value>,
}

/// A workflow submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInput {
    pub id: Uuid,
    pub request: WorkflowRequest,
    #[serde(default)]
    pub execution_context: ExecutionContext,
    #[serde(default)]
    pub domain_context: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub user_context: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub urgency: Urgency,
}

impl WorkflowInput {
    pub fn new(request: WorkflowRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            execution_context: ExecutionContext::default(),
            domain_context: HashMap::new(),
            user_context: HashMap::new(),
            priority: Priority::default(),
            urgency: Urgency::default(),
        }
    }

    pub fn user_prompt(prompt: impl Into<String>) -> Self {
        Self::new(WorkflowRequest::UserPrompt { prompt: prompt.into() })
    }

    pub fn goal(goal: impl Into<String>, success_criteria: Vec<String>) -> Self {
        Self::new(WorkflowRequest::GoalWorkflow { goal: goal.into(), success_criteria })
    }

    pub fn structured_task(objective: impl Into<String>, deliverables: Vec<String>) -> Self {
        Self::new(WorkflowRequest::StructuredTask {
            objective: objective.into(),
            deliverables,
            technical_requirements: Vec::new(),
            constraints: Vec::new(),
        })
    }

    pub fn continuation(parent_node_id: Uuid, follow_up: impl Into<String>, inherit_context: bool) -> Self {
        Self::new(WorkflowRequest::Continuation {
            parent_node_id,
            follow_up: follow_up.into(),
            inherit_context,
        })
    }

    pub fn with_context(mut self, execution_context: ExecutionContext) -> Self {
        self.execution_context = execution_context;
        self
    }

    pub fn with_failure_tolerance(mut self, tolerance: FailureTolerance) -> Self {
        self.execution_context.failure_tolerance = tolerance;
        self
    }

    pub fn with_focus(mut self, focus: OptimizationFocus) -> Self {
        self.execution_context.optimization_focus = focus;
        self
    }

    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }

    pub fn with_user_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.user_context.insert(key.into(), value);
        self
    }

    pub fn workflow_type(&self) -> WorkflowType {
        self.request.workflow_type()
    }

    /// Caller-supplied alignment signal in `[0, 1]`, if present.
    pub fn alignment(&self) -> Option<f64> {
        self.user_context
            .get("alignment")
            .and_then(serde_json::Value::as_f64)
            .map(|a| a.clamp(0.0, 1.0))
    }

    /// Normalize the submission: trim text and drop empty work items.
    pub fn normalized(mut self) -> Self {
        fn clean(items: &mut Vec<String>) {
            for item in items.iter_mut() {
                *item = item.trim().to_string();
            }
            items.retain(|s| !s.is_empty());
        }

        match &mut self.request {
            WorkflowRequest::UserPrompt { prompt } => *prompt = prompt.trim().to_string(),
            WorkflowRequest::StructuredTask { objective, deliverables, technical_requirements, constraints } => {
                *objective = objective.trim().to_string();
                clean(deliverables);
                clean(technical_requirements);
                clean(constraints);
            }
            WorkflowRequest::GoalWorkflow { goal, success_criteria } => {
                *goal = goal.trim().to_string();
                clean(success_criteria);
            }
            WorkflowRequest::ScheduledTrigger { task, .. } => *task = task.trim().to_string(),
            WorkflowRequest::ReactiveTrigger { event, .. } => *event = event.trim().to_string(),
            WorkflowRequest::Continuation { follow_up, .. } => *follow_up = follow_up.trim().to_string(),
        }
        clean(&mut self.execution_context.data_sources);
        self
    }
}

/// Diagnostic detail attached to every failed result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultError {
    /// The failing unit, e.g. `agent 3f2a... (task)` or `orchestrator 9c1e...`.
    pub unit: String,
    pub kind: ErrorKind,
    pub retry_count: u32,
    pub message: String,
}

impl fmt::Display for ResultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed with {} after {} retr{}: {}",
            self.unit,
            self.kind,
            self.retry_count,
            if self.retry_count == 1 { "y" } else { "ies" },
            self.message
        )
    }
}

/// Outcome of `execute_workflow`. Every failure path resolves into this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorResult {
    pub workflow_id: Uuid,
    pub node_id: Option<Uuid>,
    pub success: bool,
    pub content: String,
    pub metadata: HashMap<String, serde_json::Value>,
    pub execution_time: Duration,
    pub cost: f64,
    pub error: Option<ResultError>,
}

impl OrchestratorResult {
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }

    /// Strategy the workflow actually ran with, after any degradation.
    pub fn strategy(&self) -> Option<Strategy> {
        self.metadata
            .get("strategy")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn metadata_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(serde_json::Value::as_u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tolerance_caps() {
        assert!(!FailureTolerance::Low.accepts(1, 10));
        assert!(FailureTolerance::Low.accepts(0, 10));
        assert!(FailureTolerance::Medium.accepts(3, 10));
        assert!(!FailureTolerance::Medium.accepts(4, 10));
        assert!(FailureTolerance::High.accepts(2, 4));
        assert!(!FailureTolerance::High.accepts(3, 4));
        assert!(FailureTolerance::Low.accepts(0, 0));
    }

    #[test]
    fn test_request_deserializes_tagged() {
        let json = r#"{"type":"goal_workflow","goal":"improve performance","success_criteria":["p99 < 50ms"]}"#;
        let req: WorkflowRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.workflow_type(), WorkflowType::GoalWorkflow);
        assert_eq!(req.explicit_items(), ["p99 < 50ms".to_string()]);
    }

    #[test]
    fn test_normalized_drops_blank_items() {
        let input = WorkflowInput::goal("  ship it ", vec![" a ".into(), "   ".into(), "b".into()]).normalized();
        match input.request {
            WorkflowRequest::GoalWorkflow { goal, success_criteria } => {
                assert_eq!(goal, "ship it");
                assert_eq!(success_criteria, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_result_error_message_names_unit_kind_retries() {
        let err = ResultError {
            unit: "agent 1234 (task)".into(),
            kind: ErrorKind::TransientExhausted,
            retry_count: 3,
            message: "rate limited".into(),
        };
        let text = err.to_string();
        assert!(text.contains("agent 1234"));
        assert!(text.contains("transient_exhausted"));
        assert!(text.contains("3 retries"));
    }

    #[test]
    fn test_alignment_is_clamped() {
        let input = WorkflowInput::user_prompt("x").with_user_context("alignment", serde_json::json!(1.7));
        assert_eq!(input.alignment(), Some(1.0));
    }
}

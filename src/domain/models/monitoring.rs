use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Conditions the monitoring loop reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryTrigger {
    CostOverrunRisk,
    HighFailureRate,
    CoordinationBottleneck,
    TimeOverrunRisk,
}

impl RecoveryTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CostOverrunRisk => "cost_overrun_risk",
            Self::HighFailureRate => "high_failure_rate",
            Self::CoordinationBottleneck => "coordination_bottleneck",
            Self::TimeOverrunRisk => "time_overrun_risk",
        }
    }
}

impl fmt::Display for RecoveryTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution phase reported in status snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    #[default]
    Initializing,
    Analyzing,
    Executing,
    Synthesizing,
    Completed,
    Failed,
}

/// Pollable view of a running workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StatusSnapshot {
    pub phase: WorkflowPhase,
    pub progress_percentage: f64,
    pub agents_active: usize,
    pub agents_completed: usize,
    pub agents_failed: usize,
    pub cost_consumed: f64,
    pub time_elapsed: Duration,
    pub bottlenecks: Vec<String>,
}

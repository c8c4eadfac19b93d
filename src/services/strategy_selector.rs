//! Strategy selection from heuristics and learned recommendations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::domain::models::{
    ComplexityLevel, ComplexityProfile, OptimizationFocus, Strategy, WorkflowType,
};

/// A learned strategy suggestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub strategy: Strategy,
    pub confidence: f64,
    pub sample_count: usize,
    pub reasoning: String,
}

/// Source of learned recommendations.
#[async_trait]
pub trait StrategyAdvisor: Send + Sync {
    async fn recommend(&self, profile: &ComplexityProfile) -> Recommendation;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeBudget {
    Tight,
    Ample,
}

/// Resource and preference context for a selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionContext {
    pub time_budget: TimeBudget,
    pub optimization_focus: OptimizationFocus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "source")]
pub enum DecisionSource {
    Rule { rule: u8 },
    Learned { confidence: f64, sample_count: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDecision {
    pub strategy: Strategy,
    pub source: DecisionSource,
    pub reason: String,
}

pub struct StrategySelector {
    advisor: Option<Arc<dyn StrategyAdvisor>>,
    confidence_gate: f64,
}

impl StrategySelector {
    pub fn new(confidence_gate: f64) -> Self {
        Self { advisor: None, confidence_gate }
    }

    pub fn with_advisor(mut self, advisor: Arc<dyn StrategyAdvisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    /// Choose a strategy. Goal workflows always decompose recursively; for
    /// everything else a learned recommendation at or above the confidence
    /// gate overrides the rule table.
    pub async fn select(
        &self,
        workflow_type: WorkflowType,
        profile: &ComplexityProfile,
        context: SelectionContext,
    ) -> StrategyDecision {
        if workflow_type != WorkflowType::GoalWorkflow {
            if let Some(advisor) = &self.advisor {
                let rec = advisor.recommend(profile).await;
                if rec.confidence >= self.confidence_gate {
                    tracing::debug!(
                        strategy = %rec.strategy,
                        confidence = rec.confidence,
                        samples = rec.sample_count,
                        "learned recommendation overrides heuristics"
                    );
                    return StrategyDecision {
                        strategy: rec.strategy,
                        source: DecisionSource::Learned { confidence: rec.confidence, sample_count: rec.sample_count },
                        reason: rec.reasoning,
                    };
                }
            }
        }
        Self::heuristic(workflow_type, profile, context)
    }

    /// The rule table; first match wins.
    pub fn heuristic(
        workflow_type: WorkflowType,
        profile: &ComplexityProfile,
        context: SelectionContext,
    ) -> StrategyDecision {
        let decide = |rule: u8, strategy: Strategy, reason: &str| StrategyDecision {
            strategy,
            source: DecisionSource::Rule { rule },
            reason: reason.to_string(),
        };

        if workflow_type == WorkflowType::GoalWorkflow {
            return decide(1, Strategy::RecursiveDecomposition, "goal workflows are decomposed recursively");
        }
        if profile.risk == ComplexityLevel::Critical {
            return decide(2, Strategy::CouncilDriven, "critical risk requires council deliberation");
        }

        let decomposition_trigger = profile.high_count() >= 2 || profile.is_wide_scope();
        if decomposition_trigger {
            return match context.time_budget {
                TimeBudget::Tight => decide(3, Strategy::ParallelExecution, "broad work under a tight time budget"),
                TimeBudget::Ample => decide(4, Strategy::RecursiveDecomposition, "broad work with ample time"),
            };
        }
        if context.optimization_focus == OptimizationFocus::Speed {
            return decide(5, Strategy::ParallelExecution, "optimizing for speed");
        }
        if profile.quality.is_high() {
            return decide(6, Strategy::IterativeRefinement, "high quality requirements");
        }
        decide(7, Strategy::DirectExecution, "no decomposition signals")
    }
}

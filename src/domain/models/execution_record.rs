//! Historical outcome records consumed by the learning engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::complexity::{ComplexityBucket, ComplexityProfile};
use super::strategy::Strategy;

/// Resources a workflow consumed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceUsage {
    pub tokens: u64,
    pub cost: f64,
    pub agents_spawned: usize,
    pub agents_completed: usize,
    pub agents_failed: usize,
    pub peak_concurrency: usize,
    pub retries: u32,
    pub validations_passed: u32,
    pub validations_total: u32,
    /// Longest single executor call, in milliseconds.
    pub slowest_unit_ms: u64,
}

impl ResourceUsage {
    /// Fold another unit's consumption into this one.
    pub fn absorb(&mut self, other: &ResourceUsage) {
        self.tokens += other.tokens;
        self.cost += other.cost;
        self.agents_spawned += other.agents_spawned;
        self.agents_completed += other.agents_completed;
        self.agents_failed += other.agents_failed;
        self.peak_concurrency = self.peak_concurrency.max(other.peak_concurrency);
        self.retries += other.retries;
        self.validations_passed += other.validations_passed;
        self.validations_total += other.validations_total;
        self.slowest_unit_ms = self.slowest_unit_ms.max(other.slowest_unit_ms);
    }
}

/// Scores computed by the scorer; every component lies in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct OutcomeScores {
    pub success: f64,
    pub quality: f64,
    pub speed: f64,
    pub usefulness: f64,
    pub overall: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub node_id: Uuid,
    /// Strategy the workflow ran with.
    pub strategy: Strategy,
    /// Strategy the selector picked before any degradation.
    pub selected_strategy: Strategy,
    pub complexity: ComplexityProfile,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub usage: ResourceUsage,
    /// Whether the root node completed.
    pub root_succeeded: bool,
    pub alignment: Option<f64>,
    pub feedback: Option<f64>,
    pub scores: Option<OutcomeScores>,
    pub version: u64,
}

impl ExecutionRecord {
    pub fn new(
        workflow_id: Uuid,
        node_id: Uuid,
        strategy: Strategy,
        complexity: ComplexityProfile,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            node_id,
            strategy,
            selected_strategy: strategy,
            complexity,
            started_at,
            ended_at,
            usage: ResourceUsage::default(),
            root_succeeded: false,
            alignment: None,
            feedback: None,
            scores: None,
            version: 1,
        }
    }

    pub fn bucket(&self) -> ComplexityBucket {
        self.complexity.bucket()
    }

    pub fn elapsed(&self) -> Duration {
        (self.ended_at - self.started_at).to_std().unwrap_or_default()
    }

    /// Success signal used for pattern statistics: the scored success when
    /// present, else the root outcome.
    pub fn success_value(&self) -> f64 {
        match self.scores {
            Some(scores) => scores.success,
            None if self.root_succeeded => 1.0,
            None => 0.0,
        }
    }

    pub fn overall_score(&self) -> f64 {
        self.scores.map_or_else(|| self.success_value(), |s| s.overall)
    }
}

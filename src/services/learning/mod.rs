//! Adaptive learning engine.
//!
//! Closes the loop between finished workflows and future strategy choices:
//!
//! - [`Scorer`] turns an [`ExecutionRecord`] into outcome scores
//! - [`PatternAnalyzer`] groups windowed history by (strategy, bucket) and
//!   mines recurring failures
//! - [`AdaptationEngine`] recommends strategies and tunes parameters
//!
//! [`LearningEngine`] wires the three to a [`PersistenceStore`].

pub mod adaptation_engine;
pub mod pattern_analyzer;
pub mod scorer;
pub mod stats_cache;

pub use adaptation_engine::{
    optimize_parameters, should_adapt, AdaptationAdvice, AdaptationEngine, AdaptationKind,
    AdaptationUrgency, ExecutionParameters, ObservedPerformance, PerformanceExpectation,
};
pub use pattern_analyzer::{PatternAnalyzer, StrategyPattern};
pub use scorer::Scorer;
pub use stats_cache::{StatsCache, WindowFingerprint};

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Config, ExecutionRecord, NodeScores, OutcomeScores};
use crate::domain::ports::PersistenceStore;

/// Result of scoring one record.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub record: ExecutionRecord,
    pub scores: OutcomeScores,
    pub advice: Option<AdaptationAdvice>,
}

pub struct LearningEngine {
    store: Arc<dyn PersistenceStore>,
    scorer: Scorer,
    analyzer: Arc<PatternAnalyzer>,
    adaptation: Arc<AdaptationEngine>,
}

impl LearningEngine {
    pub fn new(store: Arc<dyn PersistenceStore>, config: &Config) -> Self {
        let analyzer = Arc::new(PatternAnalyzer::new(
            store.clone(),
            &config.learning,
            Duration::from_secs(config.recovery.failure_window_secs),
            config.recovery.escalation_threshold,
        ));
        let adaptation = Arc::new(AdaptationEngine::new(analyzer.clone(), config.learning.max_confidence));
        Self {
            store,
            scorer: Scorer::new(config.learning.weights, config.learning.min_samples),
            analyzer,
            adaptation,
        }
    }

    pub fn analyzer(&self) -> Arc<PatternAnalyzer> {
        self.analyzer.clone()
    }

    pub fn adaptation(&self) -> Arc<AdaptationEngine> {
        self.adaptation.clone()
    }

    /// Score a finished record, append the scored version and propagate the
    /// scores to its root node.
    pub async fn ingest(&self, mut record: ExecutionRecord) -> DomainResult<IngestOutcome> {
        let scores = self.rescore(&mut record).await?;

        let advice = match self.adaptation.expectation(record.strategy, record.bucket()).await {
            Some(expected) => should_adapt(&expected, &Self::observed(&record)),
            None => None,
        };
        if let Some(advice) = &advice {
            tracing::info!(
                workflow_id = %record.workflow_id,
                strategy = %record.strategy,
                urgency = ?advice.urgency,
                triggers = ?advice.triggers,
                "workflow deviated from learned expectations"
            );
        }

        tracing::debug!(
            record_id = %record.id,
            overall = scores.overall,
            success = scores.success,
            "execution record scored"
        );
        Ok(IngestOutcome { record, scores, advice })
    }

    /// Attach explicit feedback in `[0, 1]` and rescore.
    pub async fn record_feedback(&self, record_id: Uuid, feedback: f64) -> DomainResult<ExecutionRecord> {
        let mut record = self
            .store
            .get_execution_record(record_id)
            .await?
            .ok_or(DomainError::RecordNotFound(record_id))?;
        if !(0.0..=1.0).contains(&feedback) {
            return Err(DomainError::ValidationFailed(format!("feedback must lie in [0, 1], got {feedback}")));
        }
        record.feedback = Some(feedback);
        self.rescore(&mut record).await?;
        // a single rescored record can sit below the cache's invalidation fraction
        self.analyzer.invalidate().await;
        Ok(record)
    }

    async fn rescore(&self, record: &mut ExecutionRecord) -> DomainResult<OutcomeScores> {
        let history: Vec<ExecutionRecord> = self
            .analyzer
            .window_records()
            .await?
            .into_iter()
            .filter(|r| r.id != record.id)
            .collect();

        let scores = self.scorer.score(record, &history);
        record.scores = Some(scores);
        record.version += 1;
        self.store.save_execution_record(record).await?;

        if let Some(mut node) = self.store.get_node(record.node_id).await? {
            node.set_scores(NodeScores {
                success: scores.success,
                quality: scores.quality,
                speed: scores.speed,
                usefulness: scores.usefulness,
                overall_weight: scores.overall,
            });
            self.store.save_node(&node).await?;
        }
        Ok(scores)
    }

    #[allow(clippy::cast_precision_loss)]
    fn observed(record: &ExecutionRecord) -> ObservedPerformance {
        let resolved = record.usage.agents_completed + record.usage.agents_failed;
        let failure_rate = if resolved == 0 { 0.0 } else { record.usage.agents_failed as f64 / resolved as f64 };
        ObservedPerformance {
            execution_time: record.elapsed(),
            success_rate: record.success_value(),
            cost: record.usage.cost,
            failure_rate,
        }
    }
}

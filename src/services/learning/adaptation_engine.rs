//! Strategy recommendations, parameter tuning and in-flight deviation checks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::pattern_analyzer::{PatternAnalyzer, StrategyPattern};
use crate::domain::models::{ComplexityBucket, ComplexityLevel, ComplexityProfile, ExecutionRecord, Strategy};
use crate::services::strategy_selector::{Recommendation, StrategyAdvisor};

/// Confidence reported when no reportable history exists; below any sane gate.
pub const FALLBACK_CONFIDENCE: f64 = 0.3;
const MIN_TUNING_SAMPLES: usize = 3;
const MAX_RETRY_PROPOSAL: u32 = 10;

/// Tunable execution parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionParameters {
    pub timeout: Duration,
    pub retry_count: u32,
    pub concurrency: usize,
}

/// What a workflow was expected to do, typically a pattern's means.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceExpectation {
    pub execution_time: Duration,
    pub success_rate: f64,
    pub cost: f64,
}

impl From<&StrategyPattern> for PerformanceExpectation {
    fn from(pattern: &StrategyPattern) -> Self {
        Self { execution_time: pattern.mean_elapsed, success_rate: pattern.success_rate, cost: pattern.mean_cost }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObservedPerformance {
    pub execution_time: Duration,
    pub success_rate: f64,
    pub cost: f64,
    pub failure_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptationUrgency {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptationKind {
    ParameterOptimization,
    TimeoutAdjustment,
    StrategyChange,
}

/// Advice produced when observed performance deviates from expectation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationAdvice {
    pub kind: AdaptationKind,
    pub urgency: AdaptationUrgency,
    pub triggers: Vec<String>,
}

impl AdaptationAdvice {
    pub fn is_immediate(&self) -> bool {
        self.urgency >= AdaptationUrgency::High
    }
}

/// Strategy used when history cannot support a recommendation.
pub fn default_strategy(bucket: ComplexityBucket) -> Strategy {
    match bucket {
        ComplexityLevel::Critical => Strategy::CouncilDriven,
        ComplexityLevel::High => Strategy::RecursiveDecomposition,
        ComplexityLevel::Medium => Strategy::ParallelExecution,
        ComplexityLevel::Low => Strategy::DirectExecution,
    }
}

/// Confidence grows with sample count and shrinks with score spread:
/// `min(cap, n/(n+2) * (1 - min(1, 2σ)))`.
#[allow(clippy::cast_precision_loss)]
pub fn confidence(sample_count: usize, score_std_dev: f64, cap: f64) -> f64 {
    let n = sample_count as f64;
    let sample_factor = n / (n + 2.0);
    let spread_penalty = (2.0 * score_std_dev).min(1.0);
    (sample_factor * (1.0 - spread_penalty)).clamp(0.0, cap)
}

/// Pick the best reportable pattern: success rate first, then mean score.
pub fn recommend_from(
    patterns: &[StrategyPattern],
    bucket: ComplexityBucket,
    max_confidence: f64,
) -> Recommendation {
    let best = patterns
        .iter()
        .filter(|p| p.bucket == bucket && p.reportable)
        .max_by(|a, b| {
            a.success_rate
                .total_cmp(&b.success_rate)
                .then_with(|| a.mean_overall.total_cmp(&b.mean_overall))
        });

    match best {
        Some(pattern) => Recommendation {
            strategy: pattern.strategy,
            confidence: confidence(pattern.sample_count, pattern.score_std_dev, max_confidence),
            sample_count: pattern.sample_count,
            reasoning: format!(
                "{} succeeded {:.0}% of {} {bucket} runs (mean score {:.2})",
                pattern.strategy,
                pattern.success_rate * 100.0,
                pattern.sample_count,
                pattern.mean_overall
            ),
        },
        None => Recommendation {
            strategy: default_strategy(bucket),
            confidence: FALLBACK_CONFIDENCE,
            sample_count: 0,
            reasoning: format!("no reportable history for {bucket} workflows"),
        },
    }
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Clamp `proposed` into `[0.5 * current, 2 * current]`.
fn bound_duration(current: Duration, proposed: Duration) -> Duration {
    proposed.clamp(current / 2, current.saturating_mul(2))
}

fn bound_count(current: usize, proposed: usize) -> usize {
    let lo = current.div_ceil(2);
    let hi = current.saturating_mul(2);
    proposed.clamp(lo.min(hi), hi)
}

fn bound_retries(current: u32, proposed: u32) -> u32 {
    let lo = current.div_ceil(2);
    let hi = current.saturating_mul(2);
    proposed.clamp(lo.min(hi), hi)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn tune_timeout(current: Duration, history: &[ExecutionRecord]) -> Duration {
    let slowest: Vec<Duration> = history
        .iter()
        .filter(|r| r.usage.slowest_unit_ms > 0)
        .map(|r| Duration::from_millis(r.usage.slowest_unit_ms))
        .collect();
    if slowest.len() < MIN_TUNING_SAMPLES {
        return current;
    }
    let near_limit = slowest.iter().filter(|d| d.as_secs_f64() >= current.as_secs_f64() * 0.9).count();
    let avg = slowest.iter().sum::<Duration>() / u32::try_from(slowest.len()).unwrap_or(u32::MAX);
    let max = slowest.iter().max().copied().unwrap_or(current);

    let proposed = if near_limit as f64 > slowest.len() as f64 * 0.1 {
        max.mul_f64(1.5)
    } else if current > avg * 3 {
        avg * 2
    } else {
        current
    };
    bound_duration(current, proposed)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn tune_concurrency(current: usize, history: &[ExecutionRecord]) -> usize {
    let (Some(avg_peak), Some(avg_success)) = (
        mean(history.iter().map(|r| r.usage.peak_concurrency as f64)),
        mean(history.iter().map(ExecutionRecord::success_value)),
    ) else {
        return current;
    };
    let current_f = current as f64;
    let proposed = if avg_success < 0.8 && avg_peak >= current_f * 0.8 {
        (current_f * 1.5) as usize
    } else if avg_peak < current_f * 0.5 {
        ((avg_peak * 1.5) as usize).max(1)
    } else {
        current
    };
    bound_count(current, proposed)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn tune_retries(current: u32, history: &[ExecutionRecord]) -> u32 {
    let (Some(avg_retries), Some(avg_success)) = (
        mean(history.iter().map(|r| f64::from(r.usage.retries))),
        mean(history.iter().map(ExecutionRecord::success_value)),
    ) else {
        return current;
    };
    let current_f = f64::from(current);
    let proposed = if avg_retries >= current_f * 0.8 && avg_success < 0.7 {
        (current + 2).min(MAX_RETRY_PROPOSAL)
    } else if avg_retries < current_f * 0.3 {
        ((avg_retries * 2.0) as u32).max(1)
    } else {
        current
    };
    bound_retries(current, proposed)
}

/// Adjust parameters from history. Each value moves by at most a factor of
/// two in either direction per call; fewer than three records change nothing.
pub fn optimize_parameters(current: ExecutionParameters, history: &[ExecutionRecord]) -> ExecutionParameters {
    if history.len() < MIN_TUNING_SAMPLES {
        return current;
    }
    ExecutionParameters {
        timeout: tune_timeout(current.timeout, history),
        retry_count: tune_retries(current.retry_count, history),
        concurrency: tune_concurrency(current.concurrency, history),
    }
}

/// Compare observed performance with expectation; `None` when nothing deviates.
pub fn should_adapt(expected: &PerformanceExpectation, observed: &ObservedPerformance) -> Option<AdaptationAdvice> {
    let deviation = |observed: f64, expected: f64| (expected > 0.0).then(|| (observed - expected) / expected);

    let mut triggers = Vec::new();
    let mut urgency = AdaptationUrgency::Low;
    let mut kind = AdaptationKind::ParameterOptimization;

    if let Some(d) = deviation(observed.execution_time.as_secs_f64(), expected.execution_time.as_secs_f64()) {
        if d > 0.5 {
            triggers.push(format!("execution time {:.0}% over estimate", d * 100.0));
            urgency = AdaptationUrgency::High;
            kind = AdaptationKind::TimeoutAdjustment;
        }
    }
    if let Some(d) = deviation(observed.success_rate, expected.success_rate) {
        if d < -0.2 {
            triggers.push(format!("success rate {:.0}% below estimate", -d * 100.0));
            urgency = AdaptationUrgency::High;
            kind = AdaptationKind::StrategyChange;
        }
    }
    if let Some(d) = deviation(observed.cost, expected.cost) {
        if d > 0.3 {
            triggers.push(format!("cost {:.0}% over estimate", d * 100.0));
            urgency = urgency.max(AdaptationUrgency::Medium);
        }
    }
    if observed.failure_rate > 0.3 {
        triggers.push(format!("failure rate {:.0}%", observed.failure_rate * 100.0));
        urgency = AdaptationUrgency::Critical;
        kind = AdaptationKind::StrategyChange;
    }

    (!triggers.is_empty()).then_some(AdaptationAdvice { kind, urgency, triggers })
}

/// Recommends strategies from analysed history.
pub struct AdaptationEngine {
    analyzer: Arc<PatternAnalyzer>,
    max_confidence: f64,
}

impl AdaptationEngine {
    pub fn new(analyzer: Arc<PatternAnalyzer>, max_confidence: f64) -> Self {
        Self { analyzer, max_confidence }
    }

    /// Recommend a strategy for the profile's bucket. Store errors degrade to
    /// the low-confidence default rather than failing selection.
    pub async fn recommend(&self, profile: &ComplexityProfile) -> Recommendation {
        let bucket = profile.bucket();
        match self.analyzer.strategy_patterns().await {
            Ok(patterns) => recommend_from(&patterns, bucket, self.max_confidence),
            Err(e) => {
                tracing::warn!(error = %e, "pattern lookup failed; using default recommendation");
                recommend_from(&[], bucket, self.max_confidence)
            }
        }
    }

    /// Tune parameters from the windowed records of one bucket.
    pub async fn optimize(&self, current: ExecutionParameters, bucket: ComplexityBucket) -> ExecutionParameters {
        match self.analyzer.window_records().await {
            Ok(mut history) => {
                history.retain(|r| r.bucket() == bucket);
                optimize_parameters(current, &history)
            }
            Err(e) => {
                tracing::warn!(error = %e, "history lookup failed; keeping parameters");
                current
            }
        }
    }

    /// Expected performance for a strategy in a bucket, when reportable.
    pub async fn expectation(&self, strategy: Strategy, bucket: ComplexityBucket) -> Option<PerformanceExpectation> {
        let patterns = self.analyzer.patterns_for(bucket).await.ok()?;
        patterns.iter().find(|p| p.strategy == strategy).map(PerformanceExpectation::from)
    }
}

#[async_trait]
impl StrategyAdvisor for AdaptationEngine {
    async fn recommend(&self, profile: &ComplexityProfile) -> Recommendation {
        AdaptationEngine::recommend(self, profile).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use uuid::Uuid;

    fn pattern(strategy: Strategy, n: usize, success: f64, std_dev: f64) -> StrategyPattern {
        StrategyPattern {
            strategy,
            bucket: ComplexityLevel::Low,
            sample_count: n,
            success_rate: success,
            mean_overall: success,
            score_std_dev: std_dev,
            mean_elapsed: Duration::from_secs(10),
            mean_cost: 1.0,
            reportable: n >= 5,
        }
    }

    fn history(n: usize, peak: usize, retries: u32, slowest_ms: u64, succeeded: bool) -> Vec<ExecutionRecord> {
        (0..n)
            .map(|_| {
                let now = Utc::now();
                let mut r = ExecutionRecord::new(
                    Uuid::new_v4(),
                    Uuid::new_v4(),
                    Strategy::ParallelExecution,
                    ComplexityProfile::default(),
                    now - ChronoDuration::seconds(30),
                    now,
                );
                r.root_succeeded = succeeded;
                r.usage.peak_concurrency = peak;
                r.usage.retries = retries;
                r.usage.slowest_unit_ms = slowest_ms;
                r
            })
            .collect()
    }

    #[test]
    fn test_confidence_shape() {
        assert!((confidence(6, 0.0, 0.98) - 0.75).abs() < 1e-9);
        assert!(confidence(50, 0.0, 0.98) > confidence(6, 0.0, 0.98));
        assert!(confidence(6, 0.2, 0.98) < confidence(6, 0.0, 0.98));
        assert_eq!(confidence(10_000, 0.0, 0.98), 0.98);
        assert_eq!(confidence(10, 0.6, 0.98), 0.0);
    }

    #[test]
    fn test_recommend_prefers_success_then_score() {
        let patterns = vec![
            pattern(Strategy::SequentialDecomposition, 8, 0.5, 0.4),
            pattern(Strategy::ParallelExecution, 6, 1.0, 0.0),
            pattern(Strategy::DirectExecution, 3, 1.0, 0.0),
        ];
        let rec = recommend_from(&patterns, ComplexityLevel::Low, 0.98);
        assert_eq!(rec.strategy, Strategy::ParallelExecution);
        assert!(rec.confidence > 0.6);
        assert_eq!(rec.sample_count, 6);
    }

    #[test]
    fn test_recommend_without_history_is_low_confidence() {
        let rec = recommend_from(&[], ComplexityLevel::Critical, 0.98);
        assert_eq!(rec.strategy, Strategy::CouncilDriven);
        assert!(rec.confidence < 0.6);
    }

    #[test]
    fn test_optimize_needs_three_records() {
        let current = ExecutionParameters { timeout: Duration::from_secs(60), retry_count: 3, concurrency: 10 };
        assert_eq!(optimize_parameters(current, &history(2, 1, 0, 1000, true)), current);
    }

    #[test]
    fn test_optimize_bounds_each_parameter() {
        let current = ExecutionParameters { timeout: Duration::from_secs(60), retry_count: 4, concurrency: 10 };

        // Fast, idle, retry-free history shrinks everything, but never below half
        let shrunk = optimize_parameters(current, &history(5, 1, 0, 100, true));
        assert_eq!(shrunk.timeout, Duration::from_secs(30));
        assert_eq!(shrunk.concurrency, 5);
        assert_eq!(shrunk.retry_count, 2);

        // Slow units near the limit with saturated, failing runs grow, capped at double
        let grown = optimize_parameters(current, &history(5, 10, 4, 200_000, false));
        assert_eq!(grown.timeout, Duration::from_secs(120));
        assert_eq!(grown.concurrency, 15);
        assert_eq!(grown.retry_count, 6);
    }

    #[test]
    fn test_bound_duration_saturates_huge_timeouts() {
        let huge = Duration::MAX / 2 + Duration::from_secs(1);
        assert_eq!(bound_duration(huge, Duration::MAX), Duration::MAX);
        assert_eq!(bound_duration(huge, Duration::ZERO), huge / 2);
    }

    #[test]
    fn test_should_adapt() {
        let expected = PerformanceExpectation { execution_time: Duration::from_secs(100), success_rate: 0.9, cost: 10.0 };
        let on_track = ObservedPerformance {
            execution_time: Duration::from_secs(110),
            success_rate: 0.85,
            cost: 11.0,
            failure_rate: 0.1,
        };
        assert!(should_adapt(&expected, &on_track).is_none());

        let slow = ObservedPerformance { execution_time: Duration::from_secs(200), ..on_track };
        let advice = should_adapt(&expected, &slow).unwrap();
        assert_eq!(advice.kind, AdaptationKind::TimeoutAdjustment);
        assert!(advice.is_immediate());

        let failing = ObservedPerformance { failure_rate: 0.5, cost: 20.0, ..on_track };
        let advice = should_adapt(&expected, &failing).unwrap();
        assert_eq!(advice.urgency, AdaptationUrgency::Critical);
        assert_eq!(advice.kind, AdaptationKind::StrategyChange);
        assert_eq!(advice.triggers.len(), 2);
    }
}

//! Strategy and failure pattern detection over a sliding window of history.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::stats_cache::{StatsCache, WindowFingerprint};
use crate::domain::errors::DomainResult;
use crate::domain::models::{
    ComplexityBucket, ExecutionRecord, FailureEvent, FailurePattern, LearningConfig, Strategy,
};
use crate::domain::ports::PersistenceStore;

const STRATEGY_KEY: &str = "strategy_patterns";
const FAILURE_KEY: &str = "failure_patterns";

/// Aggregate performance of one strategy within one complexity bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyPattern {
    pub strategy: Strategy,
    pub bucket: ComplexityBucket,
    pub sample_count: usize,
    pub success_rate: f64,
    pub mean_overall: f64,
    /// Standard deviation of overall scores.
    pub score_std_dev: f64,
    pub mean_elapsed: Duration,
    pub mean_cost: f64,
    /// Whether the sample count has reached the significance floor.
    pub reportable: bool,
}

/// Window selection: the most recent `days` or `max_records`, whichever
/// holds fewer records.
#[derive(Debug, Clone, Copy)]
pub struct WindowSpec {
    pub days: i64,
    pub max_records: usize,
}

impl WindowSpec {
    pub fn since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - ChronoDuration::days(self.days)
    }
}

pub fn fingerprint_records(records: &[ExecutionRecord]) -> WindowFingerprint {
    WindowFingerprint::from_pairs(records.iter().map(|r| (r.id, r.version)))
}

/// Group records by (strategy, bucket) and compute their statistics.
pub fn compute_strategy_patterns(records: &[ExecutionRecord], min_samples: usize) -> Vec<StrategyPattern> {
    let mut groups: HashMap<(Strategy, ComplexityBucket), Vec<&ExecutionRecord>> = HashMap::new();
    for record in records {
        groups.entry((record.strategy, record.bucket())).or_default().push(record);
    }

    let mut patterns: Vec<StrategyPattern> = groups
        .into_iter()
        .map(|((strategy, bucket), group)| {
            let overall: Vec<f64> = group.iter().map(|r| r.overall_score()).collect();
            let success: Vec<f64> = group.iter().map(|r| r.success_value()).collect();
            let mean_overall = mean(&overall);
            let elapsed_total: Duration = group.iter().map(|r| r.elapsed()).sum();
            let count = u32::try_from(group.len()).unwrap_or(u32::MAX);
            StrategyPattern {
                strategy,
                bucket,
                sample_count: group.len(),
                success_rate: mean(&success),
                mean_overall,
                score_std_dev: std_dev(&overall, mean_overall),
                mean_elapsed: elapsed_total / count.max(1),
                mean_cost: mean(&group.iter().map(|r| r.usage.cost).collect::<Vec<_>>()),
                reportable: group.len() >= min_samples,
            }
        })
        .collect();

    patterns.sort_by(|a, b| {
        a.bucket
            .cmp(&b.bucket)
            .then_with(|| b.success_rate.total_cmp(&a.success_rate))
            .then_with(|| a.strategy.as_str().cmp(b.strategy.as_str()))
    });
    patterns
}

/// Group failures by (collaborator, signature); pairs at or above `threshold`
/// occurrences become patterns.
pub fn mine_failure_patterns(events: &[FailureEvent], threshold: usize) -> Vec<FailurePattern> {
    let mut groups: HashMap<(&str, &str), Vec<&FailureEvent>> = HashMap::new();
    for event in events {
        groups
            .entry((event.collaborator.as_str(), event.error_signature.as_str()))
            .or_default()
            .push(event);
    }

    let mut patterns: Vec<FailurePattern> = groups
        .into_iter()
        .filter(|(_, group)| group.len() >= threshold.max(1))
        .filter_map(|((collaborator, signature), group)| {
            let first = group.iter().min_by_key(|e| e.occurred_at)?;
            let last = group.iter().max_by_key(|e| e.occurred_at)?;
            Some(FailurePattern {
                id: Uuid::new_v4(),
                collaborator: collaborator.to_string(),
                error_signature: signature.to_string(),
                occurrences: group.len(),
                first_seen: first.occurred_at,
                last_seen: last.occurred_at,
                sample_message: last.message.clone(),
            })
        })
        .collect();
    patterns.sort_by(|a, b| b.occurrences.cmp(&a.occurrences).then_with(|| a.collaborator.cmp(&b.collaborator)));
    patterns
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

#[allow(clippy::cast_precision_loss)]
fn std_dev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Reads windowed history from the store and caches derived patterns.
pub struct PatternAnalyzer {
    store: Arc<dyn PersistenceStore>,
    window: WindowSpec,
    min_samples: usize,
    failure_window: Duration,
    failure_threshold: usize,
    strategy_cache: StatsCache<Vec<StrategyPattern>>,
    failure_cache: StatsCache<Vec<FailurePattern>>,
}

impl PatternAnalyzer {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        config: &LearningConfig,
        failure_window: Duration,
        failure_threshold: usize,
    ) -> Self {
        let ttl = Duration::from_secs(config.cache_ttl_secs);
        Self {
            store,
            window: WindowSpec { days: config.window_days, max_records: config.window_max_records },
            min_samples: config.min_samples,
            failure_window,
            failure_threshold,
            strategy_cache: StatsCache::new(ttl, config.invalidation_fraction),
            failure_cache: StatsCache::new(ttl, config.invalidation_fraction),
        }
    }

    pub fn min_samples(&self) -> usize {
        self.min_samples
    }

    /// Records inside the sliding window, newest first.
    pub async fn window_records(&self) -> DomainResult<Vec<ExecutionRecord>> {
        self.store
            .execution_records_since(self.window.since(Utc::now()), self.window.max_records)
            .await
    }

    pub async fn strategy_patterns(&self) -> DomainResult<Arc<Vec<StrategyPattern>>> {
        let records = self.window_records().await?;
        let fingerprint = fingerprint_records(&records);
        let min_samples = self.min_samples;
        Ok(self
            .strategy_cache
            .get_or_compute(STRATEGY_KEY, fingerprint, || {
                tracing::debug!(records = records.len(), "recomputing strategy patterns");
                compute_strategy_patterns(&records, min_samples)
            })
            .await)
    }

    /// Reportable patterns for one bucket.
    pub async fn patterns_for(&self, bucket: ComplexityBucket) -> DomainResult<Vec<StrategyPattern>> {
        Ok(self
            .strategy_patterns()
            .await?
            .iter()
            .filter(|p| p.bucket == bucket && p.reportable)
            .cloned()
            .collect())
    }

    pub async fn failure_patterns(&self) -> DomainResult<Arc<Vec<FailurePattern>>> {
        let window = ChronoDuration::from_std(self.failure_window).unwrap_or_else(|_| ChronoDuration::days(1));
        let events = self.store.failure_events_since(Utc::now() - window).await?;
        let fingerprint = WindowFingerprint::from_pairs(events.iter().map(|e| (e.id, 1)));
        let threshold = self.failure_threshold;
        Ok(self
            .failure_cache
            .get_or_compute(FAILURE_KEY, fingerprint, || mine_failure_patterns(&events, threshold))
            .await)
    }

    /// Drop cached patterns so the next read recomputes from the store.
    pub async fn invalidate(&self) {
        self.strategy_cache.invalidate_all().await;
        self.failure_cache.invalidate_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryStore;
    use crate::domain::errors::ErrorKind;
    use crate::domain::models::ComplexityProfile;

    fn record(strategy: Strategy, succeeded: bool) -> ExecutionRecord {
        let start = Utc::now() - ChronoDuration::minutes(5);
        let mut r = ExecutionRecord::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            strategy,
            ComplexityProfile::default(),
            start,
            start + ChronoDuration::seconds(20),
        );
        r.root_succeeded = succeeded;
        r
    }

    #[test]
    fn test_patterns_grouped_and_gated_by_samples() {
        let mut records: Vec<_> = (0..6).map(|_| record(Strategy::ParallelExecution, true)).collect();
        records.extend((0..4).map(|i| record(Strategy::SequentialDecomposition, i % 2 == 0)));

        let patterns = compute_strategy_patterns(&records, 5);
        assert_eq!(patterns.len(), 2);

        let parallel = patterns.iter().find(|p| p.strategy == Strategy::ParallelExecution).unwrap();
        assert_eq!(parallel.sample_count, 6);
        assert!(parallel.reportable);
        assert_eq!(parallel.success_rate, 1.0);
        assert_eq!(parallel.score_std_dev, 0.0);
        assert_eq!(parallel.mean_elapsed, Duration::from_secs(20));

        let sequential = patterns.iter().find(|p| p.strategy == Strategy::SequentialDecomposition).unwrap();
        assert!(!sequential.reportable);
        assert!((sequential.success_rate - 0.5).abs() < 1e-9);
        assert!((sequential.score_std_dev - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_failure_mining_threshold() {
        let mut events: Vec<_> = (0..3)
            .map(|i| FailureEvent::new("search", ErrorKind::Permanent, format!("index {i} missing")))
            .collect();
        events.push(FailureEvent::new("search", ErrorKind::Permanent, "schema mismatch"));
        events.push(FailureEvent::new("render", ErrorKind::Permanent, "index 9 missing"));

        let patterns = mine_failure_patterns(&events, 3);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].collaborator, "search");
        assert_eq!(patterns[0].error_signature, "index # missing");
        assert_eq!(patterns[0].occurrences, 3);
    }

    #[tokio::test]
    async fn test_failure_patterns_mined_from_store_and_cached() {
        let store = Arc::new(InMemoryStore::new());
        for i in 0..3 {
            let event = FailureEvent::new("search", ErrorKind::Permanent, format!("index {i} missing"));
            store.save_failure_event(&event).await.unwrap();
        }
        store.save_failure_event(&FailureEvent::new("render", ErrorKind::Transient, "timeout")).await.unwrap();

        let analyzer = PatternAnalyzer::new(store.clone(), &LearningConfig::default(), Duration::from_secs(3600), 3);
        let patterns = analyzer.failure_patterns().await.unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].collaborator, "search");
        assert_eq!(patterns[0].occurrences, 3);

        analyzer.failure_patterns().await.unwrap();
        assert_eq!(analyzer.failure_cache.stats().await.hits, 1);

        analyzer.invalidate().await;
        analyzer.failure_patterns().await.unwrap();
        assert_eq!(analyzer.failure_cache.stats().await.misses, 2);
    }
}

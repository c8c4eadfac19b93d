//! Outcome scoring for completed workflows.

use std::time::Duration;

use crate::domain::models::{
    ComplexityBucket, ComplexityLevel, ExecutionRecord, OutcomeScores, ResourceUsage, ScoreWeights,
};

const RETRY_PENALTY_PER_RETRY: f64 = 0.1;
const RETRY_PENALTY_CAP: f64 = 0.3;
const DEFAULT_ALIGNMENT: f64 = 0.5;
const ALIGNMENT_WEIGHT: f64 = 0.6;
const FEEDBACK_WEIGHT: f64 = 0.4;

/// Expected wall-clock time for a bucket when history is too thin.
pub fn default_baseline(bucket: ComplexityBucket) -> Duration {
    match bucket {
        ComplexityLevel::Low => Duration::from_secs(30),
        ComplexityLevel::Medium => Duration::from_secs(120),
        ComplexityLevel::High => Duration::from_secs(300),
        ComplexityLevel::Critical => Duration::from_secs(600),
    }
}

/// Median elapsed time of successful records in `bucket`, if at least
/// `min_samples` exist.
pub fn median_baseline(records: &[ExecutionRecord], bucket: ComplexityBucket, min_samples: usize) -> Option<Duration> {
    let mut elapsed: Vec<Duration> = records
        .iter()
        .filter(|r| r.bucket() == bucket && r.root_succeeded)
        .map(ExecutionRecord::elapsed)
        .collect();
    if elapsed.is_empty() || elapsed.len() < min_samples {
        return None;
    }
    elapsed.sort_unstable();
    let mid = elapsed.len() / 2;
    Some(if elapsed.len() % 2 == 0 {
        (elapsed[mid - 1] + elapsed[mid]) / 2
    } else {
        elapsed[mid]
    })
}

#[derive(Debug, Clone)]
pub struct Scorer {
    weights: ScoreWeights,
    min_baseline_samples: usize,
}

impl Scorer {
    pub fn new(weights: ScoreWeights, min_baseline_samples: usize) -> Self {
        Self { weights, min_baseline_samples }
    }

    /// Score `record` against the history it belongs to.
    pub fn score(&self, record: &ExecutionRecord, history: &[ExecutionRecord]) -> OutcomeScores {
        let bucket = record.bucket();
        let baseline = median_baseline(history, bucket, self.min_baseline_samples)
            .unwrap_or_else(|| default_baseline(bucket));

        let success = Self::success(&record.usage, record.root_succeeded);
        let quality = Self::quality(&record.usage, success);
        let speed = Self::speed(record.elapsed(), baseline);
        let usefulness = Self::usefulness(record.alignment, record.feedback);
        let overall = self.overall(success, quality, speed, usefulness);

        OutcomeScores { success, quality, speed, usefulness, overall }
    }

    /// Completed share of resolved agents; zero when the root failed.
    pub fn success(usage: &ResourceUsage, root_succeeded: bool) -> f64 {
        if !root_succeeded {
            return 0.0;
        }
        let resolved = usage.agents_completed + usage.agents_failed;
        if resolved == 0 {
            return 1.0;
        }
        ratio(usage.agents_completed, resolved)
    }

    /// Validation pass rate less a capped retry penalty. Without validations
    /// the success score stands in for the pass rate.
    pub fn quality(usage: &ResourceUsage, success: f64) -> f64 {
        let pass_rate = if usage.validations_total > 0 {
            f64::from(usage.validations_passed) / f64::from(usage.validations_total)
        } else {
            success
        };
        let penalty = (f64::from(usage.retries) * RETRY_PENALTY_PER_RETRY).min(RETRY_PENALTY_CAP);
        (pass_rate - penalty).clamp(0.0, 1.0)
    }

    /// Stepped score on elapsed/baseline; at or under half the baseline saturates at 1.0.
    pub fn speed(elapsed: Duration, baseline: Duration) -> f64 {
        if baseline.is_zero() {
            return 1.0;
        }
        let ratio = elapsed.as_secs_f64() / baseline.as_secs_f64();
        match ratio {
            r if r <= 0.5 => 1.0,
            r if r <= 0.75 => 0.9,
            r if r <= 1.0 => 0.75,
            r if r <= 1.5 => 0.5,
            r if r <= 2.0 => 0.25,
            _ => 0.1,
        }
    }

    pub fn usefulness(alignment: Option<f64>, feedback: Option<f64>) -> f64 {
        let alignment = alignment.unwrap_or(DEFAULT_ALIGNMENT).clamp(0.0, 1.0);
        match feedback {
            Some(feedback) => ALIGNMENT_WEIGHT * alignment + FEEDBACK_WEIGHT * feedback.clamp(0.0, 1.0),
            None => alignment,
        }
    }

    /// Weighted sum normalized by the total weight.
    pub fn overall(&self, success: f64, quality: f64, speed: f64, usefulness: f64) -> f64 {
        let w = &self.weights;
        let total = w.success + w.quality + w.speed + w.usefulness;
        if total <= 0.0 {
            return (success + quality + speed + usefulness) / 4.0;
        }
        ((w.success * success + w.quality * quality + w.speed * speed + w.usefulness * usefulness) / total)
            .clamp(0.0, 1.0)
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(part: usize, whole: usize) -> f64 {
    part as f64 / whole as f64
}

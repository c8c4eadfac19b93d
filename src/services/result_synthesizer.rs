//! Merges child outcomes into a parent result.
//!
//! Inputs are sorted by spawn sequence first, so the merged content depends
//! only on the full set of sibling results and not on completion order.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::errors::OrchestrationError;
use crate::domain::models::{FailureTolerance, ResourceUsage, ResultError, Strategy};

/// Outcome of one child unit: an agent, or a nested sub-orchestrator with its
/// own children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitResult {
    pub sequence: u64,
    pub label: String,
    pub success: bool,
    pub content: String,
    pub error: Option<ResultError>,
    pub usage: ResourceUsage,
    pub children: Vec<UnitResult>,
}

impl UnitResult {
    pub fn completed(sequence: u64, label: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            sequence,
            label: label.into(),
            success: true,
            content: content.into(),
            error: None,
            usage: ResourceUsage::default(),
            children: Vec::new(),
        }
    }

    pub fn failed(sequence: u64, label: impl Into<String>, error: ResultError) -> Self {
        Self {
            sequence,
            label: label.into(),
            success: false,
            content: String::new(),
            error: Some(error),
            usage: ResourceUsage::default(),
            children: Vec::new(),
        }
    }

    pub fn with_usage(mut self, usage: ResourceUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_children(mut self, children: Vec<UnitResult>) -> Self {
        self.children = children;
        self
    }
}

/// How child contents are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    Concatenate,
    VoteOrMerge,
    Hierarchical,
}

impl MergeMode {
    pub fn for_strategy(strategy: Strategy) -> Self {
        match strategy {
            Strategy::SequentialDecomposition | Strategy::DirectExecution | Strategy::IterativeRefinement => {
                Self::Concatenate
            }
            Strategy::ParallelExecution | Strategy::CouncilDriven => Self::VoteOrMerge,
            Strategy::RecursiveDecomposition => Self::Hierarchical,
        }
    }
}

/// Aggregated result of a set of children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synthesis {
    pub content: String,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub usage: ResourceUsage,
    /// Errors of the failed children, in sequence order.
    pub child_errors: Vec<ResultError>,
}

fn normalize(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResultSynthesizer;

impl ResultSynthesizer {
    pub fn new() -> Self {
        Self
    }

    /// Merge `results` and apply `tolerance`. `expected` is the planned unit
    /// count; units never spawned (a halted chain) count as failed.
    pub fn synthesize(
        &self,
        mode: MergeMode,
        results: &[UnitResult],
        expected: usize,
        tolerance: FailureTolerance,
    ) -> Result<Synthesis, OrchestrationError> {
        let mut ordered: Vec<&UnitResult> = results.iter().collect();
        ordered.sort_by_key(|r| r.sequence);

        let total = expected.max(ordered.len());
        let completed = ordered.iter().filter(|r| r.success).count();
        let failed = total - completed;

        let mut usage = ResourceUsage::default();
        for result in &ordered {
            usage.absorb(&result.usage);
        }
        let child_errors: Vec<ResultError> = ordered.iter().filter_map(|r| r.error.clone()).collect();

        if completed == 0 && total > 0 {
            return Err(OrchestrationError::CoordinationFailure {
                completed,
                total,
                reason: "no child unit completed".to_string(),
            });
        }
        if !tolerance.accepts(failed, total) {
            return Err(OrchestrationError::CoordinationFailure {
                completed,
                total,
                reason: format!(
                    "{failed} of {total} child units failed, above the {:.0}% tolerance",
                    tolerance.max_failure_fraction() * 100.0
                ),
            });
        }

        let content = match mode {
            MergeMode::Concatenate => Self::concatenate(&ordered),
            MergeMode::VoteOrMerge => Self::vote(&ordered).unwrap_or_else(|| Self::merge(&ordered, failed)),
            MergeMode::Hierarchical => {
                let mut out = String::new();
                Self::rollup(&ordered, 0, &mut out);
                out.trim_end().to_string()
            }
        };

        Ok(Synthesis { content, total, completed, failed, usage, child_errors })
    }

    fn concatenate(results: &[&UnitResult]) -> String {
        results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.content.trim())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Content shared by a strict majority of successful units.
    fn vote(results: &[&UnitResult]) -> Option<String> {
        let successes: Vec<&&UnitResult> = results.iter().filter(|r| r.success).collect();
        if successes.len() < 2 {
            return None;
        }
        let mut tally: HashMap<String, (usize, u64)> = HashMap::new();
        for result in &successes {
            let entry = tally.entry(normalize(&result.content)).or_insert((0, result.sequence));
            entry.0 += 1;
        }
        let (_, (votes, first_sequence)) = tally.into_iter().max_by_key(|(_, (votes, seq))| (*votes, u64::MAX - seq))?;
        if votes * 2 <= successes.len() {
            return None;
        }
        successes
            .iter()
            .find(|r| r.sequence == first_sequence)
            .map(|r| r.content.trim().to_string())
    }

    fn merge(results: &[&UnitResult], failed: usize) -> String {
        let mut parts: Vec<String> = results
            .iter()
            .filter(|r| r.success)
            .enumerate()
            .map(|(i, r)| format!("Result {}: {}", i + 1, r.content.trim()))
            .collect();
        if failed > 0 {
            parts.push(format!("({failed} unit(s) failed and were excluded)"));
        }
        parts.join("\n")
    }

    fn rollup(results: &[&UnitResult], level: usize, out: &mut String) {
        let indent = "  ".repeat(level);
        for result in results {
            if result.success {
                out.push_str(&format!("{indent}- {}: {}\n", result.label, result.content.trim()));
            } else {
                let reason = result.error.as_ref().map_or_else(|| "failed".to_string(), |e| e.message.clone());
                out.push_str(&format!("{indent}- {}: [failed] {reason}\n", result.label));
            }
            if !result.children.is_empty() {
                let mut children: Vec<&UnitResult> = result.children.iter().collect();
                children.sort_by_key(|c| c.sequence);
                Self::rollup(&children, level + 1, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::ErrorKind;

    fn failure(seq: u64) -> UnitResult {
        UnitResult::failed(
            seq,
            format!("unit {seq}"),
            ResultError { unit: format!("agent {seq}"), kind: ErrorKind::Permanent, retry_count: 0, message: "rejected".into() },
        )
    }

    fn ok(seq: u64, content: &str) -> UnitResult {
        UnitResult::completed(seq, format!("unit {seq}"), content)
    }

    #[test]
    fn test_low_tolerance_rejects_any_failure() {
        let results = vec![ok(0, "a"), ok(1, "b"), failure(2)];
        let err = ResultSynthesizer::new()
            .synthesize(MergeMode::VoteOrMerge, &results, 3, FailureTolerance::Low)
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::CoordinationFailure { completed: 2, total: 3, .. }));
    }

    #[test]
    fn test_high_tolerance_accepts_half() {
        let results = vec![ok(0, "a"), failure(1)];
        let synthesis = ResultSynthesizer::new()
            .synthesize(MergeMode::VoteOrMerge, &results, 2, FailureTolerance::High)
            .unwrap();
        assert_eq!(synthesis.completed, 1);
        assert_eq!(synthesis.failed, 1);
        assert_eq!(synthesis.child_errors.len(), 1);
        assert!(synthesis.content.contains("Result 1: a"));
    }

    #[test]
    fn test_unspawned_units_count_as_failed() {
        let results = vec![ok(0, "step one"), failure(1)];
        let err = ResultSynthesizer::new()
            .synthesize(MergeMode::Concatenate, &results, 4, FailureTolerance::High)
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::CoordinationFailure { completed: 1, total: 4, .. }));
    }

    #[test]
    fn test_zero_successes_is_coordination_failure() {
        let err = ResultSynthesizer::new()
            .synthesize(MergeMode::Concatenate, &[failure(0)], 1, FailureTolerance::High)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CoordinationFailure);
    }

    #[test]
    fn test_majority_vote() {
        let results = vec![ok(2, "Use  Postgres"), ok(0, "use postgres"), ok(1, "use sqlite")];
        let synthesis = ResultSynthesizer::new()
            .synthesize(MergeMode::VoteOrMerge, &results, 3, FailureTolerance::Medium)
            .unwrap();
        assert_eq!(synthesis.content, "use postgres");
    }

    #[test]
    fn test_merge_is_order_independent() {
        let forward = vec![ok(0, "alpha"), ok(1, "beta"), ok(2, "gamma")];
        let mut reversed = forward.clone();
        reversed.reverse();
        let s = ResultSynthesizer::new();
        let a = s.synthesize(MergeMode::VoteOrMerge, &forward, 3, FailureTolerance::Low).unwrap();
        let b = s.synthesize(MergeMode::VoteOrMerge, &reversed, 3, FailureTolerance::Low).unwrap();
        assert_eq!(a.content, b.content);
        assert_eq!(a.content, "Result 1: alpha\nResult 2: beta\nResult 3: gamma");
    }

    #[test]
    fn test_hierarchical_rollup_indents_children() {
        let nested = ok(1, "subplan").with_children(vec![ok(1, "leaf b"), ok(0, "leaf a")]);
        let results = vec![nested, ok(0, "direct")];
        let synthesis = ResultSynthesizer::new()
            .synthesize(MergeMode::Hierarchical, &results, 2, FailureTolerance::Medium)
            .unwrap();
        assert_eq!(
            synthesis.content,
            "- unit 0: direct\n- unit 1: subplan\n  - unit 0: leaf a\n  - unit 1: leaf b"
        );
    }

    #[test]
    fn test_usage_is_summed() {
        let a = ok(0, "a").with_usage(ResourceUsage { tokens: 10, cost: 0.5, ..Default::default() });
        let b = ok(1, "b").with_usage(ResourceUsage { tokens: 5, cost: 0.25, ..Default::default() });
        let synthesis = ResultSynthesizer::new()
            .synthesize(MergeMode::Concatenate, &[a, b], 2, FailureTolerance::Low)
            .unwrap();
        assert_eq!(synthesis.usage.tokens, 15);
        assert!((synthesis.usage.cost - 0.75).abs() < 1e-9);
        assert_eq!(synthesis.content, "a\n\nb");
    }
}

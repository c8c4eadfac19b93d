//! Turns a workflow or subtask into the list of child units it fans out to.

use serde::{Deserialize, Serialize};

use super::complexity_analyzer::ComplexityAnalyzer;

/// Where a plan's subtasks came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    /// Success criteria or deliverables supplied with the request.
    Explicit,
    /// Lines of an executor decomposition.
    Decomposed,
    /// The whole goal as a single subtask.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedSubtask {
    pub index: usize,
    pub description: String,
    /// Run as a nested sub-orchestrator rather than a task agent.
    pub nested: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub source: PlanSource,
    pub subtasks: Vec<PlannedSubtask>,
}

impl TaskPlan {
    pub fn len(&self) -> usize {
        self.subtasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subtasks.is_empty()
    }

    pub fn nested_count(&self) -> usize {
        self.subtasks.iter().filter(|s| s.nested).count()
    }
}

/// Strip a list marker (`1.`, `2)`, `-`, `*`, `•`) from a line, returning the item text.
fn list_item(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let digits = trimmed.chars().take_while(char::is_ascii_digit).count();
    let rest = if digits > 0 {
        let after = &trimmed[digits..];
        after.strip_prefix('.').or_else(|| after.strip_prefix(')'))?
    } else {
        trimmed
            .strip_prefix('-')
            .or_else(|| trimmed.strip_prefix('*'))
            .or_else(|| trimmed.strip_prefix('•'))?
    };
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let item = rest.trim();
    (!item.is_empty()).then_some(item)
}

#[derive(Debug, Clone)]
pub struct TaskPlanner {
    analyzer: ComplexityAnalyzer,
    max_subtasks: usize,
}

impl TaskPlanner {
    pub fn new(max_subtasks: usize) -> Self {
        Self { analyzer: ComplexityAnalyzer::new(), max_subtasks: max_subtasks.max(1) }
    }

    pub fn max_subtasks(&self) -> usize {
        self.max_subtasks
    }

    /// Extract numbered or bulleted items from an executor's decomposition.
    pub fn parse_decomposition(response: &str) -> Vec<String> {
        response.lines().filter_map(list_item).map(str::to_string).collect()
    }

    /// Build a plan from explicit items, else decomposition lines, else the
    /// goal itself. `nesting_allowed` is false once the plan is flattened.
    /// A fallback plan always runs as a single leaf task.
    pub fn plan(
        &self,
        goal: &str,
        explicit: &[String],
        decomposition: Option<&str>,
        depth: u32,
        max_depth: u32,
        nesting_allowed: bool,
    ) -> TaskPlan {
        let (source, items) = if explicit.is_empty() {
            let parsed = decomposition.map(Self::parse_decomposition).unwrap_or_default();
            if parsed.is_empty() {
                (PlanSource::Fallback, vec![goal.to_string()])
            } else {
                (PlanSource::Decomposed, parsed)
            }
        } else {
            (PlanSource::Explicit, explicit.to_vec())
        };
        let nesting_allowed = nesting_allowed && source != PlanSource::Fallback;

        let subtasks = items
            .into_iter()
            .take(self.max_subtasks)
            .enumerate()
            .map(|(index, description)| {
                let nested = nesting_allowed && self.should_nest(&description, depth, max_depth);
                PlannedSubtask { index, description, nested }
            })
            .collect();

        TaskPlan { source, subtasks }
    }

    /// A child at `depth + 1` nests when its own text calls for decomposition
    /// and it would still sit below the depth cap.
    pub fn should_nest(&self, description: &str, depth: u32, max_depth: u32) -> bool {
        if depth + 1 >= max_depth {
            return false;
        }
        let profile = self.analyzer.analyze_text(description);
        profile.cognitive.is_high() || profile.requires_decomposition()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_numbered_and_bulleted_lines() {
        let response = "Plan:\n1. Profile the hot path\n2) Cache lookups\n- Add metrics\n* Ship\n3.missing space\nprose line";
        assert_eq!(
            TaskPlanner::parse_decomposition(response),
            vec!["Profile the hot path", "Cache lookups", "Add metrics", "Ship"]
        );
    }

    #[test]
    fn test_explicit_items_win_and_are_capped() {
        let planner = TaskPlanner::new(2);
        let explicit = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let plan = planner.plan("goal", &explicit, Some("1. ignored"), 0, 8, true);
        assert_eq!(plan.source, PlanSource::Explicit);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.subtasks[1].description, "b");
    }

    #[test]
    fn test_fallback_to_single_subtask() {
        let plan = TaskPlanner::new(6).plan("write the report", &[], Some("no list here"), 0, 8, true);
        assert_eq!(plan.source, PlanSource::Fallback);
        assert_eq!(plan.subtasks.len(), 1);
        assert_eq!(plan.subtasks[0].description, "write the report");
    }

    #[test]
    fn test_fallback_never_nests() {
        let goal = "Design a comprehensive multi-stage migration";
        let planner = TaskPlanner::new(6);
        assert!(planner.should_nest(goal, 0, 8));

        let plan = planner.plan(goal, &[], Some("I would approach this holistically."), 0, 8, true);
        assert_eq!(plan.source, PlanSource::Fallback);
        assert_eq!(plan.nested_count(), 0);
    }

    #[test]
    fn test_nesting_respects_depth_cap_and_flatten() {
        let planner = TaskPlanner::new(6);
        let heavy = vec!["Design a comprehensive multi-stage rollout".to_string(), "rename a file".to_string()];

        let plan = planner.plan("goal", &heavy, None, 0, 8, true);
        assert!(plan.subtasks[0].nested);
        assert!(!plan.subtasks[1].nested);

        let at_cap = planner.plan("goal", &heavy, None, 7, 8, true);
        assert_eq!(at_cap.nested_count(), 0);

        let flattened = planner.plan("goal", &heavy, None, 0, 8, false);
        assert_eq!(flattened.nested_count(), 0);
    }
}

//! Heuristic complexity profiling of workflow submissions.

use crate::domain::models::{
    ComplexityLevel, ComplexityProfile, Urgency, ValidationLevel, WorkflowInput, WorkflowRequest,
};

const DEFINITIONAL_PREFIXES: [&str; 6] = ["what is", "what are", "define", "explain", "list", "who is"];
const HIGH_COGNITION_MARKERS: [&str; 7] = [
    "complex",
    "comprehensive",
    "detailed",
    "multiple",
    "various",
    "multi-stage",
    "end-to-end",
];
const LOW_COGNITION_MARKERS: [&str; 3] = ["simple", "basic", "quick"];
const SHORT_PROMPT_WORDS: usize = 12;

fn count_level(count: usize) -> ComplexityLevel {
    match count {
        n if n > 5 => ComplexityLevel::High,
        n if n > 2 => ComplexityLevel::Medium,
        _ => ComplexityLevel::Low,
    }
}

/// Derives an eight-dimension [`ComplexityProfile`] from a workflow input.
#[derive(Debug, Clone, Default)]
pub struct ComplexityAnalyzer;

impl ComplexityAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, input: &WorkflowInput) -> ComplexityProfile {
        let ctx = &input.execution_context;
        let mut profile = ComplexityProfile {
            cognitive: self.cognitive(&input.request),
            data: count_level(ctx.data_sources.len()),
            ..ComplexityProfile::default()
        };

        if let WorkflowRequest::StructuredTask { deliverables, technical_requirements, .. } = &input.request {
            profile.technical = count_level(technical_requirements.len());
            if technical_requirements.iter().any(|r| r.to_lowercase().contains("complex")) {
                profile.technical = ComplexityLevel::High;
            }
            profile.scope = count_level(deliverables.len());
            profile.coordination = profile.scope;
        }
        if let WorkflowRequest::GoalWorkflow { success_criteria, .. } = &input.request {
            profile.scope = count_level(success_criteria.len()).max(ComplexityLevel::Medium);
        }

        profile.quality = match ctx.validation_level {
            ValidationLevel::Minimal => ComplexityLevel::Low,
            ValidationLevel::Standard => ComplexityLevel::Medium,
            ValidationLevel::Strict | ValidationLevel::Critical => ComplexityLevel::High,
        };

        (profile.time_sensitivity, profile.risk) = match input.urgency {
            Urgency::Critical => (ComplexityLevel::High, ComplexityLevel::High),
            Urgency::High => (ComplexityLevel::Medium, ComplexityLevel::Medium),
            Urgency::Normal | Urgency::Low => (ComplexityLevel::Low, ComplexityLevel::Low),
        };
        if let Some(risk) = ctx.risk_level {
            profile.risk = risk;
        }

        profile
    }

    /// Profile a bare piece of text, as produced for a decomposed subtask.
    pub fn analyze_text(&self, text: &str) -> ComplexityProfile {
        let cognitive = self.text_cognition(text);
        let breadth = text.split([';', ',']).filter(|s| !s.trim().is_empty()).count();
        ComplexityProfile {
            cognitive,
            scope: count_level(breadth),
            coordination: count_level(breadth),
            ..ComplexityProfile::default()
        }
    }

    fn cognitive(&self, request: &WorkflowRequest) -> ComplexityLevel {
        match request {
            WorkflowRequest::GoalWorkflow { .. } => ComplexityLevel::High,
            other => self.text_cognition(&other.goal_text()),
        }
    }

    fn text_cognition(&self, text: &str) -> ComplexityLevel {
        let lowered = text.to_lowercase();
        let words = lowered.split_whitespace().count();

        if words <= SHORT_PROMPT_WORDS && DEFINITIONAL_PREFIXES.iter().any(|p| lowered.starts_with(p)) {
            return ComplexityLevel::Low;
        }
        if HIGH_COGNITION_MARKERS.iter().any(|m| lowered.contains(m)) {
            return ComplexityLevel::High;
        }
        if LOW_COGNITION_MARKERS.iter().any(|m| lowered.contains(m)) {
            return ComplexityLevel::Low;
        }
        ComplexityLevel::Medium
    }
}

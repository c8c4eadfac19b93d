pub mod agent_arena;
pub mod complexity_analyzer;
pub mod failure_recovery;
pub mod learning;
pub mod orchestrator;
pub mod resource_manager;
pub mod result_synthesizer;
pub mod strategy_selector;
pub mod task_planner;

pub use agent_arena::{AgentArena, ArenaCounts};
pub use complexity_analyzer::ComplexityAnalyzer;
pub use failure_recovery::{FailureRecoveryController, PlanGate, RetryPolicy, TriggerInputs};
pub use learning::{AdaptationEngine, ExecutionParameters, LearningEngine, PatternAnalyzer, Scorer};
pub use orchestrator::{OrchestrationEngine, Orchestrator, RunControl, RunState, WorkflowHandle};
pub use resource_manager::{CarvedBudget, ResourceManager, SlotReservation};
pub use result_synthesizer::{MergeMode, ResultSynthesizer, Synthesis, UnitResult};
pub use strategy_selector::{
    DecisionSource, Recommendation, SelectionContext, StrategyAdvisor, StrategyDecision, StrategySelector,
    TimeBudget,
};
pub use task_planner::{PlanSource, PlannedSubtask, TaskPlan, TaskPlanner};

//! Workflow orchestration.
//!
//! The [`Orchestrator`] runs one workflow end to end: it analyses the input,
//! selects and admits a strategy, drives the fan-out through a top-level
//! [`scope::Scope`] (which nests sub-orchestrator scopes as needed), monitors
//! the run and records the outcome for the learning engine. Every failure
//! path resolves into an [`OrchestratorResult`].

pub mod context;
pub mod engine;
mod fan_out;
mod monitoring;
pub mod run_control;
mod scope;

use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::Instrument;
use uuid::Uuid;

use crate::domain::errors::{ErrorKind, OrchestrationError, OrchestrationResult};
use crate::domain::models::{
    ComplexityBucket, ExecutionRecord, NodeStatus, OrchestratorKind, OrchestratorResult, OrchestratorStatus,
    ResultError, StatusSnapshot, Strategy, ThoughtTreeNode, WorkflowInput, WorkflowPhase, WorkflowRequest,
};
use crate::services::learning::ExecutionParameters;
use crate::services::resource_manager::ResourceManager;
use crate::services::strategy_selector::{SelectionContext, TimeBudget};

pub use context::GlobalContext;
pub use engine::{OrchestrationEngine, WorkflowHandle};
pub use run_control::{RunControl, RunState};

use scope::{Deps, Inputs, RunSettings, Scope, WorkflowRun};

/// Runs workflows against the engine's shared services. Pause, resume and
/// cancel apply to every workflow this orchestrator is running.
pub struct Orchestrator {
    deps: Arc<Deps>,
    control: RunControl,
    status: Arc<watch::Sender<StatusSnapshot>>,
}

impl Orchestrator {
    pub(crate) fn new(deps: Arc<Deps>) -> Self {
        let (status, _rx) = watch::channel(StatusSnapshot::default());
        Self { deps, control: RunControl::new(), status: Arc::new(status) }
    }

    /// Stop spawning new units; in-flight agents stop at their next checkpoint.
    pub fn cancel(&self) -> bool {
        let cancelled = self.control.cancel();
        if cancelled {
            tracing::info!("workflow cancellation requested");
        }
        cancelled
    }

    pub fn pause(&self) -> bool {
        self.control.pause()
    }

    pub fn resume(&self) -> bool {
        self.control.resume()
    }

    pub fn run_state(&self) -> RunState {
        self.control.state()
    }

    /// Latest status snapshot. Never blocks on execution.
    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    fn set_phase(&self, phase: WorkflowPhase) {
        self.status.send_modify(|s| s.phase = phase);
    }

    pub async fn execute_workflow(&self, input: WorkflowInput) -> OrchestratorResult {
        let input = input.normalized();
        let span = tracing::info_span!(
            "workflow",
            workflow_id = %input.id,
            workflow_type = %input.workflow_type()
        );
        self.run(input).instrument(span).await
    }

    async fn run(&self, input: WorkflowInput) -> OrchestratorResult {
        let started = Instant::now();
        let started_at = Utc::now();
        let config = &self.deps.config;
        self.set_phase(WorkflowPhase::Analyzing);

        let goal = input.request.goal_text();
        if goal.is_empty() {
            return self.reject(&input, started, &OrchestrationError::Permanent("workflow has no goal text".to_string()));
        }

        let (root, recall_from) = match &input.request {
            WorkflowRequest::Continuation { parent_node_id, inherit_context, .. } => {
                match self.deps.store.get_node(*parent_node_id).await {
                    Ok(Some(parent)) => (parent.child(&goal), inherit_context.then_some(parent.id)),
                    Ok(None) => {
                        let error = OrchestrationError::Permanent(format!("parent node {parent_node_id} not found"));
                        return self.reject(&input, started, &error);
                    }
                    Err(e) => return self.reject(&input, started, &e.into()),
                }
            }
            _ => (ThoughtTreeNode::root(&goal), None),
        };

        let profile = self.deps.analyzer.analyze(&input);
        let context = &input.execution_context;
        let deadline = Duration::from_secs(
            context.max_execution_time_secs.unwrap_or(config.budget.max_execution_time_secs),
        );
        let time_budget = if deadline.as_secs() < config.budget.tight_time_budget_secs {
            TimeBudget::Tight
        } else {
            TimeBudget::Ample
        };
        let decision = self
            .deps
            .selector
            .select(
                input.workflow_type(),
                &profile,
                SelectionContext { time_budget, optimization_focus: context.optimization_focus },
            )
            .await;
        tracing::info!(
            strategy = %decision.strategy,
            source = ?decision.source,
            bucket = %profile.bucket().as_str(),
            reason = %decision.reason,
            "strategy selected"
        );

        let params = self.tune(profile.bucket()).await;
        let resources = ResourceManager::new(config.resources.max_concurrent_agents, config.resources.max_recursion_depth);
        let strategy = match self.admit(&resources, decision.strategy).await {
            Ok(strategy) => strategy,
            Err(e) => return self.reject(&input, started, &e),
        };

        let run = Arc::new(WorkflowRun::new(RunSettings {
            workflow_id: input.id,
            control: self.control.clone(),
            retry: self
                .deps
                .recovery
                .retry_policy()
                .with_max_retries(params.retry_count)
                .with_call_timeout(params.timeout),
            concurrency: params.concurrency.clamp(1, resources.max_concurrent_agents().max(1)),
            tolerance: context.failure_tolerance,
            cost_budget: context.max_cost.unwrap_or(config.budget.max_cost),
            deadline,
            max_depth: config.resources.max_recursion_depth,
            execute_council_decision: context.execute_council_decision,
            base_inputs: Self::base_inputs(&input),
        }));
        let scope = Arc::new(Scope::new(OrchestratorKind::TopLevel, None, root.id, resources, run.clone(), self.deps.clone()));

        let mut root = match scope.open_node(root).await {
            Ok(root) => root,
            Err(e) => return self.reject(&input, started, &e),
        };
        if let Err(e) = scope.persist_record().await {
            tracing::warn!(orchestrator_id = %scope.id, error = %e, "failed to persist orchestrator record");
        }

        let mut inputs = run.base_inputs.clone();
        if let Some(parent_id) = recall_from {
            match scope.recall(&root, parent_id).await {
                Ok(inherited) => {
                    inputs.insert("inherited_context".to_string(), inherited);
                }
                Err(e) => tracing::warn!(parent_node_id = %parent_id, error = %e, "context inheritance failed"),
            }
        }

        let monitor = monitoring::spawn_monitor(run.clone(), self.deps.recovery.clone(), self.status.clone());
        self.set_phase(WorkflowPhase::Executing);

        let outcome = scope
            .run_strategy(strategy, &root, &goal, input.request.explicit_items(), &inputs)
            .await;
        monitor.abort();
        self.set_phase(WorkflowPhase::Synthesizing);

        let outcome = match outcome {
            Err(mut error) if run.control.is_cancelled() => {
                error.kind = ErrorKind::Cancelled;
                Err(error)
            }
            other => other,
        };
        let summary = outcome.as_ref().map(|r| r.content.clone()).map_err(Clone::clone);
        root.record("strategy", json!(strategy));
        scope.close_node(&mut root, &summary).await;
        scope
            .close(if outcome.is_ok() { OrchestratorStatus::Completed } else { OrchestratorStatus::Failed })
            .await;
        scope.terminate_resolved().await;

        let counts = run.arena.counts().await;
        let mut usage = run.meter.snapshot();
        usage.agents_spawned = counts.total;
        usage.agents_completed = counts.completed;
        usage.agents_failed = counts.failed;

        let mut record =
            ExecutionRecord::new(input.id, root.id, strategy, profile, started_at, Utc::now());
        record.selected_strategy = decision.strategy;
        record.usage = usage;
        record.root_succeeded = root.status == NodeStatus::Completed;
        record.alignment = input.alignment();
        let record_id = record.id;
        self.submit_record(record).await;

        let fired = run.fired();
        let mut metadata = HashMap::from([
            ("strategy".to_string(), json!(strategy)),
            ("selected_strategy".to_string(), json!(decision.strategy)),
            ("degraded".to_string(), json!(strategy != decision.strategy)),
            ("decision_source".to_string(), json!(decision.source)),
            ("decision_reason".to_string(), json!(decision.reason)),
            ("workflow_type".to_string(), json!(input.workflow_type())),
            ("complexity_bucket".to_string(), json!(profile.bucket())),
            ("agents_spawned".to_string(), json!(usage.agents_spawned)),
            ("agents_completed".to_string(), json!(usage.agents_completed)),
            ("agents_failed".to_string(), json!(usage.agents_failed)),
            ("peak_concurrency".to_string(), json!(usage.peak_concurrency)),
            ("retries".to_string(), json!(usage.retries)),
            ("tokens".to_string(), json!(usage.tokens)),
            ("orchestrator_id".to_string(), json!(scope.id)),
            ("record_id".to_string(), json!(record_id)),
            ("triggers".to_string(), json!(fired)),
        ]);
        if let Some(parent_id) = recall_from {
            metadata.insert("inherited_from".to_string(), json!(parent_id));
        }

        let execution_time = started.elapsed();
        let success = outcome.is_ok();
        self.status.send_modify(|s| {
            s.phase = if success { WorkflowPhase::Completed } else { WorkflowPhase::Failed };
            s.progress_percentage = 100.0;
            s.agents_active = 0;
            s.agents_completed = usage.agents_completed;
            s.agents_failed = usage.agents_failed;
            s.cost_consumed = usage.cost;
            s.time_elapsed = execution_time;
        });

        match outcome {
            Ok(resolved) => {
                tracing::info!(
                    strategy = %strategy,
                    agents = usage.agents_spawned,
                    elapsed_ms = u64::try_from(execution_time.as_millis()).unwrap_or(u64::MAX),
                    "workflow completed"
                );
                OrchestratorResult {
                    workflow_id: input.id,
                    node_id: Some(root.id),
                    success: true,
                    content: resolved.content,
                    metadata,
                    execution_time,
                    cost: usage.cost,
                    error: None,
                }
            }
            Err(error) => {
                tracing::warn!(
                    strategy = %strategy,
                    unit = %error.unit,
                    error_kind = %error.kind,
                    error = %error.message,
                    "workflow failed"
                );
                OrchestratorResult {
                    workflow_id: input.id,
                    node_id: Some(root.id),
                    success: false,
                    content: String::new(),
                    metadata,
                    execution_time,
                    cost: usage.cost,
                    error: Some(error),
                }
            }
        }
    }

    /// Domain and user context handed to every executor call.
    fn base_inputs(input: &WorkflowInput) -> Inputs {
        let mut inputs: Inputs = input.domain_context.clone();
        if !input.user_context.is_empty() {
            inputs.insert("user_context".to_string(), json!(input.user_context));
        }
        let context = &input.execution_context;
        if !context.data_sources.is_empty() {
            inputs.insert("data_sources".to_string(), json!(context.data_sources));
        }
        if !context.extra.is_empty() {
            inputs.insert("execution_context".to_string(), json!(context.extra));
        }
        inputs
    }

    /// Configured execution parameters, tuned from history when enabled.
    async fn tune(&self, bucket: ComplexityBucket) -> ExecutionParameters {
        let config = &self.deps.config;
        let current = ExecutionParameters {
            timeout: Duration::from_secs(config.budget.agent_timeout_secs),
            retry_count: config.retry.max_retries,
            concurrency: config.resources.max_concurrent_agents,
        };
        if !config.learning.auto_tune {
            return current;
        }
        let tuned = self.deps.learning.adaptation().optimize(current, bucket).await;
        if tuned != current {
            tracing::debug!(
                timeout_ms = u64::try_from(tuned.timeout.as_millis()).unwrap_or(u64::MAX),
                retries = tuned.retry_count,
                concurrency = tuned.concurrency,
                "execution parameters tuned from history"
            );
        }
        tuned
    }

    /// Degrade `selected` until its fan-out shape fits the run's budget.
    ///
    /// This is a capacity check against a fresh per-run manager: the slots are
    /// released straight away and the fan-out reserves one slot per agent as
    /// it spawns. A shape is degraded only when the configured cap is smaller
    /// than the slots it needs to run at all.
    async fn admit(&self, resources: &ResourceManager, selected: Strategy) -> OrchestrationResult<Strategy> {
        let mut strategy = selected;
        loop {
            match resources.reserve(strategy.required_slots(), self.deps.reserve_timeout()).await {
                Ok(_fits) => return Ok(strategy),
                Err(e) => match strategy.degraded() {
                    Some(next) => {
                        tracing::warn!(from = %strategy, to = %next, error = %e, "resources unavailable; degrading strategy");
                        strategy = next;
                    }
                    None => return Err(e),
                },
            }
        }
    }

    /// Persist the record, then score it in the background.
    async fn submit_record(&self, record: ExecutionRecord) {
        if let Err(e) = self.deps.store.save_execution_record(&record).await {
            tracing::warn!(record_id = %record.id, error = %e, "failed to persist execution record");
            return;
        }
        let learning = self.deps.learning.clone();
        self.deps.background.track(tokio::spawn(async move {
            if let Err(e) = learning.ingest(record).await {
                tracing::warn!(error = %e, "execution record scoring failed");
            }
        }));
    }

    /// A workflow rejected before any agent ran.
    fn reject(&self, input: &WorkflowInput, started: Instant, error: &OrchestrationError) -> OrchestratorResult {
        tracing::warn!(error_kind = %error.kind(), error = %error, "workflow rejected");
        self.set_phase(WorkflowPhase::Failed);
        OrchestratorResult {
            workflow_id: input.id,
            node_id: None,
            success: false,
            content: String::new(),
            metadata: HashMap::from([("workflow_type".to_string(), json!(input.workflow_type()))]),
            execution_time: started.elapsed(),
            cost: 0.0,
            error: Some(ResultError {
                unit: format!("workflow {}", input.id),
                kind: error.kind(),
                retry_count: 0,
                message: error.to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").field("state", &self.control.state()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::executors::MockExecutor;
    use crate::adapters::memory::InMemoryStore;
    use crate::domain::models::{AgentStatus, Config, FailureTolerance};
    use crate::domain::ports::PersistenceStore;

    fn orchestrator(config: Config, executor: MockExecutor) -> (Orchestrator, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let deps = Arc::new(Deps::new(config, Arc::new(executor), store.clone()));
        (Orchestrator::new(deps), store)
    }

    #[tokio::test]
    async fn test_empty_goal_is_rejected() {
        let (orchestrator, _) = orchestrator(Config::default(), MockExecutor::new());
        let result = orchestrator.execute_workflow(WorkflowInput::user_prompt("   ")).await;
        assert!(!result.success);
        assert_eq!(result.error.as_ref().map(|e| e.kind), Some(ErrorKind::Permanent));
        assert_eq!(orchestrator.status().phase, WorkflowPhase::Failed);
    }

    #[tokio::test]
    async fn test_missing_continuation_parent_is_rejected() {
        let (orchestrator, _) = orchestrator(Config::default(), MockExecutor::new());
        let input = WorkflowInput::continuation(Uuid::new_v4(), "and then?", true);
        let result = orchestrator.execute_workflow(input).await;
        assert!(!result.success);
        assert!(result.error_message().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_single_slot_degrades_parallel_work() {
        let mut config = Config::default();
        config.resources.max_concurrent_agents = 1;
        let (orchestrator, _) = orchestrator(config, MockExecutor::new());
        let input = WorkflowInput::structured_task(
            "Ship the release",
            vec!["notes".into(), "tag".into(), "announce".into()],
        )
        .with_focus(crate::domain::models::OptimizationFocus::Speed);

        let result = orchestrator.execute_workflow(input).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.strategy(), Some(Strategy::SequentialDecomposition));
        assert_eq!(result.metadata["degraded"], json!(true));
    }

    #[tokio::test]
    async fn test_admit_releases_slots_and_degrades_only_below_need() {
        let (orchestrator, _) = orchestrator(Config::default(), MockExecutor::new());

        let roomy = ResourceManager::new(2, 8);
        let admitted = orchestrator.admit(&roomy, Strategy::RecursiveDecomposition).await.unwrap();
        assert_eq!(admitted, Strategy::RecursiveDecomposition);
        assert_eq!(roomy.available(), 2);

        let tight = ResourceManager::new(1, 8);
        let admitted = orchestrator.admit(&tight, Strategy::RecursiveDecomposition).await.unwrap();
        assert_eq!(admitted, Strategy::SequentialDecomposition);
        assert_eq!(tight.available(), 1);
    }

    #[tokio::test]
    async fn test_agents_are_terminated_and_persisted() {
        let (orchestrator, store) = orchestrator(Config::default(), MockExecutor::new());
        let result = orchestrator.execute_workflow(WorkflowInput::user_prompt("summarize the notes")).await;
        assert!(result.success);

        let root = store.get_node(result.node_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(root.status, NodeStatus::Completed);
        assert_eq!(root.metadata["strategy"], json!(Strategy::DirectExecution));
        assert_eq!(orchestrator.status().phase, WorkflowPhase::Completed);

        let record_id: Uuid = serde_json::from_value(result.metadata["record_id"].clone()).unwrap();
        let record = store.get_execution_record(record_id).await.unwrap().unwrap();
        assert!(record.root_succeeded);
        assert_eq!(record.usage.agents_spawned, 1);

        let orchestrator_id: Uuid = serde_json::from_value(result.metadata["orchestrator_id"].clone()).unwrap();
        let orchestrator_record = store.get_orchestrator(orchestrator_id).await.unwrap().unwrap();
        assert_eq!(orchestrator_record.status, OrchestratorStatus::Completed);
        assert!(!orchestrator_record.global_context.is_empty());

        let agent_id = orchestrator_record.global_context[0].agent_id;
        let agent = store.get_agent(agent_id).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Terminated);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_reports_cancelled() {
        let (orchestrator, _) = orchestrator(Config::default(), MockExecutor::new());
        orchestrator.cancel();
        let input = WorkflowInput::user_prompt("summarize the notes").with_failure_tolerance(FailureTolerance::High);
        let result = orchestrator.execute_workflow(input).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().kind, ErrorKind::Cancelled);
    }
}

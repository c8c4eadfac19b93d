//! Per-workflow shared state, per-orchestrator scopes and the agent lifecycle.
//!
//! One [`WorkflowRun`] is shared by the top-level orchestrator and every
//! sub-orchestrator it nests: the agent arena, the plan gate, run control and
//! the usage meter. A [`Scope`] is one orchestrator instance with its own
//! resource budget and global context.

use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::domain::errors::{ErrorKind, OrchestrationError, OrchestrationResult};
use crate::domain::models::{
    Agent, AgentFailure, AgentKind, AgentLog, AgentStatus, Config, FailureTolerance, NodeStatus,
    OrchestratorKind, OrchestratorRecord, OrchestratorStatus, RecoveryTrigger, ResourceUsage, ResultError,
    ThoughtTreeNode,
};
use crate::domain::ports::{PersistenceStore, WorkContext, WorkExecutor, WorkOutput, WorkPurpose};
use crate::services::agent_arena::AgentArena;
use crate::services::complexity_analyzer::ComplexityAnalyzer;
use crate::services::failure_recovery::{Attempted, FailureRecoveryController, PlanGate, RetryPolicy};
use crate::services::learning::LearningEngine;
use crate::services::resource_manager::{ResourceManager, SlotReservation};
use crate::services::result_synthesizer::ResultSynthesizer;
use crate::services::strategy_selector::StrategySelector;
use crate::services::task_planner::TaskPlanner;

use super::context::GlobalContext;
use super::run_control::RunControl;

/// Inputs handed to the executor alongside a prompt.
pub(crate) type Inputs = HashMap<String, serde_json::Value>;

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Background tasks that must not block result delivery.
#[derive(Debug, Default)]
pub(crate) struct BackgroundTasks {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundTasks {
    pub fn track(&self, handle: JoinHandle<()>) {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Await every task tracked so far.
    pub async fn drain(&self) {
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "background task aborted");
            }
        }
    }
}

/// Long-lived services shared by every workflow of an engine.
pub(crate) struct Deps {
    pub config: Config,
    pub executor: Arc<dyn WorkExecutor>,
    pub store: Arc<dyn PersistenceStore>,
    pub recovery: Arc<FailureRecoveryController>,
    pub learning: Arc<LearningEngine>,
    pub selector: StrategySelector,
    pub analyzer: ComplexityAnalyzer,
    pub planner: TaskPlanner,
    pub synthesizer: ResultSynthesizer,
    pub background: BackgroundTasks,
}

impl Deps {
    pub fn new(config: Config, executor: Arc<dyn WorkExecutor>, store: Arc<dyn PersistenceStore>) -> Self {
        let learning = Arc::new(LearningEngine::new(store.clone(), &config));
        let recovery = Arc::new(FailureRecoveryController::new(
            config.recovery.clone(),
            RetryPolicy::from_config(&config.retry, &config.budget),
            store.clone(),
        ));
        let selector = StrategySelector::new(config.learning.confidence_gate).with_advisor(learning.adaptation());
        let planner = TaskPlanner::new(config.resources.max_subtasks);
        Self {
            config,
            executor,
            store,
            recovery,
            learning,
            selector,
            analyzer: ComplexityAnalyzer::new(),
            planner,
            synthesizer: ResultSynthesizer::new(),
            background: BackgroundTasks::default(),
        }
    }

    pub fn reserve_timeout(&self) -> Duration {
        Duration::from_millis(self.config.resources.reserve_timeout_ms)
    }
}

/// Workflow-wide consumption counters.
#[derive(Debug, Default)]
pub(crate) struct UsageMeter {
    usage: Mutex<ResourceUsage>,
    active: AtomicUsize,
}

/// An agent's slot while it is Active. Dropping it releases the slot.
#[derive(Debug)]
pub(crate) struct ActiveSlot {
    _reservation: SlotReservation,
    meter: Arc<UsageMeter>,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.meter.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl UsageMeter {
    fn lock(&self) -> MutexGuard<'_, ResourceUsage> {
        self.usage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn hold(self: &Arc<Self>, reservation: SlotReservation) -> ActiveSlot {
        let now = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        let mut usage = self.lock();
        usage.peak_concurrency = usage.peak_concurrency.max(now);
        drop(usage);
        ActiveSlot { _reservation: reservation, meter: self.clone() }
    }

    pub fn record_call(&self, tokens: u64, cost: f64, retries: u32, slowest: Duration) {
        let mut usage = self.lock();
        usage.tokens += tokens;
        usage.cost += cost;
        usage.retries += retries;
        usage.slowest_unit_ms = usage.slowest_unit_ms.max(millis(slowest));
    }

    pub fn record_validation(&self, passed: bool) {
        let mut usage = self.lock();
        usage.validations_total += 1;
        if passed {
            usage.validations_passed += 1;
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn cost(&self) -> f64 {
        self.lock().cost
    }

    pub fn snapshot(&self) -> ResourceUsage {
        *self.lock()
    }
}

/// State shared by every orchestrator of one workflow.
pub(crate) struct WorkflowRun {
    pub workflow_id: Uuid,
    pub arena: AgentArena,
    pub meter: Arc<UsageMeter>,
    pub gate: Arc<PlanGate>,
    pub control: RunControl,
    pub retry: RetryPolicy,
    pub tolerance: FailureTolerance,
    pub cost_budget: f64,
    pub deadline: Duration,
    pub started: Instant,
    pub max_depth: u32,
    pub execute_council_decision: bool,
    pub base_inputs: Inputs,
    fired: Mutex<Vec<RecoveryTrigger>>,
}

/// Construction parameters for a [`WorkflowRun`].
pub(crate) struct RunSettings {
    pub workflow_id: Uuid,
    pub control: RunControl,
    pub retry: RetryPolicy,
    pub concurrency: usize,
    pub tolerance: FailureTolerance,
    pub cost_budget: f64,
    pub deadline: Duration,
    pub max_depth: u32,
    pub execute_council_decision: bool,
    pub base_inputs: Inputs,
}

impl WorkflowRun {
    pub fn new(settings: RunSettings) -> Self {
        Self {
            workflow_id: settings.workflow_id,
            arena: AgentArena::new(),
            meter: Arc::new(UsageMeter::default()),
            gate: PlanGate::new(settings.concurrency),
            control: settings.control,
            retry: settings.retry,
            tolerance: settings.tolerance,
            cost_budget: settings.cost_budget,
            deadline: settings.deadline,
            started: Instant::now(),
            max_depth: settings.max_depth,
            execute_council_decision: settings.execute_council_decision,
            base_inputs: settings.base_inputs,
            fired: Mutex::new(Vec::new()),
        }
    }

    pub fn record_triggers(&self, triggers: &[RecoveryTrigger]) {
        self.fired.lock().unwrap_or_else(PoisonError::into_inner).extend_from_slice(triggers);
    }

    /// Every trigger reaction applied so far, in firing order.
    pub fn fired(&self) -> Vec<RecoveryTrigger> {
        self.fired.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Handle to one spawned agent, owned by the routine driving it.
#[derive(Debug)]
pub(crate) struct AgentHandle {
    pub id: Uuid,
    pub kind: AgentKind,
    pub sequence: u64,
    pub node_id: Uuid,
    pub depth: u32,
    pub log: AgentLog,
    pub usage: ResourceUsage,
    slot: Option<ActiveSlot>,
}

impl AgentHandle {
    pub fn unit(&self) -> String {
        format!("agent {} ({})", self.id, self.kind)
    }
}

/// Outcome of one agent-backed unit.
#[derive(Debug)]
pub(crate) struct UnitRun {
    pub outcome: Result<String, ResultError>,
    pub usage: ResourceUsage,
}

/// One orchestrator instance.
pub(crate) struct Scope {
    pub id: Uuid,
    pub kind: OrchestratorKind,
    pub resources: ResourceManager,
    pub context: GlobalContext,
    pub run: Arc<WorkflowRun>,
    pub deps: Arc<Deps>,
    record: Mutex<OrchestratorRecord>,
    finished: Mutex<Vec<AgentLog>>,
}

impl Scope {
    pub fn new(
        kind: OrchestratorKind,
        parent_id: Option<Uuid>,
        node_id: Uuid,
        resources: ResourceManager,
        run: Arc<WorkflowRun>,
        deps: Arc<Deps>,
    ) -> Self {
        let id = Uuid::new_v4();
        let record = OrchestratorRecord::new(id, kind, parent_id, node_id, resources.max_concurrent_agents());
        Self {
            id,
            kind,
            resources,
            context: GlobalContext::new(),
            run,
            deps,
            record: Mutex::new(record),
            finished: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self) -> OrchestratorRecord {
        self.record.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub async fn persist_record(&self) -> OrchestrationResult<()> {
        let record = self.record();
        self.deps.store.save_orchestrator(&record).await?;
        Ok(())
    }

    /// Merge finished agent logs into the global context.
    pub fn merge_logs(&self) -> usize {
        let logs = std::mem::take(&mut *self.finished.lock().unwrap_or_else(PoisonError::into_inner));
        self.context.merge(logs)
    }

    /// Merge outstanding logs and persist the final record.
    pub async fn close(&self, status: OrchestratorStatus) {
        self.merge_logs();
        let record = {
            let mut record = self.record.lock().unwrap_or_else(PoisonError::into_inner);
            record.status = status;
            record.current_active_agents = self.resources.current_active_agents();
            record.global_context = self.context.view().as_ref().clone();
            record.updated_at = chrono::Utc::now();
            record.version += 1;
            record.clone()
        };
        if let Err(e) = self.deps.store.save_orchestrator(&record).await {
            tracing::warn!(orchestrator_id = %self.id, error = %e, "failed to persist orchestrator record");
        }
    }

    pub fn unit_error(&self, error: &OrchestrationError) -> ResultError {
        ResultError {
            unit: format!("orchestrator {}", self.id),
            kind: error.kind(),
            retry_count: 0,
            message: error.to_string(),
        }
    }

    fn finish_log(&self, log: AgentLog) {
        if !log.is_empty() {
            self.finished.lock().unwrap_or_else(PoisonError::into_inner).push(log);
        }
    }

    pub async fn open_node(&self, mut node: ThoughtTreeNode) -> OrchestrationResult<ThoughtTreeNode> {
        node.transition_to(NodeStatus::InProgress).map_err(OrchestrationError::Permanent)?;
        self.deps.store.save_node(&node).await?;
        Ok(node)
    }

    /// Record the outcome on the node and move it to its terminal status.
    pub async fn close_node(&self, node: &mut ThoughtTreeNode, outcome: &Result<String, ResultError>) {
        if node.is_terminal() {
            return;
        }
        let status = match outcome {
            Ok(content) => {
                node.record("output", json!(content));
                NodeStatus::Completed
            }
            Err(error) => {
                node.record("error", json!(error));
                if error.kind == ErrorKind::Cancelled {
                    NodeStatus::Cancelled
                } else {
                    NodeStatus::Failed
                }
            }
        };
        if let Err(e) = node.transition_to(status) {
            tracing::warn!(node_id = %node.id, error = %e, "node transition rejected");
            return;
        }
        if let Err(e) = self.deps.store.save_node(node).await {
            tracing::warn!(node_id = %node.id, error = %e, "failed to persist node");
        }
    }

    /// The single spawn routine for every agent kind.
    pub async fn spawn_agent(
        &self,
        kind: AgentKind,
        node: &ThoughtTreeNode,
        parent: Option<Uuid>,
    ) -> OrchestrationResult<AgentHandle> {
        self.resources.check_depth(node.depth)?;
        let mut agent = Agent::new(kind, node.id, self.id, node.depth, self.run.max_depth)
            .map_err(OrchestrationError::Permanent)?;
        if let Some(parent) = parent {
            agent = agent.with_parent(parent);
        }
        agent = agent.with_context("goal", json!(node.goal));

        let sequence = self.run.arena.insert(agent.clone()).await?;
        self.deps.store.save_agent(&agent).await?;
        tracing::debug!(
            agent_id = %agent.id,
            kind = %kind,
            depth = node.depth,
            orchestrator_id = %self.id,
            "agent spawned"
        );

        Ok(AgentHandle {
            id: agent.id,
            kind,
            sequence,
            node_id: node.id,
            depth: node.depth,
            log: AgentLog::new(agent.id, sequence),
            usage: ResourceUsage::default(),
            slot: None,
        })
    }

    /// Spawned -> Active once a slot is confirmed.
    pub async fn activate(&self, agent: &mut AgentHandle) -> OrchestrationResult<()> {
        self.run.control.checkpoint("agent activation").await?;
        let reservation = self.resources.reserve_agent_slot(self.deps.reserve_timeout()).await?;
        let snapshot = self.run.arena.transition(agent.id, AgentStatus::Active).await?;
        agent.slot = Some(self.run.meter.hold(reservation));
        self.deps.store.save_agent(&snapshot).await?;
        Ok(())
    }

    /// Active -> Waiting. The slot is released while children run.
    pub async fn suspend(&self, agent: &mut AgentHandle) -> OrchestrationResult<()> {
        let snapshot = self.run.arena.transition(agent.id, AgentStatus::Waiting).await?;
        agent.slot = None;
        self.deps.store.save_agent(&snapshot).await?;
        Ok(())
    }

    /// Waiting -> Coordinating; the arena refuses while children are unresolved.
    pub async fn coordinate(&self, agent: &AgentHandle) -> OrchestrationResult<()> {
        let snapshot = self.run.arena.transition(agent.id, AgentStatus::Coordinating).await?;
        self.deps.store.save_agent(&snapshot).await?;
        Ok(())
    }

    pub async fn complete(&self, mut agent: AgentHandle, content: &str) -> Result<(), ResultError> {
        agent.log.append("output", json!(content));
        let persisted = async {
            self.run.arena.record_retries(agent.id, agent.usage.retries).await?;
            let snapshot = self.run.arena.transition(agent.id, AgentStatus::Completed).await?;
            self.deps.store.save_agent(&snapshot).await?;
            Ok::<(), OrchestrationError>(())
        }
        .await;

        match persisted {
            Ok(()) => {
                agent.slot = None;
                tracing::debug!(agent_id = %agent.id, kind = %agent.kind, "agent completed");
                self.finish_log(agent.log);
                Ok(())
            }
            Err(e) => Err(self.fail(agent, &e, Vec::new()).await),
        }
    }

    /// Any non-terminal state -> Failed. Returns the diagnostic for the parent.
    pub async fn fail(&self, mut agent: AgentHandle, error: &OrchestrationError, child_errors: Vec<String>) -> ResultError {
        let result_error = ResultError {
            unit: agent.unit(),
            kind: error.kind(),
            retry_count: agent.usage.retries,
            message: error.to_string(),
        };
        agent.log.append("error", json!(&result_error));

        let failure = AgentFailure {
            kind: result_error.kind,
            message: result_error.message.clone(),
            retry_count: result_error.retry_count,
            child_errors,
        };
        match self.run.arena.fail(agent.id, failure).await {
            Ok(snapshot) => {
                if let Err(e) = self.deps.store.save_agent(&snapshot).await {
                    tracing::warn!(agent_id = %agent.id, error = %e, "failed to persist agent");
                }
            }
            Err(e) => tracing::warn!(agent_id = %agent.id, error = %e, "agent failure not recorded"),
        }
        tracing::warn!(
            agent_id = %agent.id,
            kind = %agent.kind,
            error_kind = %result_error.kind,
            retries = result_error.retry_count,
            error = %result_error.message,
            "agent failed"
        );

        agent.slot = None;
        self.finish_log(agent.log);
        result_error
    }

    /// One executor call under the retry policy, abandoned on cancellation.
    pub async fn call(
        &self,
        agent: &AgentHandle,
        purpose: WorkPurpose,
        prompt: &str,
        inputs: &Inputs,
    ) -> Attempted<WorkOutput> {
        let executor = self.deps.executor.clone();
        let base = WorkContext {
            workflow_id: self.run.workflow_id,
            agent_id: agent.id,
            agent_kind: agent.kind,
            node_id: agent.node_id,
            depth: agent.depth,
            purpose: purpose.clone(),
            attempt: 0,
            inputs: inputs.clone(),
        };

        let attempts = self.deps.recovery.execute_with_retry(executor.name(), Some(agent.id), self.run.retry, |attempt| {
            let executor = executor.clone();
            let context = WorkContext { attempt, ..base.clone() };
            let prompt = prompt.to_string();
            async move { executor.execute(&prompt, &context).await }
        });

        tokio::select! {
            attempted = attempts => attempted,
            () = self.run.control.cancelled() => Attempted {
                outcome: Err(OrchestrationError::Cancelled(format!("{purpose} call"))),
                retries: 0,
                slowest: Duration::ZERO,
            },
        }
    }

    /// Fold a call's consumption into the agent and the workflow meter.
    pub fn account(&self, agent: &mut AgentHandle, attempted: &Attempted<WorkOutput>) {
        let (tokens, cost) = attempted.outcome.as_ref().map_or((0, 0.0), |o| (o.tokens, o.cost));
        agent.usage.tokens += tokens;
        agent.usage.cost += cost;
        agent.usage.retries += attempted.retries;
        agent.usage.slowest_unit_ms = agent.usage.slowest_unit_ms.max(millis(attempted.slowest));
        self.run.meter.record_call(tokens, cost, attempted.retries, attempted.slowest);
    }

    /// Call, account and classify. An executor rejection (`success == false`)
    /// is a permanent failure for every purpose except validation.
    pub async fn invoke(
        &self,
        agent: &mut AgentHandle,
        purpose: WorkPurpose,
        prompt: &str,
        inputs: &Inputs,
    ) -> OrchestrationResult<WorkOutput> {
        let attempted = self.call(agent, purpose.clone(), prompt, inputs).await;
        self.account(agent, &attempted);
        self.classify(agent, &purpose, attempted.outcome).await
    }

    pub async fn classify(
        &self,
        agent: &AgentHandle,
        purpose: &WorkPurpose,
        outcome: OrchestrationResult<WorkOutput>,
    ) -> OrchestrationResult<WorkOutput> {
        let output = outcome?;
        if output.success || *purpose == WorkPurpose::Validate {
            return Ok(output);
        }
        let message = format!("executor rejected {purpose}: {}", output.content.trim());
        self.deps
            .recovery
            .record_failure(self.deps.executor.name(), ErrorKind::Permanent, &message, Some(agent.id))
            .await;
        Err(OrchestrationError::Permanent(message))
    }

    /// Drive a spawned agent through Active to Completed or Failed with one call.
    pub async fn execute_agent(
        &self,
        mut agent: AgentHandle,
        purpose: WorkPurpose,
        prompt: &str,
        inputs: &Inputs,
    ) -> UnitRun {
        let outcome = match self.activate(&mut agent).await {
            Ok(()) => self.invoke(&mut agent, purpose, prompt, inputs).await,
            Err(e) => Err(e),
        };
        let usage = agent.usage;
        let outcome = match outcome {
            Ok(output) => self.complete(agent, &output.content).await.map(|()| output.content),
            Err(e) => Err(self.fail(agent, &e, Vec::new()).await),
        };
        UnitRun { outcome, usage }
    }

    /// Completed or Failed -> Terminated for every agent of the workflow.
    pub async fn terminate_resolved(&self) {
        for agent in self.run.arena.all().await {
            if !matches!(agent.status, AgentStatus::Completed | AgentStatus::Failed) {
                continue;
            }
            match self.run.arena.transition(agent.id, AgentStatus::Terminated).await {
                Ok(snapshot) => {
                    if let Err(e) = self.deps.store.save_agent(&snapshot).await {
                        tracing::warn!(agent_id = %agent.id, error = %e, "failed to persist terminated agent");
                    }
                }
                Err(e) => tracing::warn!(agent_id = %agent.id, error = %e, "agent termination rejected"),
            }
        }
    }
}

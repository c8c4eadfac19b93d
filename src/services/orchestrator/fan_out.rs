//! Fan-out shapes, one routine per strategy.
//!
//! Leaf task units pass through the workflow's [`PlanGate`] before they spawn,
//! so recovery reactions (halved concurrency, flattening, an inserted failure
//! analysis) only affect work that has not started yet. Nested
//! sub-orchestrators are not gated; their own leaves are.
//!
//! [`PlanGate`]: crate::services::failure_recovery::PlanGate

use futures::future::{join_all, BoxFuture};
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::domain::errors::{ErrorKind, OrchestrationError, OrchestrationResult};
use crate::domain::models::{
    AgentKind, FailureTolerance, OrchestratorKind, OrchestratorStatus, ResourceUsage, ResultError, Strategy,
    ThoughtTreeNode,
};
use crate::domain::ports::{WorkOutput, WorkPurpose};
use crate::services::result_synthesizer::{MergeMode, UnitResult};
use crate::services::task_planner::{PlannedSubtask, TaskPlan};

use super::scope::{AgentHandle, Inputs, Scope, UnitRun};

/// A strategy's merged content and the child units it came from.
#[derive(Debug, Clone)]
pub(crate) struct Resolved {
    pub content: String,
    pub children: Vec<UnitResult>,
}

pub(crate) type StrategyOutcome = Result<Resolved, ResultError>;

const FAILURE_SAMPLE: usize = 5;

fn seq(index: usize) -> u64 {
    u64::try_from(index).unwrap_or(u64::MAX)
}

fn unit_result(sequence: u64, label: impl Into<String>, run: UnitRun) -> UnitResult {
    match run.outcome {
        Ok(content) => UnitResult::completed(sequence, label, content).with_usage(run.usage),
        Err(error) => UnitResult::failed(sequence, label, error).with_usage(run.usage),
    }
}

fn child_errors(results: &[UnitResult]) -> Vec<String> {
    results.iter().filter_map(|r| r.error.as_ref().map(ToString::to_string)).collect()
}

/// Validator judgement of one refinement round.
#[derive(Debug, Clone, PartialEq)]
struct Verdict {
    passed: bool,
    score: f64,
    feedback: String,
}

impl Verdict {
    fn judge(output: &WorkOutput) -> Self {
        let lowered = output.content.to_lowercase();
        let passed = output.success && !lowered.contains("needs improvement") && !lowered.contains("incomplete");
        let score = parse_score(&lowered).unwrap_or(if passed { 1.0 } else { 0.5 });
        Self { passed, score, feedback: output.content.clone() }
    }

    fn failed(feedback: String) -> Self {
        Self { passed: false, score: 0.0, feedback }
    }
}

/// Parse `score: 0.8` (or `score: 8` on a ten-point scale).
fn parse_score(text: &str) -> Option<f64> {
    let start = text.find("score:")? + "score:".len();
    let number: String = text[start..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let value: f64 = number.parse().ok()?;
    let value = if value > 1.0 { value / 10.0 } else { value };
    Some(value.clamp(0.0, 1.0))
}

impl Scope {
    pub(crate) async fn run_strategy(
        self: &Arc<Self>,
        strategy: Strategy,
        node: &ThoughtTreeNode,
        goal: &str,
        explicit: &[String],
        inputs: &Inputs,
    ) -> StrategyOutcome {
        match strategy {
            Strategy::DirectExecution => self.direct(node, goal, inputs).await,
            Strategy::SequentialDecomposition | Strategy::ParallelExecution | Strategy::RecursiveDecomposition => {
                self.decompose(strategy, node, goal, explicit, inputs).await
            }
            Strategy::CouncilDriven => self.council(node, goal, inputs).await,
            Strategy::IterativeRefinement => self.refine(node, goal, inputs).await,
        }
    }

    async fn direct(&self, node: &ThoughtTreeNode, goal: &str, inputs: &Inputs) -> StrategyOutcome {
        let agent = self.spawn_agent(AgentKind::Task, node, None).await.map_err(|e| self.unit_error(&e))?;
        let run = self.execute_agent(agent, WorkPurpose::Execute, goal, inputs).await;
        run.outcome.map(|content| Resolved { content, children: Vec::new() })
    }

    /// Sequential, parallel and recursive shapes share one coordinator flow:
    /// plan while Active, wait on children, then synthesize while Coordinating.
    async fn decompose(
        self: &Arc<Self>,
        strategy: Strategy,
        node: &ThoughtTreeNode,
        goal: &str,
        explicit: &[String],
        inputs: &Inputs,
    ) -> StrategyOutcome {
        let mut coordinator = self.spawn_agent(AgentKind::Task, node, None).await.map_err(|e| self.unit_error(&e))?;
        if let Err(e) = self.activate(&mut coordinator).await {
            return Err(self.fail(coordinator, &e, Vec::new()).await);
        }

        let decomposition = if explicit.is_empty() {
            let prompt = format!(
                "Break the following work into at most {} numbered subtasks:\n{goal}",
                self.deps.planner.max_subtasks()
            );
            match self.invoke(&mut coordinator, WorkPurpose::Decompose, &prompt, inputs).await {
                Ok(output) => Some(output.content),
                Err(e) => return Err(self.fail(coordinator, &e, Vec::new()).await),
            }
        } else {
            None
        };

        let nesting = strategy == Strategy::RecursiveDecomposition && !self.run.gate.flatten();
        let plan = self.deps.planner.plan(
            goal,
            explicit,
            decomposition.as_deref(),
            node.depth,
            self.run.max_depth,
            nesting,
        );
        coordinator.log.append("plan", json!(plan));
        tracing::info!(
            orchestrator_id = %self.id,
            strategy = %strategy,
            source = ?plan.source,
            subtasks = plan.len(),
            nested = plan.nested_count(),
            "work decomposed"
        );

        if let Err(e) = self.suspend(&mut coordinator).await {
            return Err(self.fail(coordinator, &e, Vec::new()).await);
        }
        if let Err(e) = self.run.arena.set_coordination(coordinator.id, "planned_units", json!(plan.len())).await {
            tracing::warn!(agent_id = %coordinator.id, error = %e, "coordination state not recorded");
        }

        let results = match strategy {
            Strategy::SequentialDecomposition => self.chain(node, coordinator.id, &plan, inputs).await,
            Strategy::ParallelExecution => self.fan_out(node, coordinator.id, &plan, inputs).await,
            _ => self.recurse(node, coordinator.id, &plan, inputs).await,
        };

        self.settle(coordinator, strategy, results, plan.len()).await
    }

    /// Waiting -> Coordinating -> Completed | Failed under the failure tolerance.
    async fn settle(
        &self,
        coordinator: AgentHandle,
        strategy: Strategy,
        results: Vec<UnitResult>,
        expected: usize,
    ) -> StrategyOutcome {
        if let Err(e) = self.coordinate(&coordinator).await {
            return Err(self.fail(coordinator, &e, child_errors(&results)).await);
        }
        self.merge_logs();

        if self.run.control.is_cancelled() {
            let error = OrchestrationError::Cancelled("synthesis".to_string());
            return Err(self.fail(coordinator, &error, child_errors(&results)).await);
        }

        match self
            .deps
            .synthesizer
            .synthesize(MergeMode::for_strategy(strategy), &results, expected, self.run.tolerance)
        {
            Ok(synthesis) => {
                tracing::info!(
                    orchestrator_id = %self.id,
                    completed = synthesis.completed,
                    failed = synthesis.failed,
                    total = synthesis.total,
                    "children synthesized"
                );
                self.complete(coordinator, &synthesis.content).await?;
                Ok(Resolved { content: synthesis.content, children: results })
            }
            Err(e) => Err(self.fail(coordinator, &e, child_errors(&results)).await),
        }
    }

    /// Each step starts only after its predecessor completed; a failure halts the chain.
    async fn chain(
        self: &Arc<Self>,
        node: &ThoughtTreeNode,
        parent: Uuid,
        plan: &TaskPlan,
        inputs: &Inputs,
    ) -> Vec<UnitResult> {
        let mut inputs = inputs.clone();
        let mut results = Vec::with_capacity(plan.len());
        for subtask in &plan.subtasks {
            if self.run.control.checkpoint("next sequential step").await.is_err() {
                break;
            }
            self.absorb_failure_analysis(node, parent, &mut inputs).await;

            let pass = self.run.gate.enter().await;
            let result = self.clone().run_subtask(node.clone(), parent, subtask.clone(), inputs.clone()).await;
            drop(pass);

            let succeeded = result.success;
            if succeeded {
                inputs.insert("previous".to_string(), json!(result.content));
            }
            results.push(result);
            if !succeeded {
                tracing::warn!(orchestrator_id = %self.id, step = subtask.index, "sequential chain halted");
                break;
            }
        }
        results
    }

    async fn fan_out(
        self: &Arc<Self>,
        node: &ThoughtTreeNode,
        parent: Uuid,
        plan: &TaskPlan,
        inputs: &Inputs,
    ) -> Vec<UnitResult> {
        let mut inputs = inputs.clone();
        let mut set = JoinSet::new();
        for subtask in &plan.subtasks {
            if self.run.control.checkpoint("next parallel spawn").await.is_err() {
                break;
            }
            self.absorb_failure_analysis(node, parent, &mut inputs).await;

            let pass = self.run.gate.enter().await;
            let unit = self.clone().run_subtask(node.clone(), parent, subtask.clone(), inputs.clone());
            set.spawn(async move {
                let _pass = pass;
                unit.await
            });
        }
        Self::collect(set).await
    }

    /// Children are task agents or nested sub-orchestrators. Once the plan is
    /// flattened, the remaining children run in order without nesting.
    async fn recurse(
        self: &Arc<Self>,
        node: &ThoughtTreeNode,
        parent: Uuid,
        plan: &TaskPlan,
        inputs: &Inputs,
    ) -> Vec<UnitResult> {
        let mut inputs = inputs.clone();
        let mut set = JoinSet::new();
        let mut results = Vec::with_capacity(plan.len());
        let total = plan.len();

        for (position, subtask) in plan.subtasks.iter().enumerate() {
            if self.run.control.checkpoint("next recursive spawn").await.is_err() {
                break;
            }
            self.absorb_failure_analysis(node, parent, &mut inputs).await;

            if self.run.gate.flatten() {
                let pass = self.run.gate.enter().await;
                let result = self.clone().run_subtask(node.clone(), parent, subtask.clone(), inputs.clone()).await;
                drop(pass);
                let succeeded = result.success;
                results.push(result);
                if !succeeded {
                    tracing::warn!(orchestrator_id = %self.id, step = subtask.index, "flattened chain halted");
                    break;
                }
                continue;
            }

            if subtask.nested {
                let remaining = total - position;
                set.spawn(self.clone().run_nested(node.clone(), parent, subtask.clone(), inputs.clone(), remaining));
            } else {
                let pass = self.run.gate.enter().await;
                let unit = self.clone().run_subtask(node.clone(), parent, subtask.clone(), inputs.clone());
                set.spawn(async move {
                    let _pass = pass;
                    unit.await
                });
            }
        }

        results.extend(Self::collect(set).await);
        results
    }

    async fn collect(mut set: JoinSet<UnitResult>) -> Vec<UnitResult> {
        let mut results = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!(error = %e, "child unit task aborted"),
            }
        }
        results
    }

    /// Spawn and run one task agent on an already-open node, then close the node.
    async fn run_leaf(&self, mut node: ThoughtTreeNode, parent: Uuid, prompt: &str, inputs: &Inputs) -> UnitRun {
        let run = match self.spawn_agent(AgentKind::Task, &node, Some(parent)).await {
            Ok(agent) => self.execute_agent(agent, WorkPurpose::Execute, prompt, inputs).await,
            Err(e) => UnitRun { outcome: Err(self.unit_error(&e)), usage: ResourceUsage::default() },
        };
        self.close_node(&mut node, &run.outcome).await;
        run
    }

    async fn run_subtask(
        self: Arc<Self>,
        parent_node: ThoughtTreeNode,
        parent: Uuid,
        subtask: PlannedSubtask,
        inputs: Inputs,
    ) -> UnitResult {
        let sequence = seq(subtask.index);
        let run = match self.open_node(parent_node.child(&subtask.description)).await {
            Ok(child) => self.run_leaf(child, parent, &subtask.description, &inputs).await,
            Err(e) => UnitRun { outcome: Err(self.unit_error(&e)), usage: ResourceUsage::default() },
        };
        unit_result(sequence, subtask.description, run)
    }

    /// Run a subtask as a sub-orchestrator with a budget carved from this one.
    /// Falls back to a task agent when no budget can be carved.
    fn run_nested(
        self: Arc<Self>,
        parent_node: ThoughtTreeNode,
        parent: Uuid,
        subtask: PlannedSubtask,
        inputs: Inputs,
        remaining: usize,
    ) -> BoxFuture<'static, UnitResult> {
        Box::pin(async move {
            let sequence = seq(subtask.index);
            let mut child = match self.open_node(parent_node.child(&subtask.description)).await {
                Ok(child) => child,
                Err(e) => return UnitResult::failed(sequence, subtask.description, self.unit_error(&e)),
            };

            let desired = (self.resources.available() / remaining.max(1))
                .clamp(1, self.deps.config.resources.sub_orchestrator_max_agents.max(1));
            let budget = match self.resources.carve(desired, self.deps.reserve_timeout()).await {
                Ok(budget) => budget,
                Err(e) => {
                    tracing::debug!(orchestrator_id = %self.id, error = %e, "no budget to nest; running subtask as a task");
                    let pass = self.run.gate.enter().await;
                    let run = self.run_leaf(child, parent, &subtask.description, &inputs).await;
                    drop(pass);
                    return unit_result(sequence, subtask.description, run);
                }
            };

            let sub = Arc::new(Scope::new(
                OrchestratorKind::Sub,
                Some(self.id),
                child.id,
                budget.manager().clone(),
                self.run.clone(),
                self.deps.clone(),
            ));
            self.run.arena.register_sub_orchestrator(parent, sub.id).await;
            if let Err(e) = sub.persist_record().await {
                tracing::warn!(orchestrator_id = %sub.id, error = %e, "failed to persist orchestrator record");
            }
            tracing::info!(
                orchestrator_id = %sub.id,
                parent_orchestrator_id = %self.id,
                depth = child.depth,
                slots = sub.resources.max_concurrent_agents(),
                "sub-orchestrator started"
            );

            let outcome = sub
                .run_strategy(Strategy::RecursiveDecomposition, &child, &subtask.description, &[], &inputs)
                .await;
            sub.close(if outcome.is_ok() { OrchestratorStatus::Completed } else { OrchestratorStatus::Failed })
                .await;
            self.run.arena.resolve_sub_orchestrator(parent, sub.id).await;
            drop(budget);

            let summary = outcome.as_ref().map(|r| r.content.clone()).map_err(Clone::clone);
            self.close_node(&mut child, &summary).await;
            match outcome {
                Ok(resolved) => {
                    UnitResult::completed(sequence, subtask.description, resolved.content).with_children(resolved.children)
                }
                Err(error) => UnitResult::failed(sequence, subtask.description, error),
            }
        })
    }

    /// Persona perspectives in parallel inside one council agent, then one
    /// synthesis call. Falls back to merging the perspectives if synthesis fails.
    async fn deliberate(
        &self,
        agent: &mut AgentHandle,
        question: &str,
        inputs: &Inputs,
        synthesis: WorkPurpose,
    ) -> OrchestrationResult<String> {
        let personas = &self.deps.config.strategy.council_personas;
        if personas.is_empty() {
            return Err(OrchestrationError::Permanent("no council personas configured".to_string()));
        }

        let prompts: Vec<String> = personas
            .iter()
            .map(|role| format!("As the {role} on a decision council, give your perspective on:\n{question}"))
            .collect();
        let caller: &AgentHandle = agent;
        let attempts = join_all(
            personas
                .iter()
                .zip(&prompts)
                .map(|(role, prompt)| self.call(caller, WorkPurpose::Perspective(role.clone()), prompt, inputs)),
        )
        .await;

        let mut perspectives = Vec::with_capacity(personas.len());
        let mut last_error = None;
        for ((index, role), attempted) in personas.iter().enumerate().zip(attempts) {
            self.account(agent, &attempted);
            match self.classify(agent, &WorkPurpose::Perspective(role.clone()), attempted.outcome).await {
                Ok(output) => {
                    agent.log.append(format!("perspective:{role}"), json!(output.content));
                    perspectives.push(UnitResult::completed(seq(index), role.clone(), output.content));
                }
                Err(e) => {
                    tracing::warn!(agent_id = %agent.id, persona = %role, error = %e, "council persona failed");
                    last_error = Some(e);
                }
            }
        }

        if perspectives.is_empty() {
            if let Some(e) = last_error.as_ref().filter(|e| e.kind() == ErrorKind::Cancelled) {
                return Err(e.clone());
            }
            return Err(OrchestrationError::CoordinationFailure {
                completed: 0,
                total: personas.len(),
                reason: last_error.map_or_else(
                    || "no perspectives".to_string(),
                    |e| format!("every council persona failed; last error: {e}"),
                ),
            });
        }

        let digest = perspectives
            .iter()
            .map(|p| format!("[{}] {}", p.label, p.content.trim()))
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt = format!("Synthesize a single decision on:\n{question}\n\nPerspectives:\n{digest}");
        match self.invoke(agent, synthesis, &prompt, inputs).await {
            Ok(output) => Ok(output.content),
            Err(e) if e.kind() == ErrorKind::Cancelled => Err(e),
            Err(e) => {
                tracing::warn!(agent_id = %agent.id, error = %e, "council synthesis failed; merging perspectives");
                let count = perspectives.len();
                Ok(self
                    .deps
                    .synthesizer
                    .synthesize(MergeMode::VoteOrMerge, &perspectives, count, FailureTolerance::Low)
                    .map_or(digest, |s| s.content))
            }
        }
    }

    async fn council(&self, node: &ThoughtTreeNode, goal: &str, inputs: &Inputs) -> StrategyOutcome {
        let mut agent = self.spawn_agent(AgentKind::Council, node, None).await.map_err(|e| self.unit_error(&e))?;
        if let Err(e) = self.activate(&mut agent).await {
            return Err(self.fail(agent, &e, Vec::new()).await);
        }
        let decision = match self.deliberate(&mut agent, goal, inputs, WorkPurpose::Facilitate).await {
            Ok(decision) => decision,
            Err(e) => return Err(self.fail(agent, &e, Vec::new()).await),
        };
        agent.log.append("decision", json!(decision));

        if !self.run.execute_council_decision {
            self.complete(agent, &decision).await?;
            return Ok(Resolved { content: decision, children: Vec::new() });
        }

        if let Err(e) = self.suspend(&mut agent).await {
            return Err(self.fail(agent, &e, Vec::new()).await);
        }
        let prompt = format!("Carry out this decision:\n{decision}");
        let run = match self.open_node(node.child("Execute council decision")).await {
            Ok(child) => {
                let pass = self.run.gate.enter().await;
                let run = self.run_leaf(child, agent.id, &prompt, inputs).await;
                drop(pass);
                run
            }
            Err(e) => UnitRun { outcome: Err(self.unit_error(&e)), usage: ResourceUsage::default() },
        };
        let execution = unit_result(0, "council decision", run);

        if let Err(e) = self.coordinate(&agent).await {
            return Err(self.fail(agent, &e, child_errors(&[execution])).await);
        }
        self.merge_logs();
        if execution.success {
            let content = format!("{}\n\n{}", decision.trim(), execution.content.trim());
            self.complete(agent, &content).await?;
            Ok(Resolved { content, children: vec![execution] })
        } else {
            let error = OrchestrationError::CoordinationFailure {
                completed: 0,
                total: 1,
                reason: "the council decision could not be executed".to_string(),
            };
            Err(self.fail(agent, &error, child_errors(&[execution])).await)
        }
    }

    /// Claim a pending failure-analysis step and feed its result to the
    /// remaining subtasks. The step does not count toward failure tolerance.
    async fn absorb_failure_analysis(&self, node: &ThoughtTreeNode, parent: Uuid, inputs: &mut Inputs) {
        if !self.run.gate.take_failure_analysis() {
            return;
        }
        if let Some(analysis) = self.failure_analysis(node, parent, inputs).await {
            inputs.insert("failure_analysis".to_string(), json!(analysis));
        }
    }

    async fn failure_analysis(&self, node: &ThoughtTreeNode, parent: Uuid, inputs: &Inputs) -> Option<String> {
        let failures: Vec<String> = self
            .run
            .arena
            .all()
            .await
            .into_iter()
            .filter_map(|a| a.failure.map(|f| format!("{} agent: {}", a.kind, f.message)))
            .take(FAILURE_SAMPLE)
            .collect();
        let recurring: Vec<String> = match self.deps.learning.analyzer().failure_patterns().await {
            Ok(patterns) => patterns
                .iter()
                .take(FAILURE_SAMPLE)
                .map(|p| format!("{}: {} ({} times)", p.collaborator, p.error_signature, p.occurrences))
                .collect(),
            Err(e) => {
                tracing::warn!(orchestrator_id = %self.id, error = %e, "failure patterns unavailable");
                Vec::new()
            }
        };
        let mut question = format!("Recent units failed:\n- {}\n", failures.join("\n- "));
        if !recurring.is_empty() {
            question.push_str(&format!("Recurring failure patterns:\n- {}\n", recurring.join("\n- ")));
        }
        question.push_str("Identify the common cause and how the remaining work should proceed.");

        let mut child = match self.open_node(node.child("Analyse recent failures")).await {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(orchestrator_id = %self.id, error = %e, "failure analysis step skipped");
                return None;
            }
        };
        let outcome = match self.spawn_agent(AgentKind::Council, &child, Some(parent)).await {
            Ok(mut agent) => match self.activate(&mut agent).await {
                Ok(()) => match self.deliberate(&mut agent, &question, inputs, WorkPurpose::FailureAnalysis).await {
                    Ok(analysis) => self.complete(agent, &analysis).await.map(|()| analysis),
                    Err(e) => Err(self.fail(agent, &e, Vec::new()).await),
                },
                Err(e) => Err(self.fail(agent, &e, Vec::new()).await),
            },
            Err(e) => Err(self.unit_error(&e)),
        };
        self.close_node(&mut child, &outcome).await;
        tracing::info!(orchestrator_id = %self.id, succeeded = outcome.is_ok(), "failure analysis step inserted");
        outcome.ok()
    }

    /// Execute, validate and refine until the validator passes, the score
    /// plateaus or the round cap is hit. The best-scoring output wins.
    async fn refine(&self, node: &ThoughtTreeNode, goal: &str, inputs: &Inputs) -> StrategyOutcome {
        let mut coordinator = self.spawn_agent(AgentKind::Task, node, None).await.map_err(|e| self.unit_error(&e))?;
        if let Err(e) = self.activate(&mut coordinator).await {
            return Err(self.fail(coordinator, &e, Vec::new()).await);
        }
        if let Err(e) = self.suspend(&mut coordinator).await {
            return Err(self.fail(coordinator, &e, Vec::new()).await);
        }

        let max_rounds = self.deps.config.strategy.max_refinement_rounds.max(1);
        let epsilon = self.deps.config.strategy.plateau_epsilon;
        let mut rounds: Vec<UnitResult> = Vec::new();
        let mut best: Option<(f64, String)> = None;
        let mut previous: Option<(String, String)> = None;
        let mut previous_score: Option<f64> = None;
        let mut last_error: Option<ResultError> = None;

        for round in 0..max_rounds {
            if self.run.control.checkpoint("next refinement round").await.is_err() {
                break;
            }
            let label = format!("round {}", round + 1);
            let prompt = match &previous {
                None => goal.to_string(),
                Some((output, feedback)) => format!(
                    "{goal}\n\nPrevious attempt:\n{output}\n\nValidator feedback:\n{feedback}\n\nRefine the previous attempt."
                ),
            };

            let mut child = match self.open_node(node.child(format!("Refinement round {}", round + 1))).await {
                Ok(child) => child,
                Err(e) => {
                    last_error = Some(self.unit_error(&e));
                    break;
                }
            };
            let pass = self.run.gate.enter().await;
            let attempt = match self.spawn_agent(AgentKind::Task, &child, Some(coordinator.id)).await {
                Ok(agent) => self.execute_agent(agent, WorkPurpose::Execute, &prompt, inputs).await,
                Err(e) => UnitRun { outcome: Err(self.unit_error(&e)), usage: ResourceUsage::default() },
            };
            let output = match attempt.outcome {
                Ok(output) => output,
                Err(error) => {
                    drop(pass);
                    self.close_node(&mut child, &Err(error.clone())).await;
                    rounds.push(UnitResult::failed(u64::from(round), label, error.clone()));
                    last_error = Some(error);
                    break;
                }
            };
            let verdict = self.validate(&child, coordinator.id, goal, &output, inputs).await;
            drop(pass);

            self.run.meter.record_validation(verdict.passed);
            child.record("validation", json!({ "passed": verdict.passed, "score": verdict.score }));
            self.close_node(&mut child, &Ok(output.clone())).await;
            rounds.push(UnitResult::completed(u64::from(round), label, output.clone()).with_usage(attempt.usage));
            tracing::debug!(round = round + 1, passed = verdict.passed, score = verdict.score, "refinement round validated");

            if !best.as_ref().is_some_and(|(score, _)| verdict.score <= *score) {
                best = Some((verdict.score, output.clone()));
            }
            if verdict.passed {
                break;
            }
            if previous_score.is_some_and(|p| (verdict.score - p).abs() < epsilon) {
                tracing::debug!(round = round + 1, "refinement plateaued");
                break;
            }
            previous_score = Some(verdict.score);
            previous = Some((output, verdict.feedback));
        }

        if let Err(e) = self.coordinate(&coordinator).await {
            return Err(self.fail(coordinator, &e, child_errors(&rounds)).await);
        }
        self.merge_logs();

        match best {
            Some((_, content)) if !self.run.control.is_cancelled() => {
                self.complete(coordinator, &content).await?;
                Ok(Resolved { content, children: rounds })
            }
            _ => {
                let error = if self.run.control.is_cancelled() {
                    OrchestrationError::Cancelled("refinement".to_string())
                } else {
                    OrchestrationError::CoordinationFailure {
                        completed: 0,
                        total: rounds.len().max(1),
                        reason: last_error
                            .map_or_else(|| "no refinement round produced output".to_string(), |e| e.message),
                    }
                };
                Err(self.fail(coordinator, &error, child_errors(&rounds)).await)
            }
        }
    }

    async fn validate(
        &self,
        node: &ThoughtTreeNode,
        parent: Uuid,
        goal: &str,
        output: &str,
        inputs: &Inputs,
    ) -> Verdict {
        let mut agent = match self.spawn_agent(AgentKind::Validator, node, Some(parent)).await {
            Ok(agent) => agent,
            Err(e) => return Verdict::failed(e.to_string()),
        };
        if let Err(e) = self.activate(&mut agent).await {
            let feedback = e.to_string();
            self.fail(agent, &e, Vec::new()).await;
            return Verdict::failed(feedback);
        }
        let prompt = format!("Validate this result for: {goal}\n\n{output}");
        match self.invoke(&mut agent, WorkPurpose::Validate, &prompt, inputs).await {
            Ok(response) => {
                let verdict = Verdict::judge(&response);
                agent.log.append("verdict", json!({ "passed": verdict.passed, "score": verdict.score }));
                if let Err(e) = self.complete(agent, &response.content).await {
                    tracing::warn!(unit = %e.unit, error = %e.message, "validator completion not recorded");
                }
                verdict
            }
            Err(e) => {
                let feedback = e.to_string();
                self.fail(agent, &e, Vec::new()).await;
                Verdict::failed(feedback)
            }
        }
    }

    /// Memory agent: read the parent node and its recorded outcome, log them,
    /// and merge the log at once so the rest of the workflow can see it.
    pub(crate) async fn recall(
        &self,
        node: &ThoughtTreeNode,
        parent_node_id: Uuid,
    ) -> OrchestrationResult<serde_json::Value> {
        let mut agent = self.spawn_agent(AgentKind::Memory, node, None).await?;
        let recalled = async {
            self.activate(&mut agent).await?;
            let parent = self
                .deps
                .store
                .get_node(parent_node_id)
                .await?
                .ok_or_else(|| OrchestrationError::Permanent(format!("parent node {parent_node_id} not found")))?;
            Ok::<serde_json::Value, OrchestrationError>(json!({
                "parent_node_id": parent.id,
                "parent_goal": parent.goal,
                "parent_status": parent.status,
                "parent_output": parent.metadata.get("output").cloned().unwrap_or(serde_json::Value::Null),
            }))
        }
        .await;

        match recalled {
            Ok(value) => {
                agent.log.append("inherited_context", value.clone());
                self.complete(agent, "context recalled")
                    .await
                    .map_err(|e| OrchestrationError::Permanent(e.message))?;
                self.merge_logs();
                Ok(value)
            }
            Err(e) => {
                self.fail(agent, &e, Vec::new()).await;
                Err(e)
            }
        }
    }
}

//! Periodic observation of a running workflow.
//!
//! Each tick evaluates the recovery triggers, applies rising-edge reactions to
//! the plan gate, refreshes the status snapshot and enforces the deadline.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::domain::models::{RecoveryTrigger, StatusSnapshot};
use crate::services::failure_recovery::{FailureRecoveryController, TriggerInputs};

use super::scope::WorkflowRun;

pub(crate) fn spawn_monitor(
    run: Arc<WorkflowRun>,
    recovery: Arc<FailureRecoveryController>,
    status: Arc<watch::Sender<StatusSnapshot>>,
) -> JoinHandle<()> {
    let period = Duration::from_millis(recovery.config().monitor_interval_ms.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            observe(&run, &recovery, &status).await;
            if run.control.is_cancelled() {
                break;
            }
        }
    })
}

/// One monitoring pass. Returns the triggers that newly fired.
pub(crate) async fn observe(
    run: &WorkflowRun,
    recovery: &FailureRecoveryController,
    status: &watch::Sender<StatusSnapshot>,
) -> Vec<RecoveryTrigger> {
    let counts = run.arena.counts().await;
    let stall_after = Duration::from_secs(recovery.config().stall_after_secs);
    let stalled = run.arena.stalled_coordination_points(stall_after).await;
    let elapsed = run.started.elapsed();
    let cost = run.meter.cost();

    let inputs = TriggerInputs {
        cost_consumed: cost,
        cost_budget: run.cost_budget,
        failed: counts.failed,
        resolved: counts.resolved(),
        stalled_points: stalled,
        elapsed,
        deadline: run.deadline,
    };
    let active = recovery.evaluate(&inputs);
    let rising = run.gate.apply(&active);
    for trigger in &rising {
        let plan = run.gate.snapshot();
        tracing::warn!(
            workflow_id = %run.workflow_id,
            trigger = %trigger,
            cap = plan.cap,
            flatten = plan.flatten,
            "recovery trigger fired"
        );
    }
    run.record_triggers(&rising);

    if !run.deadline.is_zero() && elapsed >= run.deadline && run.control.cancel() {
        tracing::warn!(
            workflow_id = %run.workflow_id,
            deadline_secs = run.deadline.as_secs(),
            "time budget exhausted; cancelling workflow"
        );
    }

    status.send_modify(|snapshot| {
        #[allow(clippy::cast_precision_loss)]
        let progress = if counts.total == 0 { 0.0 } else { counts.resolved() as f64 / counts.total as f64 * 100.0 };
        snapshot.progress_percentage = progress;
        snapshot.agents_active = run.meter.active();
        snapshot.agents_completed = counts.completed;
        snapshot.agents_failed = counts.failed;
        snapshot.cost_consumed = cost;
        snapshot.time_elapsed = elapsed;
        snapshot.bottlenecks = active.iter().map(ToString::to_string).collect();
        if stalled > 0 {
            snapshot.bottlenecks.push(format!("{stalled} stalled coordination point(s)"));
        }
    });

    rising
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryStore;
    use crate::domain::errors::ErrorKind;
    use crate::domain::models::{Agent, AgentFailure, AgentKind, Config, FailureTolerance};
    use crate::services::failure_recovery::RetryPolicy;
    use crate::services::orchestrator::run_control::RunControl;
    use crate::services::orchestrator::scope::RunSettings;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn run(deadline: Duration) -> WorkflowRun {
        let config = Config::default();
        WorkflowRun::new(RunSettings {
            workflow_id: Uuid::new_v4(),
            control: RunControl::new(),
            retry: RetryPolicy::from_config(&config.retry, &config.budget),
            concurrency: 4,
            tolerance: FailureTolerance::Medium,
            cost_budget: 10.0,
            deadline,
            max_depth: 3,
            execute_council_decision: false,
            base_inputs: HashMap::new(),
        })
    }

    fn controller() -> FailureRecoveryController {
        let config = Config::default();
        FailureRecoveryController::new(
            config.recovery.clone(),
            RetryPolicy::from_config(&config.retry, &config.budget),
            Arc::new(InMemoryStore::new()),
        )
    }

    async fn failed_agent(run: &WorkflowRun) {
        let agent = Agent::new(AgentKind::Task, Uuid::new_v4(), Uuid::new_v4(), 0, 3).unwrap();
        let id = agent.id;
        run.arena.insert(agent).await.unwrap();
        run.arena
            .fail(
                id,
                AgentFailure { kind: ErrorKind::Permanent, message: "rejected".into(), retry_count: 0, child_errors: vec![] },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_high_failure_rate_fires_once() {
        let run = run(Duration::from_secs(600));
        let recovery = controller();
        let (status, _rx) = watch::channel(StatusSnapshot::default());
        failed_agent(&run).await;
        failed_agent(&run).await;

        let first = observe(&run, &recovery, &status).await;
        assert_eq!(first, vec![RecoveryTrigger::HighFailureRate]);
        assert!(run.gate.take_failure_analysis());

        let second = observe(&run, &recovery, &status).await;
        assert!(second.is_empty());
        assert_eq!(run.fired(), vec![RecoveryTrigger::HighFailureRate]);

        let snapshot = status.borrow().clone();
        assert_eq!(snapshot.agents_failed, 2);
        assert!((snapshot.progress_percentage - 100.0).abs() < f64::EPSILON);
        assert_eq!(snapshot.bottlenecks, vec!["high_failure_rate".to_string()]);
    }

    #[tokio::test]
    async fn test_elapsed_deadline_cancels_run() {
        let run = run(Duration::from_millis(1));
        let recovery = controller();
        let (status, _rx) = watch::channel(StatusSnapshot::default());
        tokio::time::sleep(Duration::from_millis(5)).await;

        let fired = observe(&run, &recovery, &status).await;
        assert!(fired.contains(&RecoveryTrigger::TimeOverrunRisk));
        assert!(run.control.is_cancelled());
    }
}

//! Failure recovery: per-call retries, monitor triggers and plan reactions.
//!
//! Reactions only touch work that has not been spawned yet. They are applied
//! to a [`PlanGate`] that the fan-out consults before each spawn.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::domain::errors::{ErrorKind, OrchestrationError};
use crate::domain::models::{BudgetConfig, FailureEvent, FailurePattern, RecoveryConfig, RecoveryTrigger, RetryConfig};
use crate::domain::ports::{ExecutionError, PersistenceStore};

const RESTORE_STEP: usize = 2;

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Timeout applied to each executor call.
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(retry: &RetryConfig, budget: &BudgetConfig) -> Self {
        Self {
            max_retries: retry.max_retries,
            initial_backoff: Duration::from_millis(retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(retry.max_backoff_ms.max(retry.initial_backoff_ms)),
            call_timeout: Duration::from_secs(budget.agent_timeout_secs),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Outcome of a retried call.
#[derive(Debug)]
pub struct Attempted<T> {
    pub outcome: Result<T, OrchestrationError>,
    pub retries: u32,
    /// Longest single attempt.
    pub slowest: Duration,
}

/// Mutable plan parameters for work not yet spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanState {
    pub initial_cap: usize,
    pub cap: usize,
    pub flatten: bool,
    pub failure_analysis_pending: bool,
    pub failure_analysis_inserted: bool,
    active_triggers: HashSet<RecoveryTrigger>,
}

/// Concurrency gate and recovery flags shared by one workflow's fan-outs.
#[derive(Debug)]
pub struct PlanGate {
    state: Mutex<PlanState>,
    in_flight: AtomicUsize,
    notify: Notify,
}

/// A held gate slot. Releasing it wakes waiters.
#[derive(Debug)]
pub struct GatePass {
    gate: Arc<PlanGate>,
}

impl Drop for GatePass {
    fn drop(&mut self) {
        self.gate.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.gate.notify.notify_waiters();
    }
}

impl PlanGate {
    pub fn new(cap: usize) -> Arc<Self> {
        let cap = cap.max(1);
        Arc::new(Self {
            state: Mutex::new(PlanState {
                initial_cap: cap,
                cap,
                flatten: false,
                failure_analysis_pending: false,
                failure_analysis_inserted: false,
                active_triggers: HashSet::new(),
            }),
            in_flight: AtomicUsize::new(0),
            notify: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PlanState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> PlanState {
        self.lock().clone()
    }

    pub fn cap(&self) -> usize {
        self.lock().cap
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn flatten(&self) -> bool {
        self.lock().flatten
    }

    /// Wait until fewer than `cap` units are in flight.
    pub async fn enter(self: &Arc<Self>) -> GatePass {
        loop {
            let notified = self.notify.notified();
            {
                let state = self.lock();
                let current = self.in_flight.load(Ordering::Acquire);
                if current < state.cap
                    && self
                        .in_flight
                        .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    return GatePass { gate: self.clone() };
                }
            }
            notified.await;
        }
    }

    /// Claim the pending failure-analysis step, at most once per workflow.
    pub fn take_failure_analysis(&self) -> bool {
        let mut state = self.lock();
        if state.failure_analysis_pending {
            state.failure_analysis_pending = false;
            return true;
        }
        false
    }

    /// React to the triggers that just became active. Returns the newly
    /// applied triggers.
    pub fn apply(&self, triggers: &[RecoveryTrigger]) -> Vec<RecoveryTrigger> {
        let mut state = self.lock();
        let current: HashSet<RecoveryTrigger> = triggers.iter().copied().collect();
        let rising: Vec<RecoveryTrigger> = triggers
            .iter()
            .copied()
            .filter(|t| !state.active_triggers.contains(t))
            .collect();

        for trigger in &rising {
            match trigger {
                RecoveryTrigger::CostOverrunRisk => state.cap = (state.cap / 2).max(1),
                RecoveryTrigger::HighFailureRate => {
                    if !state.failure_analysis_inserted {
                        state.failure_analysis_inserted = true;
                        state.failure_analysis_pending = true;
                    }
                }
                RecoveryTrigger::CoordinationBottleneck => state.flatten = true,
                RecoveryTrigger::TimeOverrunRisk => {
                    state.cap = (state.cap + RESTORE_STEP).min(state.initial_cap);
                }
            }
        }
        state.active_triggers = current;
        drop(state);

        if !rising.is_empty() {
            self.notify.notify_waiters();
        }
        rising
    }
}

/// Observations the monitor feeds into trigger evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TriggerInputs {
    pub cost_consumed: f64,
    pub cost_budget: f64,
    pub failed: usize,
    pub resolved: usize,
    pub stalled_points: usize,
    pub elapsed: Duration,
    pub deadline: Duration,
}

pub struct FailureRecoveryController {
    config: RecoveryConfig,
    retry: RetryPolicy,
    store: Arc<dyn PersistenceStore>,
    permanent_window: Mutex<HashMap<(String, String), VecDeque<DateTime<Utc>>>>,
}

impl FailureRecoveryController {
    pub fn new(config: RecoveryConfig, retry: RetryPolicy, store: Arc<dyn PersistenceStore>) -> Self {
        Self { config, retry, store, permanent_window: Mutex::new(HashMap::new()) }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Which triggers trip for the given observations.
    #[allow(clippy::cast_precision_loss)]
    pub fn evaluate(&self, inputs: &TriggerInputs) -> Vec<RecoveryTrigger> {
        let mut triggers = Vec::new();
        if inputs.cost_budget > 0.0 && inputs.cost_consumed > self.config.cost_overrun_threshold * inputs.cost_budget {
            triggers.push(RecoveryTrigger::CostOverrunRisk);
        }
        if inputs.resolved > 0
            && inputs.failed as f64 / inputs.resolved as f64 > self.config.failure_rate_threshold
        {
            triggers.push(RecoveryTrigger::HighFailureRate);
        }
        if inputs.stalled_points > self.config.stalled_coordination_limit {
            triggers.push(RecoveryTrigger::CoordinationBottleneck);
        }
        if !inputs.deadline.is_zero()
            && inputs.elapsed.as_secs_f64() > self.config.time_overrun_threshold * inputs.deadline.as_secs_f64()
        {
            triggers.push(RecoveryTrigger::TimeOverrunRisk);
        }
        triggers
    }

    /// Run `call` under the retry policy. Transient errors and per-call
    /// timeouts are retried with exponential backoff; a permanent error stops
    /// immediately. Every failed attempt is recorded against `collaborator`.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        collaborator: &str,
        agent_id: Option<Uuid>,
        policy: RetryPolicy,
        mut call: F,
    ) -> Attempted<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ExecutionError>>,
    {
        let mut backoff = policy.backoff();
        let mut slowest = Duration::ZERO;
        let mut attempt: u32 = 0;

        loop {
            let started = Instant::now();
            let result = match tokio::time::timeout(policy.call_timeout, call(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(ExecutionError::Transient(format!(
                    "call timed out after {}ms",
                    policy.call_timeout.as_millis()
                ))),
            };
            slowest = slowest.max(started.elapsed());

            let error = match result {
                Ok(value) => return Attempted { outcome: Ok(value), retries: attempt, slowest },
                Err(error) => error,
            };

            match error {
                ExecutionError::Permanent(message) => {
                    self.record_failure(collaborator, ErrorKind::Permanent, &message, agent_id).await;
                    return Attempted { outcome: Err(OrchestrationError::Permanent(message)), retries: attempt, slowest };
                }
                ExecutionError::Transient(message) => {
                    self.record_failure(collaborator, ErrorKind::Transient, &message, agent_id).await;
                    if attempt >= policy.max_retries {
                        tracing::warn!(collaborator, attempts = attempt + 1, error = %message, "retry budget exhausted");
                        return Attempted {
                            outcome: Err(OrchestrationError::TransientExhausted { attempts: attempt + 1, last_error: message }),
                            retries: attempt,
                            slowest,
                        };
                    }
                    let delay = backoff.next_backoff().unwrap_or(policy.max_backoff);
                    tracing::debug!(collaborator, attempt, delay_ms = delay.as_millis(), error = %message, "retrying transient failure");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Persist a failure event and escalate recurring permanent failures.
    pub async fn record_failure(&self, collaborator: &str, kind: ErrorKind, message: &str, agent_id: Option<Uuid>) {
        let mut event = FailureEvent::new(collaborator, kind, message);
        if let Some(agent_id) = agent_id {
            event = event.with_agent(agent_id);
        }
        if let Err(e) = self.store.save_failure_event(&event).await {
            tracing::warn!(error = %e, "failed to persist failure event");
        }
        if kind == ErrorKind::Permanent {
            if let Some(pattern) = self.track_permanent(&event) {
                tracing::warn!(
                    collaborator = %pattern.collaborator,
                    signature = %pattern.error_signature,
                    occurrences = pattern.occurrences,
                    "escalating recurring permanent failure"
                );
                if let Err(e) = self.store.save_failure_pattern(&pattern).await {
                    tracing::warn!(error = %e, "failed to persist failure pattern");
                }
            }
        }
    }

    fn track_permanent(&self, event: &FailureEvent) -> Option<FailurePattern> {
        let window = ChronoDuration::from_std(Duration::from_secs(self.config.failure_window_secs))
            .unwrap_or_else(|_| ChronoDuration::days(1));
        let horizon = event.occurred_at - window;
        let key = (event.collaborator.clone(), event.error_signature.clone());

        let mut windows = self.permanent_window.lock().unwrap_or_else(PoisonError::into_inner);
        let seen = windows.entry(key).or_default();
        seen.push_back(event.occurred_at);
        while seen.front().is_some_and(|t| *t < horizon) {
            seen.pop_front();
        }

        if seen.len() < self.config.escalation_threshold.max(1) {
            return None;
        }
        Some(FailurePattern {
            id: Uuid::new_v4(),
            collaborator: event.collaborator.clone(),
            error_signature: event.error_signature.clone(),
            occurrences: seen.len(),
            first_seen: seen.front().copied().unwrap_or(event.occurred_at),
            last_seen: event.occurred_at,
            sample_message: event.message.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryStore;
    use std::sync::atomic::AtomicU32;

    fn controller() -> (FailureRecoveryController, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let policy = RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            call_timeout: Duration::from_secs(1),
        };
        (FailureRecoveryController::new(RecoveryConfig::default(), policy, store.clone()), store)
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let (ctl, _) = controller();
        let calls = AtomicU32::new(0);
        let attempted = ctl
            .execute_with_retry("exec", None, ctl.retry_policy(), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ExecutionError::Transient("rate limited".into()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(attempted.outcome.unwrap(), "done");
        assert_eq!(attempted.retries, 2);
    }

    #[tokio::test]
    async fn test_transient_budget_is_four_attempts() {
        let (ctl, store) = controller();
        let calls = AtomicU32::new(0);
        let attempted: Attempted<()> = ctl
            .execute_with_retry("exec", None, ctl.retry_policy(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ExecutionError::Transient("503".into())) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let err = attempted.outcome.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransientExhausted);
        assert!(err.kind().is_permanent());
        let events = store.failure_events_since(Utc::now() - ChronoDuration::hours(1)).await.unwrap();
        assert_eq!(events.len(), 4);
    }

    #[tokio::test]
    async fn test_permanent_is_not_retried() {
        let (ctl, _) = controller();
        let calls = AtomicU32::new(0);
        let attempted: Attempted<()> = ctl
            .execute_with_retry("exec", None, ctl.retry_policy(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ExecutionError::Permanent("malformed input".into())) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(attempted.outcome.unwrap_err().kind(), ErrorKind::Permanent);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient() {
        let (ctl, _) = controller();
        let policy = ctl.retry_policy().with_max_retries(1).with_call_timeout(Duration::from_millis(10));
        let attempted: Attempted<()> = ctl
            .execute_with_retry("slow", None, policy, |_| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;
        match attempted.outcome {
            Err(OrchestrationError::TransientExhausted { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recurring_permanent_failures_escalate() {
        let (ctl, store) = controller();
        for i in 0..3 {
            ctl.record_failure("search", ErrorKind::Permanent, &format!("index {i} missing"), None).await;
        }
        let patterns = store.failure_patterns().await.unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].occurrences, 3);
        assert_eq!(patterns[0].error_signature, "index # missing");
    }

    #[test]
    fn test_trigger_evaluation() {
        let (ctl, _) = controller();
        let quiet = TriggerInputs { cost_budget: 10.0, deadline: Duration::from_secs(100), ..Default::default() };
        assert!(ctl.evaluate(&quiet).is_empty());

        let noisy = TriggerInputs {
            cost_consumed: 8.5,
            failed: 2,
            resolved: 5,
            stalled_points: 3,
            elapsed: Duration::from_secs(81),
            ..quiet
        };
        assert_eq!(
            ctl.evaluate(&noisy),
            vec![
                RecoveryTrigger::CostOverrunRisk,
                RecoveryTrigger::HighFailureRate,
                RecoveryTrigger::CoordinationBottleneck,
                RecoveryTrigger::TimeOverrunRisk,
            ]
        );
    }

    #[test]
    fn test_reactions_fire_on_rising_edge() {
        let gate = PlanGate::new(8);
        assert_eq!(gate.apply(&[RecoveryTrigger::CostOverrunRisk]), vec![RecoveryTrigger::CostOverrunRisk]);
        assert_eq!(gate.cap(), 4);
        // still active: no second halving
        assert!(gate.apply(&[RecoveryTrigger::CostOverrunRisk]).is_empty());
        assert_eq!(gate.cap(), 4);

        gate.apply(&[]);
        gate.apply(&[RecoveryTrigger::CostOverrunRisk]);
        assert_eq!(gate.cap(), 2);

        gate.apply(&[RecoveryTrigger::TimeOverrunRisk]);
        assert_eq!(gate.cap(), 4);

        gate.apply(&[RecoveryTrigger::HighFailureRate]);
        gate.apply(&[]);
        gate.apply(&[RecoveryTrigger::HighFailureRate]);
        assert!(gate.take_failure_analysis());
        assert!(!gate.take_failure_analysis());

        gate.apply(&[RecoveryTrigger::CoordinationBottleneck]);
        assert!(gate.flatten());
    }

    #[tokio::test]
    async fn test_gate_limits_in_flight() {
        let gate = PlanGate::new(1);
        let first = gate.enter().await;
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _pass = gate.enter().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(gate.in_flight(), 1);
        drop(first);
        waiter.await.unwrap();
        assert_eq!(gate.in_flight(), 0);
    }
}

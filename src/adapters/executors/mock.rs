//! Scriptable executor for tests and benchmarks.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::domain::models::AgentKind;
use crate::domain::ports::{ExecutionError, WorkContext, WorkExecutor, WorkOutput, WorkPurpose};

/// How calls whose prompt contains a pattern misbehave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFault {
    /// Fail transiently this many times, then succeed.
    Transient(u32),
    /// Fail transiently on every call.
    AlwaysTransient,
    /// Fail permanently.
    Permanent,
    /// Respond with `success == false`.
    Reject,
}

#[derive(Debug, Clone)]
struct FaultRule {
    pattern: String,
    purpose: Option<WorkPurpose>,
    fault: MockFault,
}

/// One observed call.
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub prompt: String,
    pub purpose: WorkPurpose,
    pub agent_kind: AgentKind,
    pub depth: u32,
    pub attempt: u32,
    /// Calls in flight when this one started, itself included.
    pub concurrent: usize,
}

#[derive(Debug, Default)]
struct Counters {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Cloning shares the call log and counters, so a test can keep a handle
/// after passing the executor to an engine.
#[derive(Debug, Clone)]
pub struct MockExecutor {
    name: String,
    latency: Duration,
    tokens_per_call: u64,
    cost_per_call: f64,
    responses: HashMap<String, WorkOutput>,
    faults: Arc<Mutex<Vec<FaultRule>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    counters: Arc<Counters>,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn first_line(prompt: &str) -> &str {
    prompt.lines().next().unwrap_or_default().trim()
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            latency: Duration::ZERO,
            tokens_per_call: 100,
            cost_per_call: 0.01,
            responses: HashMap::new(),
            faults: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_usage(mut self, tokens_per_call: u64, cost_per_call: f64) -> Self {
        self.tokens_per_call = tokens_per_call;
        self.cost_per_call = cost_per_call;
        self
    }

    /// Fixed response for a purpose. Perspectives match either their full
    /// label (`perspective:engineer`) or `perspective`.
    pub fn with_response(mut self, purpose: &WorkPurpose, output: WorkOutput) -> Self {
        self.responses.insert(purpose.label(), output);
        self
    }

    pub fn with_response_for(mut self, label: impl Into<String>, output: WorkOutput) -> Self {
        self.responses.insert(label.into(), output);
        self
    }

    /// Apply `fault` to calls whose prompt contains `pattern`. The first
    /// matching rule wins.
    pub fn with_fault(self, pattern: impl Into<String>, fault: MockFault) -> Self {
        self.push_fault(FaultRule { pattern: pattern.into(), purpose: None, fault })
    }

    /// Like [`with_fault`](Self::with_fault), limited to calls made for `purpose`.
    pub fn with_fault_on(self, purpose: WorkPurpose, pattern: impl Into<String>, fault: MockFault) -> Self {
        self.push_fault(FaultRule { pattern: pattern.into(), purpose: Some(purpose), fault })
    }

    fn push_fault(self, rule: FaultRule) -> Self {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner).push(rule);
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn calls_for(&self, purpose: &WorkPurpose) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| &c.purpose == purpose)
            .count()
    }

    /// Highest number of calls observed in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.counters.peak.load(Ordering::Acquire)
    }

    fn fault_for(&self, prompt: &str, purpose: &WorkPurpose) -> Option<MockFault> {
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        let rule = faults
            .iter_mut()
            .find(|r| prompt.contains(&r.pattern) && !r.purpose.as_ref().is_some_and(|p| p != purpose))?;
        match rule.fault {
            MockFault::Transient(0) => None,
            MockFault::Transient(n) => {
                rule.fault = MockFault::Transient(n - 1);
                Some(MockFault::Transient(n))
            }
            ref other => Some(other.clone()),
        }
    }

    fn scripted(&self, purpose: &WorkPurpose) -> Option<WorkOutput> {
        self.responses.get(&purpose.label()).cloned().or_else(|| match purpose {
            WorkPurpose::Perspective(_) => self.responses.get("perspective").cloned(),
            _ => None,
        })
    }

    fn default_content(prompt: &str, purpose: &WorkPurpose) -> String {
        match purpose {
            WorkPurpose::Execute => format!("Completed: {}", first_line(prompt)),
            WorkPurpose::Decompose => {
                "1. Analyse the current state\n2. Implement the change\n3. Verify the result".to_string()
            }
            WorkPurpose::Validate => "Approved. score: 0.9".to_string(),
            WorkPurpose::Perspective(role) => format!("The {role} recommends proceeding carefully."),
            WorkPurpose::Facilitate => "Decision: proceed with the recommended approach.".to_string(),
            WorkPurpose::FailureAnalysis => "Failures share one cause; continue with smaller steps.".to_string(),
        }
    }
}

struct InFlight<'a>(&'a Counters);

impl<'a> InFlight<'a> {
    fn enter(counters: &'a Counters) -> (Self, usize) {
        let now = counters.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        counters.peak.fetch_max(now, Ordering::AcqRel);
        (Self(counters), now)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[async_trait]
impl WorkExecutor for MockExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, prompt: &str, context: &WorkContext) -> Result<WorkOutput, ExecutionError> {
        let (_in_flight, concurrent) = InFlight::enter(&self.counters);
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(MockCall {
            prompt: prompt.to_string(),
            purpose: context.purpose.clone(),
            agent_kind: context.agent_kind,
            depth: context.depth,
            attempt: context.attempt,
            concurrent,
        });
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let rejected = match self.fault_for(prompt, &context.purpose) {
            Some(MockFault::Transient(_) | MockFault::AlwaysTransient) => {
                return Err(ExecutionError::Transient("upstream rate limited".to_string()));
            }
            Some(MockFault::Permanent) => {
                return Err(ExecutionError::Permanent(format!("malformed request: {}", first_line(prompt))));
            }
            Some(MockFault::Reject) => true,
            None => false,
        };

        let mut output = self.scripted(&context.purpose).unwrap_or_else(|| WorkOutput {
            content: Self::default_content(prompt, &context.purpose),
            tokens: self.tokens_per_call,
            cost: self.cost_per_call,
            success: true,
        });
        if rejected {
            output.success = false;
            output.content = format!("Rejected: {}", first_line(prompt));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn context(purpose: WorkPurpose) -> WorkContext {
        WorkContext {
            workflow_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            agent_kind: AgentKind::Task,
            node_id: Uuid::new_v4(),
            depth: 0,
            purpose,
            attempt: 0,
            inputs: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_transient_faults_run_out() {
        let executor = MockExecutor::new().with_fault("flaky", MockFault::Transient(2));
        let ctx = context(WorkPurpose::Execute);
        assert!(executor.execute("flaky step", &ctx).await.unwrap_err().is_transient());
        assert!(executor.execute("flaky step", &ctx).await.is_err());
        assert_eq!(executor.execute("flaky step", &ctx).await.unwrap().content, "Completed: flaky step");
        assert_eq!(executor.call_count(), 3);
    }

    #[tokio::test]
    async fn test_scripted_and_rejected_responses() {
        let executor = MockExecutor::new()
            .with_response_for("perspective", WorkOutput::ok("agree"))
            .with_fault("forbidden", MockFault::Reject);
        let perspective = executor
            .execute("topic", &context(WorkPurpose::Perspective("engineer".into())))
            .await
            .unwrap();
        assert_eq!(perspective.content, "agree");

        let rejected = executor.execute("forbidden work", &context(WorkPurpose::Execute)).await.unwrap();
        assert!(!rejected.success);
        assert_eq!(executor.calls_for(&WorkPurpose::Execute), 1);
    }

    #[tokio::test]
    async fn test_fault_scoped_to_purpose() {
        let executor = MockExecutor::new().with_fault_on(WorkPurpose::Execute, "shard", MockFault::Permanent);
        assert!(executor.execute("fetch shard 1", &context(WorkPurpose::Execute)).await.is_err());
        assert!(executor.execute("why did shard 1 fail?", &context(WorkPurpose::FailureAnalysis)).await.is_ok());
    }

    #[tokio::test]
    async fn test_peak_concurrency_is_tracked() {
        let executor = MockExecutor::new().with_latency(Duration::from_millis(20));
        let ctx = context(WorkPurpose::Execute);
        let (a, b) = tokio::join!(executor.execute("a", &ctx), executor.execute("b", &ctx));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(executor.peak_concurrency(), 2);
    }
}

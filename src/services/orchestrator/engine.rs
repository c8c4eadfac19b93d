//! Long-lived engine facade.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::domain::errors::{DomainResult, ErrorKind};
use crate::domain::models::{
    Config, ExecutionRecord, OrchestratorResult, ResultError, StatusSnapshot, WorkflowInput,
};
use crate::domain::ports::{PersistenceStore, WorkExecutor};
use crate::services::failure_recovery::FailureRecoveryController;
use crate::services::learning::LearningEngine;

use super::scope::Deps;
use super::Orchestrator;

/// Holds the services shared by every workflow and hands out a fresh
/// top-level [`Orchestrator`] per workflow.
#[derive(Clone)]
pub struct OrchestrationEngine {
    deps: Arc<Deps>,
}

impl OrchestrationEngine {
    pub fn new(config: Config, executor: Arc<dyn WorkExecutor>, store: Arc<dyn PersistenceStore>) -> Self {
        tracing::info!(
            executor = executor.name(),
            max_concurrent_agents = config.resources.max_concurrent_agents,
            max_recursion_depth = config.resources.max_recursion_depth,
            "orchestration engine initialized"
        );
        Self { deps: Arc::new(Deps::new(config, executor, store)) }
    }

    pub fn config(&self) -> &Config {
        &self.deps.config
    }

    pub fn store(&self) -> Arc<dyn PersistenceStore> {
        self.deps.store.clone()
    }

    pub fn learning(&self) -> Arc<LearningEngine> {
        self.deps.learning.clone()
    }

    pub fn recovery(&self) -> Arc<FailureRecoveryController> {
        self.deps.recovery.clone()
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(self.deps.clone())
    }

    /// Run a workflow to completion.
    pub async fn submit(&self, input: WorkflowInput) -> OrchestratorResult {
        self.orchestrator().execute_workflow(input).await
    }

    /// Run a workflow in the background.
    pub fn spawn(&self, input: WorkflowInput) -> WorkflowHandle {
        let workflow_id = input.id;
        let orchestrator = Arc::new(self.orchestrator());
        let task = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.execute_workflow(input).await })
        };
        WorkflowHandle { workflow_id, orchestrator, task }
    }

    /// Wait for outstanding background scoring.
    pub async fn flush_learning(&self) {
        self.deps.background.drain().await;
    }

    pub async fn record_feedback(&self, record_id: Uuid, feedback: f64) -> DomainResult<ExecutionRecord> {
        self.deps.learning.record_feedback(record_id, feedback).await
    }
}

impl std::fmt::Debug for OrchestrationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationEngine")
            .field("executor", &self.deps.executor.name())
            .finish_non_exhaustive()
    }
}

/// A workflow running in the background.
#[derive(Debug)]
pub struct WorkflowHandle {
    workflow_id: Uuid,
    orchestrator: Arc<Orchestrator>,
    task: JoinHandle<OrchestratorResult>,
}

impl WorkflowHandle {
    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    pub fn status(&self) -> StatusSnapshot {
        self.orchestrator.status()
    }

    pub fn cancel(&self) -> bool {
        self.orchestrator.cancel()
    }

    pub fn pause(&self) -> bool {
        self.orchestrator.pause()
    }

    pub fn resume(&self) -> bool {
        self.orchestrator.resume()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Await the result. A panicked workflow task still resolves into a
    /// failed result.
    pub async fn join(self) -> OrchestratorResult {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(workflow_id = %self.workflow_id, error = %e, "workflow task aborted");
                OrchestratorResult {
                    workflow_id: self.workflow_id,
                    node_id: None,
                    success: false,
                    content: String::new(),
                    metadata: HashMap::new(),
                    execution_time: Duration::ZERO,
                    cost: 0.0,
                    error: Some(ResultError {
                        unit: format!("workflow {}", self.workflow_id),
                        kind: ErrorKind::Permanent,
                        retry_count: 0,
                        message: format!("workflow task aborted: {e}"),
                    }),
                }
            }
        }
    }
}

//! Learning loop integration: recommendations from seeded history, learned
//! overrides at selection time, feedback and continuation idempotence.

mod common;

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use uuid::Uuid;

use arbor::adapters::{InMemoryStore, MockExecutor};
use arbor::{
    ComplexityProfile, Config, ExecutionRecord, LearningEngine, NodeStatus, PersistenceStore, Strategy, WorkPurpose,
    WorkflowInput,
};
use common::{fast_config, harness};

fn record(strategy: Strategy, succeeded: bool, minutes_ago: i64) -> ExecutionRecord {
    let ended = Utc::now() - ChronoDuration::minutes(minutes_ago);
    let mut record = ExecutionRecord::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        strategy,
        ComplexityProfile::default(),
        ended - ChronoDuration::seconds(30),
        ended,
    );
    record.root_succeeded = succeeded;
    record
}

/// Six clean parallel runs and four sequential runs, two of them failed,
/// all in the low complexity bucket.
async fn seed_history(store: &InMemoryStore) {
    for i in 0..6 {
        store.save_execution_record(&record(Strategy::ParallelExecution, true, i + 1)).await.unwrap();
    }
    for i in 0..4 {
        let failed = i < 2;
        store
            .save_execution_record(&record(Strategy::SequentialDecomposition, !failed, i + 10))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_recommendation_prefers_consistent_strategy() {
    let store = Arc::new(InMemoryStore::new());
    seed_history(&store).await;
    let learning = LearningEngine::new(store.clone(), &Config::default());

    let recommendation = learning.adaptation().recommend(&ComplexityProfile::default()).await;

    assert_eq!(recommendation.strategy, Strategy::ParallelExecution);
    assert_eq!(recommendation.sample_count, 6);
    assert!(recommendation.confidence > 0.6, "confidence {}", recommendation.confidence);
    assert!(recommendation.confidence <= 0.98);
}

#[tokio::test]
async fn test_sparse_history_falls_back_to_default() {
    let store = Arc::new(InMemoryStore::new());
    for i in 0..3 {
        store.save_execution_record(&record(Strategy::CouncilDriven, true, i + 1)).await.unwrap();
    }
    let learning = LearningEngine::new(store.clone(), &Config::default());

    let recommendation = learning.adaptation().recommend(&ComplexityProfile::default()).await;

    assert_ne!(recommendation.strategy, Strategy::CouncilDriven);
    assert!(recommendation.confidence < 0.6);
}

#[tokio::test]
async fn test_learned_recommendation_overrides_rule_table() {
    let h = harness(fast_config(), MockExecutor::new());
    seed_history(&h.store).await;

    let result = h.engine.submit(WorkflowInput::user_prompt("summarize X")).await;

    assert!(result.success, "{:?}", result.error_message());
    assert_eq!(result.strategy(), Some(Strategy::ParallelExecution));
    assert_eq!(result.metadata["selected_strategy"], json!(Strategy::ParallelExecution));
    // no explicit items, so the coordinator asks for a decomposition
    assert_eq!(h.executor.calls_for(&WorkPurpose::Decompose), 1);
    assert_eq!(h.executor.calls_for(&WorkPurpose::Execute), 3);
}

#[tokio::test]
async fn test_goal_workflow_ignores_learned_history() {
    let h = harness(fast_config(), MockExecutor::new());
    seed_history(&h.store).await;

    let input = WorkflowInput::goal("improve performance", vec!["p99 latency below 50ms".to_string()]);
    let result = h.engine.submit(input).await;

    assert!(result.success, "{:?}", result.error_message());
    assert_eq!(result.strategy(), Some(Strategy::RecursiveDecomposition));
}

#[tokio::test]
async fn test_finished_workflow_is_scored() {
    let h = harness(fast_config(), MockExecutor::new());

    let result = h.engine.submit(WorkflowInput::user_prompt("summarize X")).await;
    h.engine.flush_learning().await;

    let record_id: Uuid = serde_json::from_value(result.metadata["record_id"].clone()).unwrap();
    let record = h.store.get_execution_record(record_id).await.unwrap().unwrap();
    let scores = record.scores.expect("record should be scored");
    assert!((scores.success - 1.0).abs() < f64::EPSILON);
    assert!((0.0..=1.0).contains(&scores.overall));

    let root = h.store.get_node(result.node_id.unwrap()).await.unwrap().unwrap();
    assert!(root.scores.is_some());
    assert_eq!(root.status, NodeStatus::Completed);
}

#[tokio::test]
async fn test_feedback_rescores_record() {
    let h = harness(fast_config(), MockExecutor::new());
    let result = h.engine.submit(WorkflowInput::user_prompt("summarize X")).await;
    h.engine.flush_learning().await;
    let record_id: Uuid = serde_json::from_value(result.metadata["record_id"].clone()).unwrap();

    let updated = h.engine.record_feedback(record_id, 0.2).await.unwrap();
    assert_eq!(updated.feedback, Some(0.2));

    let stored = h.store.get_execution_record(record_id).await.unwrap().unwrap();
    assert_eq!(stored.feedback, Some(0.2));
    assert!(h.engine.record_feedback(record_id, 1.5).await.is_err());
    assert!(h.engine.record_feedback(Uuid::new_v4(), 0.5).await.is_err());
}

#[tokio::test]
async fn test_continuation_leaves_parent_untouched() {
    let h = harness(fast_config(), MockExecutor::new());
    let parent = h.engine.submit(WorkflowInput::user_prompt("summarize X")).await;
    assert!(parent.success);
    h.engine.flush_learning().await;

    let parent_id = parent.node_id.unwrap();
    let versions_before = h.store.node_version_count(parent_id).await.unwrap();
    let parent_before = h.store.get_node(parent_id).await.unwrap().unwrap();

    let follow_up = h
        .engine
        .submit(WorkflowInput::continuation(parent_id, "expand on the summary", true))
        .await;
    h.engine.flush_learning().await;

    assert!(follow_up.success, "{:?}", follow_up.error_message());
    assert_eq!(follow_up.metadata["inherited_from"], json!(parent_id));
    assert_eq!(h.store.node_version_count(parent_id).await.unwrap(), versions_before);

    let parent_after = h.store.get_node(parent_id).await.unwrap().unwrap();
    assert_eq!(parent_after.status, NodeStatus::Completed);
    assert_eq!(parent_after.version, parent_before.version);

    let child = h.store.get_node(follow_up.node_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(child.parent_id, Some(parent_id));
    assert_eq!(child.depth, parent_before.depth + 1);
}

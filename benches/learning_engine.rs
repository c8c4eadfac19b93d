//! Benchmarks for the learning loop and orchestration overhead.
//!
//! Pattern computation runs on every cache miss during strategy selection,
//! so it is measured over window-sized histories. The end-to-end case uses
//! the zero-latency mock executor to isolate orchestration overhead.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Runtime;
use uuid::Uuid;

use arbor::adapters::{InMemoryStore, MockExecutor};
use arbor::domain::models::ComplexityLevel;
use arbor::services::learning::adaptation_engine::recommend_from;
use arbor::services::learning::pattern_analyzer::compute_strategy_patterns;
use arbor::{ComplexityProfile, Config, ExecutionRecord, OrchestrationEngine, Strategy, WorkflowInput};

const STRATEGIES: [Strategy; 6] = [
    Strategy::DirectExecution,
    Strategy::SequentialDecomposition,
    Strategy::ParallelExecution,
    Strategy::RecursiveDecomposition,
    Strategy::CouncilDriven,
    Strategy::IterativeRefinement,
];

fn history(size: usize) -> Vec<ExecutionRecord> {
    let now = Utc::now();
    (0..size)
        .map(|i| {
            let mut profile = ComplexityProfile::default();
            if i % 3 == 0 {
                profile.scope = ComplexityLevel::High;
            }
            let ended = now - ChronoDuration::seconds(i64::try_from(i).unwrap_or(i64::MAX));
            let mut record = ExecutionRecord::new(
                Uuid::new_v4(),
                Uuid::new_v4(),
                STRATEGIES[i % STRATEGIES.len()],
                profile,
                ended - ChronoDuration::seconds(20),
                ended,
            );
            record.root_succeeded = i % 5 != 0;
            record
        })
        .collect()
}

fn bench_patterns(c: &mut Criterion) {
    let mut group = c.benchmark_group("strategy_patterns");
    for size in [100, 1000] {
        let records = history(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &records, |b, records| {
            b.iter(|| compute_strategy_patterns(black_box(records), 5));
        });
    }
    group.finish();
}

fn bench_recommend(c: &mut Criterion) {
    let patterns = compute_strategy_patterns(&history(1000), 5);
    let bucket = ComplexityProfile::default().bucket();
    c.bench_function("recommend_from", |b| {
        b.iter(|| recommend_from(black_box(&patterns), bucket, 0.98));
    });
}

fn bench_direct_workflow(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let engine = OrchestrationEngine::new(
        Config::default(),
        Arc::new(MockExecutor::new()),
        Arc::new(InMemoryStore::new()),
    );

    c.bench_function("direct_workflow", |b| {
        b.to_async(&rt).iter(|| async {
            let result = engine.submit(WorkflowInput::user_prompt("summarize X")).await;
            black_box(result.success)
        });
    });
}

criterion_group!(benches, bench_patterns, bench_recommend, bench_direct_workflow);
criterion_main!(benches);

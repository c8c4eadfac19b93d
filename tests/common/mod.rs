//! Common test utilities for integration tests
//!
//! Provides engine fixtures wired to the in-memory store and the scripted
//! mock executor, shared across the scenario test files.

use std::sync::Arc;

use arbor::adapters::{InMemoryStore, MockExecutor};
use arbor::{Config, OrchestrationEngine};

/// Engine plus handles kept for assertions.
#[allow(dead_code)]
pub struct Harness {
    pub engine: OrchestrationEngine,
    pub store: Arc<InMemoryStore>,
    pub executor: MockExecutor,
}

/// Default configuration with millisecond backoff so retry tests stay fast.
#[allow(dead_code)]
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 10;
    config
}

/// Build an engine over a fresh in-memory store.
#[allow(dead_code)]
pub fn harness(config: Config, executor: MockExecutor) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let engine = OrchestrationEngine::new(config, Arc::new(executor.clone()), store.clone());
    Harness { engine, store, executor }
}

/// Setup test logging
///
/// Initializes tracing subscriber for test output.
#[allow(dead_code)]
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

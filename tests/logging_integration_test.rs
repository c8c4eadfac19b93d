// Integration test for file logging.
// Installs the global subscriber, so this binary holds a single test.

mod common;

use std::fs;

use arbor::adapters::MockExecutor;
use arbor::infrastructure::logging::{LogFormat, RotationPolicy};
use arbor::{LogConfig, LoggerImpl, WorkflowInput};
use common::{fast_config, harness};
use tempfile::TempDir;

#[tokio::test]
async fn test_workflow_events_reach_log_file() {
    let temp_dir = TempDir::new().unwrap();
    let config = LogConfig {
        level: "info".to_string(),
        format: LogFormat::Json,
        log_dir: Some(temp_dir.path().to_path_buf()),
        enable_stdout: false,
        rotation: RotationPolicy::Never,
        retention_days: 7,
    };

    let logger = LoggerImpl::init(&config).unwrap();
    assert!(logger.has_file_output());

    let h = harness(fast_config(), MockExecutor::new());
    let result = h.engine.submit(WorkflowInput::user_prompt("summarize X")).await;
    assert!(result.success);

    // dropping the guard flushes the non-blocking writer
    drop(logger);

    let contents: String = fs::read_dir(temp_dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with("arbor"))
        .map(|e| fs::read_to_string(e.path()).unwrap())
        .collect();

    assert!(contents.contains("logger initialized"));
    assert!(contents.contains("strategy selected"));
    assert!(contents.contains("workflow completed"));
    assert!(contents.contains(&result.workflow_id.to_string()));
    for line in contents.lines().filter(|l| !l.trim().is_empty()) {
        serde_json::from_str::<serde_json::Value>(line).expect("log lines should be JSON");
    }
}

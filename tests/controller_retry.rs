// tests/controller_retry.rs

mod common;
use crate::common::Harness;

use std::error::Error;
use std::time::{Duration, Instant};

use serde_json::json;

use flowhost::backend::{CreateError, CreateErrorKind};
use flowhost::process::StartError;
use flowhost::workflow::{FaultCause, InstanceStatus};
use flowhost_test_utils::builders::{InstanceBuilder, OptionsBuilder};
use flowhost_test_utils::mock_backend::{CallKind, Script};
use flowhost_test_utils::{init_tracing, wait_for_status};

type TestResult = Result<(), Box<dyn Error>>;

fn unreachable() -> CreateError {
    CreateError::new(CreateErrorKind::BackendUnreachable, "daemon not answering")
}

#[tokio::test]
async fn retryable_create_failures_back_off_then_succeed() -> TestResult {
    init_tracing();
    let h = Harness::new(
        OptionsBuilder::new()
            .retry(3, Duration::from_millis(40))
            .build(),
    );
    h.backend.script(
        "wf-1",
        vec![
            Script::fails_create(unreachable()),
            Script::fails_create(unreachable()),
            Script::exits(0, &["{\"ok\":true}"]),
        ],
    );
    h.create(InstanceBuilder::new("wf-1").build()).await;

    let began = Instant::now();
    // The first failure is retried in the background.
    assert_eq!(h.controller.launch("wf-1").await?, InstanceStatus::Pending);
    let pending = h.get("wf-1").await;
    assert_eq!(
        pending.error.map(|e| e.cause),
        Some(FaultCause::BackendUnavailable)
    );

    let done = wait_for_status(&h.store, "wf-1", InstanceStatus::Completed).await?;
    // 40ms before attempt 2, 80ms before attempt 3.
    assert!(began.elapsed() >= Duration::from_millis(120));
    assert_eq!(done.attempts, 3);
    assert_eq!(done.output, Some(json!({"ok": true})));
    assert!(done.error.is_none());
    assert_eq!(h.backend.count("wf-1", CallKind::Create), 3);
    assert_eq!(h.backend.count("wf-1", CallKind::Start), 1);
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_fault_the_instance() -> TestResult {
    init_tracing();
    let h = Harness::new(
        OptionsBuilder::new()
            .retry(2, Duration::from_millis(10))
            .build(),
    );
    h.backend
        .script("wf-2", vec![Script::fails_create(unreachable())]);
    h.create(InstanceBuilder::new("wf-2").build()).await;

    h.controller.launch("wf-2").await?;
    let faulted = wait_for_status(&h.store, "wf-2", InstanceStatus::Faulted).await?;

    let error = faulted.error.ok_or("missing error")?;
    assert_eq!(error.cause, FaultCause::BackendUnavailable);
    assert_eq!(error.attempt, 2);
    assert_eq!(h.backend.count("wf-2", CallKind::Create), 2);
    Ok(())
}

#[tokio::test]
async fn invalid_spec_start_failure_is_not_retried() -> TestResult {
    init_tracing();
    let h = Harness::new(
        OptionsBuilder::new()
            .retry(3, Duration::from_millis(10))
            .build(),
    );
    h.backend.script(
        "wf-3",
        vec![Script::fails_start(StartError::ExecutableNotFound(
            "/opt/runner".into(),
        ))],
    );
    h.create(InstanceBuilder::new("wf-3").build()).await;

    assert_eq!(h.controller.launch("wf-3").await?, InstanceStatus::Faulted);

    let faulted = h.get("wf-3").await;
    let error = faulted.error.ok_or("missing error")?;
    assert_eq!(error.cause, FaultCause::InvalidSpec);
    assert!(error.message.contains("/opt/runner"), "{}", error.message);
    // The failed handle is still released.
    assert_eq!(
        h.backend.calls_for("wf-3"),
        vec![CallKind::Create, CallKind::Release]
    );
    Ok(())
}

#[tokio::test]
async fn slow_start_hits_the_operation_timeout() -> TestResult {
    init_tracing();
    let h = Harness::new(
        OptionsBuilder::new()
            .operation_timeout(Duration::from_millis(100))
            .build(),
    );
    h.backend.script(
        "wf-4",
        vec![Script::exits(0, &[]).start_delay(Duration::from_secs(10))],
    );
    h.create(InstanceBuilder::new("wf-4").build()).await;

    let began = Instant::now();
    assert_eq!(h.controller.launch("wf-4").await?, InstanceStatus::Faulted);
    assert!(began.elapsed() < Duration::from_secs(5));

    let error = h.get("wf-4").await.error.ok_or("missing error")?;
    assert_eq!(error.cause, FaultCause::Timeout);
    assert_eq!(
        h.backend.calls_for("wf-4"),
        vec![CallKind::Create, CallKind::Release]
    );
    assert!(!h.controller.has_live_process("wf-4"));
    Ok(())
}

#[tokio::test]
async fn terminate_during_backoff_cancels_the_retry() -> TestResult {
    init_tracing();
    let h = Harness::new(
        OptionsBuilder::new()
            .retry(3, Duration::from_millis(200))
            .build(),
    );
    h.backend
        .script("wf-5", vec![Script::fails_create(unreachable())]);
    h.create(InstanceBuilder::new("wf-5").build()).await;

    assert_eq!(h.controller.launch("wf-5").await?, InstanceStatus::Pending);
    assert_eq!(h.controller.terminate("wf-5").await?, InstanceStatus::Cancelled);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.get("wf-5").await.status, InstanceStatus::Cancelled);
    assert_eq!(h.backend.count("wf-5", CallKind::Create), 1);
    Ok(())
}

//! Test: failure machinery - retry, continue-on-error, on-failure routing

use crate::helpers::*;
use serde_json::json;

#[tokio::test]
async fn test_retry_reattempts_then_succeeds() {
    let h = harness_with(
        json!({}),
        MockProvider::scripted(vec![Err("flaky"), Err("flaky"), Ok("done")]),
    );
    let p = pipeline(json!({
        "name": "retry",
        "steps": [
            { "id": "flaky", "intent": "terminal.run",
              "payload": { "command": "echo hi" },
              "retry": { "mode": "fixed", "maxAttempts": 3, "delayMs": 1 } }
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(outcome.success);
    assert_eq!(h.provider.call_count(), 3);
    assert_eq!(logs_containing(&h, "[retry]"), 2);
}

#[tokio::test]
async fn test_retry_exhaustion_fails_run() {
    let h = harness_with(
        json!({}),
        MockProvider::scripted(vec![Err("down"), Err("down")]),
    );
    let p = pipeline(json!({
        "name": "retry-exhausted",
        "steps": [
            { "id": "flaky", "intent": "terminal.run",
              "payload": { "command": "echo hi" },
              "retry": { "mode": "fixed", "maxAttempts": 2, "delayMs": 1 } }
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(!outcome.success);
    assert_eq!(outcome.status, intentflow::RunStatus::Failure);
    assert_eq!(h.provider.call_count(), 2);
    assert_eq!(logs_containing(&h, "[retry]"), 1);
}

#[tokio::test]
async fn test_continue_on_error_absorbs_and_captures_message() {
    let h = harness_with(json!({}), MockProvider::scripted(vec![Err("boom")]));
    let p = pipeline(json!({
        "name": "absorb",
        "steps": [
            { "id": "bad", "intent": "terminal.run",
              "payload": { "command": "echo hi" },
              "continueOnError": true,
              "captureErrorVar": "last_error" },
            { "id": "save", "intent": "memory.save", "payload": { "key": "cap" } }
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(outcome.success);

    let ends = step_ends(&h);
    assert!(ends.contains(&("bad".to_string(), false)));
    assert!(ends.contains(&("save".to_string(), true)));

    let records = h.engine.memory().query(&intentflow::memory::QueryMemoryInput {
        session_id: Some("default".to_string()),
        key: Some("cap".to_string()),
        ..Default::default()
    });
    let captured = records[0].data["variables"]["last_error"]
        .as_str()
        .expect("captured message");
    assert!(captured.contains("bad"));
    assert!(captured.contains("terminal.run"));
    assert!(captured.contains("boom"));
}

#[tokio::test]
async fn test_on_failure_routes_to_fallback() {
    let h = harness_with(json!({}), MockProvider::scripted(vec![Err("boom")]));
    let p = pipeline(json!({
        "name": "route-on-failure",
        "steps": [
            { "id": "bad", "intent": "terminal.run",
              "payload": { "command": "echo bad" },
              "onFailure": "cleanup" },
            { "id": "skipped", "intent": "terminal.run", "payload": { "command": "echo skipped" } },
            { "id": "cleanup", "intent": "terminal.run", "payload": { "command": "echo cleanup" } }
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(outcome.success);
    assert_eq!(h.provider.commands(), vec!["echo bad", "echo cleanup"]);
}

#[tokio::test]
async fn test_unhandled_failure_ends_run() {
    let h = harness_with(json!({}), MockProvider::scripted(vec![Err("boom")]));
    let p = pipeline(json!({
        "name": "fail",
        "steps": [
            { "id": "bad", "intent": "terminal.run", "payload": { "command": "echo bad" } },
            { "id": "after", "intent": "terminal.run", "payload": { "command": "echo after" } }
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(!outcome.success);
    assert_eq!(outcome.status, intentflow::RunStatus::Failure);
    assert_eq!(h.provider.commands(), vec!["echo bad"]);
}

#[tokio::test]
async fn test_compile_error_flows_through_failure_machinery() {
    // Missing required field fails compilation; onFailure still applies
    let h = harness();
    let p = pipeline(json!({
        "name": "compile-fail",
        "steps": [
            { "id": "bad", "intent": "git.checkout", "payload": {}, "onFailure": "recover" },
            { "id": "recover", "intent": "terminal.run", "payload": { "command": "echo recovered" } }
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(outcome.success);
    assert_eq!(h.provider.commands(), vec!["echo recovered"]);
}

//! Test: variable resolution, sanitization, input collection

use crate::helpers::*;
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn test_shell_values_arrive_as_inert_tokens() {
    let h = harness();
    let p = pipeline(json!({
        "name": "sanitize",
        "steps": [
            { "id": "set", "intent": "system.setVar",
              "payload": { "name": "branch", "value": "x\"; rm -rf /" } },
            { "id": "co", "intent": "terminal.run",
              "payload": { "command": "git checkout ${var:branch}" } }
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(outcome.success);
    assert_eq!(h.provider.commands(), vec!["git checkout \"x\\\"; rm -rf /\""]);
}

#[tokio::test]
async fn test_missing_variable_resolves_to_empty() {
    let h = harness();
    let p = pipeline(json!({
        "name": "missing-var",
        "steps": [
            { "id": "t", "intent": "terminal.run", "payload": { "command": "echo [${var:nope}]" } }
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(outcome.success);
    assert_eq!(h.provider.commands(), vec!["echo [\"\"]"]);
}

#[tokio::test]
async fn test_input_collected_once_per_run() {
    let collector = CountingCollector::new("alice");
    let h = harness_full(
        json!({}),
        MockProvider::succeeding(),
        Box::new(SharedCollector(Arc::clone(&collector))),
    );
    let p = pipeline(json!({
        "name": "inputs",
        "steps": [
            { "id": "first", "intent": "terminal.run", "payload": { "command": "echo ${input:Name}" } },
            { "id": "second", "intent": "terminal.run", "payload": { "command": "echo ${input:Name}" } }
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(outcome.success);
    assert_eq!(collector.count(), 1);
    assert_eq!(h.provider.commands(), vec!["echo \"alice\"", "echo \"alice\""]);
}

#[tokio::test]
async fn test_git_intent_translates_to_terminal_command() {
    let h = harness();
    let p = pipeline(json!({
        "name": "translate",
        "steps": [
            { "id": "co", "intent": "git.checkout",
              "payload": { "branch": "feature-x", "create": true } }
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(outcome.success);

    let calls = h.provider.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "terminal.run");
    assert_eq!(calls[0].1["command"], "git checkout -b feature-x");
    assert!(calls[0].1["cwd"].as_str().is_some());
}

#[tokio::test]
async fn test_strict_argument_validation_fails_step() {
    let h = harness();
    let p = pipeline(json!({
        "name": "strict",
        "steps": [
            { "id": "co", "intent": "git.checkout",
              "payload": { "branch": "bad branch; rm" } }
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(!outcome.success);
    assert_eq!(h.provider.call_count(), 0);
}

#[tokio::test]
async fn test_form_collects_fields_into_variables() {
    let collector = CountingCollector::new("blue");
    let h = harness_full(
        json!({}),
        MockProvider::succeeding(),
        Box::new(SharedCollector(Arc::clone(&collector))),
    );
    let p = pipeline(json!({
        "name": "form",
        "steps": [
            { "id": "ask", "intent": "system.form",
              "payload": { "fields": [ { "name": "color", "prompt": "Favourite color?" } ] } },
            { "id": "use", "intent": "terminal.run", "payload": { "command": "echo ${var:color}" } }
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(outcome.success);
    assert_eq!(collector.count(), 1);
    assert_eq!(h.provider.commands(), vec!["echo \"blue\""]);
}

#[tokio::test]
async fn test_set_cwd_moves_within_engine_root() {
    let h = harness();
    std::fs::create_dir(h.dir.path().join("sub")).unwrap();

    let p = pipeline(json!({
        "name": "set-cwd",
        "steps": [
            { "id": "cd", "intent": "system.setCwd", "payload": { "path": "sub" } },
            { "id": "t", "intent": "terminal.run", "payload": { "command": "echo hi" } }
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(outcome.success);

    let calls = h.provider.calls();
    let cwd = calls[0].1["cwd"].as_str().unwrap();
    assert!(cwd.ends_with("sub"));
}

#[tokio::test]
async fn test_set_cwd_outside_root_is_rejected() {
    let h = harness();
    let p = pipeline(json!({
        "name": "set-cwd-escape",
        "steps": [
            { "id": "cd", "intent": "system.setCwd", "payload": { "path": "/" } },
            { "id": "t", "intent": "terminal.run", "payload": { "command": "echo hi" } }
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(!outcome.success);
    assert_eq!(h.provider.call_count(), 0);
}

#[tokio::test]
async fn test_provider_output_captured_into_variable() {
    let h = harness_with(json!({}), MockProvider::scripted(vec![Ok("v1.2.3")]));
    let p = pipeline(json!({
        "name": "capture",
        "steps": [
            { "id": "read", "intent": "terminal.run",
              "payload": { "command": "cat VERSION", "outputVar": "version" } },
            { "id": "use", "intent": "terminal.run",
              "payload": { "command": "echo ${var:version}" } }
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(outcome.success);
    assert_eq!(h.provider.commands()[1], "echo \"v1.2.3\"");
}

//! Test: sandbox policy - allowlists, heuristics, quotas

use crate::helpers::*;
use serde_json::json;

fn sandbox_config(sandbox: serde_json::Value) -> serde_json::Value {
    json!({ "runtime": { "sandbox": sandbox } })
}

#[tokio::test]
async fn test_allowlist_blocks_undeclared_intent() {
    let h = harness_with(
        sandbox_config(json!({ "allowedIntents": ["system.setVar"] })),
        MockProvider::succeeding(),
    );
    let p = pipeline(json!({
        "name": "allowlist",
        "steps": [
            { "id": "t", "intent": "terminal.run", "payload": { "command": "echo hi" } }
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(!outcome.success);
    assert_eq!(h.provider.call_count(), 0);
}

#[tokio::test]
async fn test_empty_allowlist_means_no_restriction() {
    let h = harness();
    let p = pipeline(json!({
        "name": "open",
        "steps": [
            { "id": "t", "intent": "terminal.run", "payload": { "command": "echo hi" } }
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(outcome.success);
    assert_eq!(h.provider.call_count(), 1);
}

#[tokio::test]
async fn test_network_heuristic_blocks_command() {
    let h = harness_with(
        sandbox_config(json!({ "allowNetwork": false })),
        MockProvider::succeeding(),
    );
    let p = pipeline(json!({
        "name": "net",
        "steps": [
            { "id": "t", "intent": "terminal.run", "payload": { "command": "git pull origin main" } }
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(!outcome.success);
    assert_eq!(h.provider.call_count(), 0);
}

#[tokio::test]
async fn test_file_write_heuristic_blocks_command() {
    let h = harness_with(
        sandbox_config(json!({ "allowFileWrite": false })),
        MockProvider::succeeding(),
    );
    let p = pipeline(json!({
        "name": "write",
        "steps": [
            { "id": "t", "intent": "terminal.run", "payload": { "command": "rm -rf build" } }
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(!outcome.success);
    assert_eq!(h.provider.call_count(), 0);
}

#[tokio::test]
async fn test_network_quota_spans_steps() {
    let h = harness_with(
        sandbox_config(json!({ "maxNetworkOps": 1 })),
        MockProvider::succeeding(),
    );
    let p = pipeline(json!({
        "name": "quota",
        "steps": [
            { "id": "first", "intent": "terminal.run", "payload": { "command": "curl https://a.dev" } },
            { "id": "second", "intent": "terminal.run", "payload": { "command": "curl https://b.dev" } }
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(!outcome.success);
    assert_eq!(h.provider.call_count(), 1);
}

#[tokio::test]
async fn test_command_length_limit() {
    let h = harness_with(
        sandbox_config(json!({ "maxCommandChars": 10 })),
        MockProvider::succeeding(),
    );
    let p = pipeline(json!({
        "name": "long",
        "steps": [
            { "id": "t", "intent": "terminal.run", "payload": { "command": "echo aaaaaaaaaaaaaaaa" } }
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(!outcome.success);
    assert_eq!(h.provider.call_count(), 0);
}

#[tokio::test]
async fn test_unknown_capability_fails_even_in_dry_run() {
    let h = harness();
    let p = pipeline(json!({
        "name": "unknown",
        "steps": [
            { "id": "t", "intent": "deploy.service", "payload": {} }
        ]
    }));

    let options = intentflow::RunOptions {
        dry_run: true,
        ..Default::default()
    };
    let outcome = run_with(&h, p, options).await;
    assert!(!outcome.success);
    assert_eq!(h.provider.call_count(), 0);
}

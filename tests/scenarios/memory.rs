//! Test: memory intents - save, recall, clear across runs

use crate::helpers::*;
use intentflow::memory::{QueryMemoryInput, SaveMemoryInput};
use serde_json::json;

#[tokio::test]
async fn test_save_then_recall_injects_variables() {
    let h = harness();

    let save_run = pipeline(json!({
        "name": "save-run",
        "steps": [
            { "id": "set", "intent": "system.setVar",
              "payload": { "name": "color", "value": "teal" } },
            { "id": "save", "intent": "memory.save", "payload": { "key": "prefs" } }
        ]
    }));
    assert!(run(&h, save_run).await.success);

    let recall_run = pipeline(json!({
        "name": "recall-run",
        "steps": [
            { "id": "recall", "intent": "memory.recall",
              "payload": { "key": "prefs", "injectVars": true, "requireMatch": true } },
            { "id": "use", "intent": "terminal.run",
              "payload": { "command": "echo ${var:color}" } }
        ]
    }));
    let outcome = run(&h, recall_run).await;
    assert!(outcome.success);
    assert_eq!(h.provider.commands(), vec!["echo \"teal\""]);
}

#[tokio::test]
async fn test_require_match_fails_on_empty_result() {
    let h = harness();
    let p = pipeline(json!({
        "name": "recall-miss",
        "steps": [
            { "id": "recall", "intent": "memory.recall",
              "payload": { "key": "never-saved", "requireMatch": true } }
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(!outcome.success);
}

#[tokio::test]
async fn test_recall_serializes_records_into_output_var() {
    let h = harness();

    let save_run = pipeline(json!({
        "name": "save-run",
        "steps": [
            { "id": "save", "intent": "memory.save",
              "payload": { "key": "note", "data": { "text": "remember me" } } }
        ]
    }));
    assert!(run(&h, save_run).await.success);

    let recall_run = pipeline(json!({
        "name": "recall-run",
        "steps": [
            { "id": "recall", "intent": "memory.recall",
              "payload": { "key": "note", "outputVar": "found" } },
            { "id": "snap", "intent": "memory.save", "payload": { "key": "snap" } }
        ]
    }));
    assert!(run(&h, recall_run).await.success);

    let records = h.engine.memory().query(&QueryMemoryInput {
        session_id: Some("default".to_string()),
        key: Some("snap".to_string()),
        ..Default::default()
    });
    let found: serde_json::Value =
        serde_json::from_str(records[0].data["variables"]["found"].as_str().unwrap()).unwrap();
    assert_eq!(found.as_array().unwrap().len(), 1);
    assert_eq!(found[0]["data"]["text"], "remember me");
}

#[tokio::test]
async fn test_clear_honors_keep_last() {
    let h = harness();
    for i in 0..3 {
        h.engine
            .memory()
            .save(SaveMemoryInput {
                session_id: "default".to_string(),
                key: Some("entry".to_string()),
                data: json!(i),
                ..Default::default()
            })
            .unwrap();
    }

    let p = pipeline(json!({
        "name": "clear",
        "steps": [
            { "id": "clear", "intent": "memory.clear",
              "payload": { "key": "entry", "keepLast": 1 } }
        ]
    }));
    assert!(run(&h, p).await.success);

    let remaining = h.engine.memory().query(&QueryMemoryInput {
        session_id: Some("default".to_string()),
        key: Some("entry".to_string()),
        ..Default::default()
    });
    assert_eq!(remaining.len(), 1);
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let h = harness();

    let save_run = pipeline(json!({
        "name": "save-run",
        "steps": [
            { "id": "save", "intent": "memory.save",
              "payload": { "key": "k", "sessionId": "alpha", "data": { "v": 1 } } }
        ]
    }));
    assert!(run(&h, save_run).await.success);

    let other = h.engine.memory().query(&QueryMemoryInput {
        session_id: Some("beta".to_string()),
        key: Some("k".to_string()),
        ..Default::default()
    });
    assert!(other.is_empty());

    let own = h.engine.memory().query(&QueryMemoryInput {
        session_id: Some("alpha".to_string()),
        key: Some("k".to_string()),
        ..Default::default()
    });
    assert_eq!(own.len(), 1);
}

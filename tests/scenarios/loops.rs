//! Test: system.loop - child pipelines, graph segments, error strategies

use crate::helpers::*;
use serde_json::json;

fn child_pipeline() -> serde_json::Value {
    json!({
        "name": "child",
        "steps": [
            { "id": "work", "intent": "terminal.run",
              "payload": { "command": "echo ${var:loop_item}" } }
        ]
    })
}

#[tokio::test]
async fn test_child_pipeline_loop_runs_per_item() {
    let h = harness();
    write_pipeline(h.dir.path(), "child.intent.json", &child_pipeline());

    let p = pipeline(json!({
        "name": "loop",
        "steps": [
            { "id": "iterate", "intent": "system.loop", "payload": {
                "items": "a,b,c",
                "pipelinePath": "child.intent.json",
                "outputVar": "loop_summary"
            }},
            { "id": "save", "intent": "memory.save", "payload": { "key": "sum" } }
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(outcome.success);
    assert_eq!(
        h.provider.commands(),
        vec!["echo \"a\"", "echo \"b\"", "echo \"c\""]
    );
    assert!(logs_containing(&h, "[loop]") >= 3);

    let records = h.engine.memory().query(&intentflow::memory::QueryMemoryInput {
        session_id: Some("default".to_string()),
        key: Some("sum".to_string()),
        ..Default::default()
    });
    let summary: serde_json::Value = serde_json::from_str(
        records[0].data["variables"]["loop_summary"].as_str().unwrap(),
    )
    .unwrap();
    assert_eq!(summary["processedItems"], 3);
    assert_eq!(summary["successCount"], 3);
    assert_eq!(summary["failureCount"], 0);
    assert_eq!(summary["truncated"], false);
}

#[tokio::test]
async fn test_fail_at_end_processes_all_items() {
    let h = harness_with(
        json!({}),
        MockProvider::scripted(vec![Err("x"), Err("x"), Err("x")]),
    );
    write_pipeline(h.dir.path(), "child.intent.json", &child_pipeline());

    let p = pipeline(json!({
        "name": "loop-fail-at-end",
        "steps": [
            { "id": "iterate", "intent": "system.loop", "payload": {
                "items": "a,b,c",
                "pipelinePath": "child.intent.json",
                "errorStrategy": "fail_at_end"
            }}
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(!outcome.success);
    // All three items ran before the loop reported failure
    assert_eq!(h.provider.call_count(), 3);
}

#[tokio::test]
async fn test_fail_fast_stops_at_first_failure() {
    let h = harness_with(json!({}), MockProvider::scripted(vec![Err("x")]));
    write_pipeline(h.dir.path(), "child.intent.json", &child_pipeline());

    let p = pipeline(json!({
        "name": "loop-fail-fast",
        "steps": [
            { "id": "iterate", "intent": "system.loop", "payload": {
                "items": "a,b,c",
                "pipelinePath": "child.intent.json",
                "errorStrategy": "fail_fast"
            }}
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(!outcome.success);
    assert_eq!(h.provider.call_count(), 1);
}

#[tokio::test]
async fn test_threshold_aborts_past_allowed_failures() {
    let h = harness_with(json!({}), MockProvider::scripted(vec![Err("x"), Err("x")]));
    write_pipeline(h.dir.path(), "child.intent.json", &child_pipeline());

    let p = pipeline(json!({
        "name": "loop-threshold",
        "steps": [
            { "id": "iterate", "intent": "system.loop", "payload": {
                "items": "a,b,c,d,e",
                "pipelinePath": "child.intent.json",
                "errorStrategy": "threshold",
                "errorThreshold": 1
            }}
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(!outcome.success);
    // Aborted on the second failure
    assert_eq!(h.provider.call_count(), 2);
}

#[tokio::test]
async fn test_max_iterations_truncates() {
    let h = harness();
    write_pipeline(h.dir.path(), "child.intent.json", &child_pipeline());

    let p = pipeline(json!({
        "name": "loop-truncate",
        "steps": [
            { "id": "iterate", "intent": "system.loop", "payload": {
                "items": "a,b,c,d,e",
                "pipelinePath": "child.intent.json",
                "maxIterations": 2,
                "outputVar": "loop_summary"
            }},
            { "id": "save", "intent": "memory.save", "payload": { "key": "sum" } }
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(outcome.success);
    assert_eq!(h.provider.call_count(), 2);

    let records = h.engine.memory().query(&intentflow::memory::QueryMemoryInput {
        session_id: Some("default".to_string()),
        key: Some("sum".to_string()),
        ..Default::default()
    });
    let summary: serde_json::Value = serde_json::from_str(
        records[0].data["variables"]["loop_summary"].as_str().unwrap(),
    )
    .unwrap();
    assert_eq!(summary["processedItems"], 2);
    assert_eq!(summary["truncated"], true);
}

#[tokio::test]
async fn test_graph_segment_reexecutes_current_steps() {
    let h = harness();
    let p = pipeline(json!({
        "name": "loop-graph",
        "steps": [
            { "id": "iterate", "intent": "system.loop", "payload": {
                "executionMode": "graph_segment",
                "items": "1,2",
                "graphStepIds": ["work"],
                "doneStepId": "done"
            }},
            { "id": "work", "intent": "terminal.run",
              "payload": { "command": "echo ${var:loop_item}" } },
            { "id": "done", "intent": "system.setVar",
              "payload": { "name": "finished", "value": "yes" } }
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(outcome.success);
    assert_eq!(h.provider.commands(), vec!["echo \"1\"", "echo \"2\""]);

    // "work" ran only inside the loop, twice
    let work_ends = step_ends(&h)
        .into_iter()
        .filter(|(id, _)| id == "work")
        .count();
    assert_eq!(work_ends, 2);
}

#[tokio::test]
async fn test_index_continues_across_repeat_cycles() {
    let h = harness();
    write_pipeline(
        h.dir.path(),
        "index.intent.json",
        &json!({
            "name": "index",
            "steps": [
                { "id": "say", "intent": "terminal.run",
                  "payload": { "command": "echo ${var:loop_index}" } }
            ]
        }),
    );

    let p = pipeline(json!({
        "name": "loop-repeat",
        "steps": [
            { "id": "iterate", "intent": "system.loop", "payload": {
                "items": "a,b",
                "repeatCount": 2,
                "pipelinePath": "index.intent.json"
            }}
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(outcome.success);
    assert_eq!(
        h.provider.commands(),
        vec!["echo \"0\"", "echo \"1\"", "echo \"2\"", "echo \"3\""]
    );
}

#[tokio::test]
async fn test_empty_items_fails_step() {
    let h = harness();
    write_pipeline(h.dir.path(), "child.intent.json", &child_pipeline());

    let p = pipeline(json!({
        "name": "loop-empty",
        "steps": [
            { "id": "iterate", "intent": "system.loop", "payload": {
                "items": "  ",
                "pipelinePath": "child.intent.json"
            }}
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(!outcome.success);
    assert_eq!(h.provider.call_count(), 0);
}

#[tokio::test]
async fn test_child_pipeline_mode_requires_path() {
    let h = harness();
    let p = pipeline(json!({
        "name": "loop-no-path",
        "steps": [
            { "id": "iterate", "intent": "system.loop", "payload": { "items": "a" } }
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(!outcome.success);
    assert_eq!(h.provider.call_count(), 0);
}

#[tokio::test]
async fn test_loop_input_seeds_child_variables() {
    let h = harness();
    write_pipeline(
        h.dir.path(),
        "greet.intent.json",
        &json!({
            "name": "greet",
            "steps": [
                { "id": "say", "intent": "terminal.run",
                  "payload": { "command": "echo ${var:greeting} ${var:loop_item}" } }
            ]
        }),
    );

    let p = pipeline(json!({
        "name": "loop-input",
        "steps": [
            { "id": "iterate", "intent": "system.loop", "payload": {
                "items": "[\"ada\"]",
                "pipelinePath": "greet.intent.json",
                "input": { "greeting": "hello" }
            }}
        ]
    }));

    let outcome = run(&h, p).await;
    assert!(outcome.success);
    assert_eq!(h.provider.commands(), vec!["echo \"hello\" \"ada\""]);
}

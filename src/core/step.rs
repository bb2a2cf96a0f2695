//! Step domain model - declarative intents plus control/failure policy

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single step in a pipeline: an intent, its payload, and the
/// control-flow metadata that decides what happens when it fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Unique step identifier within the pipeline
    pub id: String,

    /// Declarative intent name (e.g. "git.checkout", "terminal.run")
    pub intent: String,

    /// Human-readable description shown in events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Raw intent payload (variable templates still unresolved)
    #[serde(default)]
    pub payload: Value,

    /// Retry policy applied when dispatch fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Absorb a failure and continue with the next sequential step
    #[serde(default)]
    pub continue_on_error: bool,

    /// Variable receiving the failure message when the step is absorbed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_error_var: Option<String>,

    /// Step id to transfer control to on a non-absorbed failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<String>,

    /// Free-form metadata carried through compilation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl Step {
    /// Minimal step constructor used by tests and the builder surface
    pub fn new(id: impl Into<String>, intent: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            intent: intent.into(),
            description: None,
            payload,
            retry: None,
            continue_on_error: false,
            capture_error_var: None,
            on_failure: None,
            meta: None,
        }
    }
}

/// Retry policy for a failed dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Retry mode; only "fixed" is recognized
    pub mode: RetryMode,

    /// Total attempts, including the first one
    pub max_attempts: u32,

    /// Delay between attempts in milliseconds
    #[serde(default)]
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    Fixed,
}

/// A compiled step: post variable-resolution, post intent translation.
/// Pure data - a compiled step never executes anything itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledStep {
    /// Dispatch intent (translated intents become "terminal.run")
    pub intent: String,

    /// Capabilities the provider registry is asked to serve
    pub capabilities: Vec<String>,

    /// Fully resolved payload
    pub payload: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One route of a `system.switch` step. Routes evaluate in declared
/// order; the first match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchRoute {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default)]
    pub condition: RouteCondition,

    #[serde(default)]
    pub value: String,

    pub target_step_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteCondition {
    #[default]
    Equals,
    Contains,
    Exists,
    Regex,
}

impl SwitchRoute {
    /// Check this route against the observed variable value.
    ///
    /// An unparseable regex never matches and never errors; execution
    /// falls through to later routes or the default.
    pub fn matches(&self, observed: &str) -> bool {
        match self.condition {
            RouteCondition::Equals => observed == self.value,
            RouteCondition::Contains => observed.contains(&self.value),
            RouteCondition::Exists => !observed.is_empty(),
            RouteCondition::Regex => match Regex::new(&self.value) {
                Ok(re) => re.is_match(observed),
                Err(_) => false,
            },
        }
    }
}

/// Failure strategy for a loop body
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopErrorStrategy {
    #[default]
    FailFast,
    FailAtEnd,
    Threshold,
}

/// How a `system.loop` executes its body for each item
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopExecutionMode {
    /// Run a child pipeline file per item, as a fresh nested run
    #[default]
    ChildPipeline,
    /// Re-execute a designated segment of step ids in the current run
    GraphSegment,
}

/// Parsed configuration of a `system.loop` step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoopConfig {
    pub execution_mode: LoopExecutionMode,

    /// Items source: JSON array, newline list, CSV, or a template that
    /// resolves to one of those
    pub items: String,

    pub pipeline_path: Option<String>,
    pub graph_step_ids: Vec<String>,
    pub done_step_id: Option<String>,

    pub item_var: String,
    pub index_var: String,

    pub max_iterations: u32,
    pub repeat_count: u32,

    pub dry_run_child: bool,
    pub continue_on_child_error: bool,
    pub error_strategy: LoopErrorStrategy,
    pub error_threshold: u32,

    /// Base runtime variables handed to every child run
    pub input: Option<Value>,

    pub output_var: Option<String>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            execution_mode: LoopExecutionMode::ChildPipeline,
            items: String::new(),
            pipeline_path: None,
            graph_step_ids: Vec::new(),
            done_step_id: None,
            item_var: "loop_item".to_string(),
            index_var: "loop_index".to_string(),
            max_iterations: 20,
            repeat_count: 1,
            dry_run_child: false,
            continue_on_child_error: false,
            error_strategy: LoopErrorStrategy::FailFast,
            error_threshold: 1,
            input: None,
            output_var: None,
        }
    }
}

impl LoopConfig {
    /// Parse from a resolved step payload, tolerating the loose typing
    /// pipeline files use (numbers as strings, missing fields).
    pub fn from_payload(payload: &Value) -> Self {
        let mut cfg = LoopConfig::default();
        let Some(obj) = payload.as_object() else {
            return cfg;
        };

        if let Some(mode) = obj.get("executionMode").and_then(Value::as_str) {
            if mode.trim().eq_ignore_ascii_case("graph_segment") {
                cfg.execution_mode = LoopExecutionMode::GraphSegment;
            }
        }
        cfg.items = string_field(obj.get("items"));
        cfg.pipeline_path = non_empty(string_field(obj.get("pipelinePath")));
        cfg.graph_step_ids = list_field(obj.get("graphStepIds"));
        cfg.done_step_id = non_empty(string_field(obj.get("doneStepId")));
        if let Some(v) = non_empty(string_field(obj.get("itemVar"))) {
            cfg.item_var = v;
        }
        if let Some(v) = non_empty(string_field(obj.get("indexVar"))) {
            cfg.index_var = v;
        }
        cfg.max_iterations = numeric_field(obj.get("maxIterations"), 20).max(1);
        cfg.repeat_count = numeric_field(obj.get("repeatCount"), 1).max(1);
        cfg.dry_run_child = bool_field(obj.get("dryRunChild"));
        cfg.continue_on_child_error = bool_field(obj.get("continueOnChildError"));
        cfg.error_strategy = match string_field(obj.get("errorStrategy")).trim() {
            "fail_at_end" => LoopErrorStrategy::FailAtEnd,
            "threshold" => LoopErrorStrategy::Threshold,
            "fail_fast" => LoopErrorStrategy::FailFast,
            _ if cfg.continue_on_child_error => LoopErrorStrategy::FailAtEnd,
            _ => LoopErrorStrategy::FailFast,
        };
        cfg.error_threshold = numeric_field(obj.get("errorThreshold"), 1).max(1);
        cfg.input = obj.get("input").cloned().filter(Value::is_object);
        cfg.output_var = non_empty(string_field(obj.get("outputVar")));
        cfg
    }

    /// Resolve the items expression into a finite item list.
    /// Accepts a JSON array, a newline-separated list, or CSV.
    pub fn parse_items(raw: &str) -> Vec<String> {
        let value = raw.trim();
        if value.is_empty() {
            return Vec::new();
        }
        if let Ok(Value::Array(entries)) = serde_json::from_str::<Value>(value) {
            return entries
                .iter()
                .map(item_to_string)
                .filter(|entry| !entry.is_empty())
                .collect();
        }
        let separator = if value.contains('\n') { '\n' } else { ',' };
        value
            .split(separator)
            .map(|entry| entry.trim().to_string())
            .filter(|entry| !entry.is_empty())
            .collect()
    }
}

fn item_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn string_field(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn list_field(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(entries)) => entries
            .iter()
            .map(item_to_string)
            .filter(|entry| !entry.is_empty())
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(|entry| entry.trim().to_string())
            .filter(|entry| !entry.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn numeric_field(value: Option<&Value>, fallback: u32) -> u32 {
    match value {
        Some(Value::Number(n)) => n.as_u64().map(|v| v as u32).unwrap_or(fallback),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(fallback),
        _ => fallback,
    }
}

fn bool_field(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.trim() == "true",
        _ => false,
    }
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

//! Run context - per-run variable store, depth, and sandbox counters

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Run-scoped key/value environment read and written via templates.
///
/// Exclusively owned and mutated by the executor on behalf of the run
/// (setVar, form, loop bindings, recall injection, error capture,
/// output-variable mapping of provider results).
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    values: HashMap<String, String>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store from an iterator of pairs (child-run inputs)
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Run-scoped quota counters, shared with nested sub-runs of the same
/// top-level run and reset when a new top-level run starts.
#[derive(Debug, Default)]
pub struct SandboxCounters {
    network_ops: AtomicU32,
    file_writes: AtomicU32,
}

impl SandboxCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the network-op counter, returning the new total
    pub fn record_network_op(&self) -> u32 {
        self.network_ops.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Increment the file-write counter, returning the new total
    pub fn record_file_write(&self) -> u32 {
        self.file_writes.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn network_ops(&self) -> u32 {
        self.network_ops.load(Ordering::SeqCst)
    }

    pub fn file_writes(&self) -> u32 {
        self.file_writes.load(Ordering::SeqCst)
    }
}

/// Per-execution bundle threaded through nested sub-pipeline and loop
/// invocations.
#[derive(Debug)]
pub struct RunContext {
    /// Unique run id, also the cancellation key
    pub run_id: String,

    /// Trace id for correlating provider calls and logs
    pub trace_id: String,

    /// Current working directory for terminal-bound intents
    pub cwd: String,

    /// Nesting depth; bounded by the configured maximum so recursion
    /// limits are enforceable independent of call-stack behavior
    pub depth: u32,

    /// Run-scoped variables
    pub variables: VariableStore,

    /// Interactive-input cache keyed by prompt text; each prompt is
    /// collected at most once per run
    pub input_cache: HashMap<String, String>,

    /// Quota counters shared across the whole nested run tree
    pub sandbox: Arc<SandboxCounters>,
}

impl RunContext {
    /// Create a fresh top-level run context
    pub fn new(cwd: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4().simple().to_string(),
            trace_id: Uuid::new_v4().simple().to_string(),
            cwd: cwd.into(),
            depth: 0,
            variables: VariableStore::new(),
            input_cache: HashMap::new(),
            sandbox: Arc::new(SandboxCounters::new()),
        }
    }

    /// Derive a child context for a nested run: fresh run id and
    /// variables, incremented depth, shared sandbox counters.
    pub fn child(&self, variables: VariableStore) -> Self {
        Self {
            run_id: Uuid::new_v4().simple().to_string(),
            trace_id: Uuid::new_v4().simple().to_string(),
            cwd: self.cwd.clone(),
            depth: self.depth + 1,
            variables,
            input_cache: HashMap::new(),
            sandbox: Arc::clone(&self.sandbox),
        }
    }
}

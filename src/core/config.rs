//! Runtime configuration snapshot
//!
//! The host hands the engine a read-only JSON document; the engine
//! reads it through dotted paths (e.g. `runtime.sandbox.allowNetwork`)
//! resolved once per step. Defaults live here, not in callers.

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;

/// Read-only configuration snapshot keyed by dotted paths
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    root: Value,
}

/// Loop runtime guards, independent of any single loop's own settings
#[derive(Debug, Clone, Copy)]
pub struct LoopLimits {
    pub enabled: bool,
    pub max_total_ops: u32,
    pub max_duration_ms: u64,
}

/// Run-memory store limits
#[derive(Debug, Clone, Copy)]
pub struct MemoryLimits {
    pub enabled: bool,
    pub ttl_days: u32,
    pub max_records_per_session: usize,
    pub max_payload_chars: usize,
}

impl RuntimeConfig {
    pub fn new(root: Value) -> Self {
        Self { root }
    }

    /// Load a configuration snapshot from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config: {}", path.as_ref().display()))?;
        let root = serde_json::from_str(&content).context("Invalid config JSON")?;
        Ok(Self { root })
    }

    /// Look up a value by dotted path
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut node = &self.root;
        for segment in path.split('.') {
            node = node.get(segment)?;
        }
        Some(node)
    }

    pub fn get_bool(&self, path: &str, default: bool) -> bool {
        self.lookup(path).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn get_u64(&self, path: &str, default: u64) -> u64 {
        match self.lookup(path) {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    pub fn get_str(&self, path: &str, default: &str) -> String {
        self.lookup(path)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    }

    pub fn get_string_list(&self, path: &str) -> Vec<String> {
        match self.lookup(path) {
            Some(Value::Array(entries)) => entries
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Maximum nesting depth for sub-pipeline and loop child runs
    pub fn max_sub_pipeline_depth(&self) -> u32 {
        self.get_u64("runtime.subPipeline.maxDepth", 4).max(1) as u32
    }

    pub fn loop_limits(&self) -> LoopLimits {
        LoopLimits {
            enabled: self.get_bool("runtime.loop.enabled", true),
            max_total_ops: self.get_u64("runtime.loop.maxTotalOps", 500).max(1) as u32,
            max_duration_ms: self.get_u64("runtime.loop.maxDurationMs", 900_000).max(1_000),
        }
    }

    pub fn memory_limits(&self) -> MemoryLimits {
        MemoryLimits {
            enabled: self.get_bool("memory.enabled", true),
            ttl_days: self.get_u64("memory.ttlDays", 30).max(1) as u32,
            max_records_per_session: self.get_u64("memory.maxRecordsPerSession", 200).max(1)
                as usize,
            max_payload_chars: self.get_u64("memory.maxPayloadChars", 120_000).max(32) as usize,
        }
    }
}

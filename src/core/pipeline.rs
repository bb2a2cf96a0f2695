//! Pipeline domain model - a named, ordered list of intent steps

use crate::core::step::Step;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;

/// A pipeline definition as loaded from a `.intent.json` file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineFile {
    /// Pipeline name
    #[serde(default)]
    pub name: String,

    /// Ordered steps; default sequencing is array order
    pub steps: Vec<Step>,

    /// Opaque editor/host metadata, carried but never interpreted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl PipelineFile {
    /// Parse a pipeline from JSON text.
    ///
    /// This is the only place ordinary input problems surface as
    /// errors: a document without a `steps` array fails here,
    /// synchronously, before any run starts.
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(text).context("Invalid pipeline JSON")?;
        if raw.get("steps").map(Value::is_array) != Some(true) {
            bail!("Invalid pipeline: expected a \"steps\" array");
        }
        let pipeline: PipelineFile =
            serde_json::from_value(raw).context("Invalid pipeline structure")?;
        pipeline.validate()?;
        Ok(pipeline)
    }

    /// Load a pipeline from a file on disk
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read pipeline: {}", path.as_ref().display()))?;
        Self::from_json(&content)
    }

    /// Validate structural invariants: unique, non-empty step ids
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                bail!("Pipeline step with empty id (intent: {})", step.intent);
            }
            if !seen.insert(&step.id) {
                bail!("Duplicate step ID: {}", step.id);
            }
        }
        Ok(())
    }

    /// Find the array index of a step by id
    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    /// Get a step by id
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

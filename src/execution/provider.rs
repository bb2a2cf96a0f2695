//! Provider seam - capability registry and the async handler contract
//!
//! The engine is agnostic to the side effect a provider performs; it
//! only sees resolve/reject. Unknown capabilities fail with a specific
//! error rather than a silent no-op.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Call metadata handed to every provider invocation
#[derive(Debug, Clone)]
pub struct ProviderMeta {
    pub run_id: String,
    pub trace_id: String,
    pub step_id: String,
    pub dry_run: bool,
}

/// Result of a provider call
#[derive(Debug, Clone, Default)]
pub struct ProviderResult {
    /// Textual/JSON output, captured into an output variable when the
    /// step names one
    pub content: Option<String>,
}

impl ProviderResult {
    pub fn with_content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{0}")]
    Failed(String),
}

/// Async capability handler
#[async_trait]
pub trait Provider: Send + Sync {
    async fn invoke(
        &self,
        capability: &str,
        payload: &Value,
        meta: &ProviderMeta,
    ) -> Result<ProviderResult, ProviderError>;
}

/// Registry mapping capability strings to providers
#[derive(Default)]
pub struct ProviderRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider for a capability, replacing any previous one
    pub fn register(&self, capability: impl Into<String>, provider: Arc<dyn Provider>) {
        self.handlers
            .write()
            .expect("provider registry poisoned")
            .insert(capability.into(), provider);
    }

    pub fn resolve(&self, capability: &str) -> Option<Arc<dyn Provider>> {
        self.handlers
            .read()
            .expect("provider registry poisoned")
            .get(capability)
            .cloned()
    }

    pub fn capabilities(&self) -> Vec<String> {
        let mut caps: Vec<String> = self
            .handlers
            .read()
            .expect("provider registry poisoned")
            .keys()
            .cloned()
            .collect();
        caps.sort();
        caps
    }
}

//! Sandbox policy gate
//!
//! Validates a compiled step against configured quotas and allowlists
//! before it is dispatched. Network and file-write detection is
//! heuristic keyword matching on the command text, not shell parsing;
//! that is intentional and should stay that way.

use crate::core::{CompiledStep, RuntimeConfig, SandboxCounters};
use serde_json::Value;
use thiserror::Error;

/// Sandbox rules applied to every dispatched step
#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    pub allow_network: bool,
    pub allow_file_write: bool,
    /// Empty list means "no restriction"
    pub allowed_intents: Vec<String>,
    pub timeout_ms: u64,
    pub max_command_chars: usize,
    pub max_network_ops: u32,
    pub max_file_writes: u32,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            allow_network: true,
            allow_file_write: true,
            allowed_intents: Vec::new(),
            timeout_ms: 120_000,
            max_command_chars: 12_000,
            max_network_ops: 40,
            max_file_writes: 40,
        }
    }
}

impl SandboxPolicy {
    /// Build the policy from the host's configuration snapshot
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let defaults = SandboxPolicy::default();
        Self {
            allow_network: config.get_bool("runtime.sandbox.allowNetwork", defaults.allow_network),
            allow_file_write: config
                .get_bool("runtime.sandbox.allowFileWrite", defaults.allow_file_write),
            allowed_intents: config.get_string_list("runtime.sandbox.allowedIntents"),
            timeout_ms: config.get_u64("runtime.sandbox.timeoutMs", defaults.timeout_ms),
            max_command_chars: config
                .get_u64("runtime.sandbox.maxCommandChars", defaults.max_command_chars as u64)
                as usize,
            max_network_ops: config
                .get_u64("runtime.sandbox.maxNetworkOps", defaults.max_network_ops as u64)
                as u32,
            max_file_writes: config
                .get_u64("runtime.sandbox.maxFileWrites", defaults.max_file_writes as u64)
                as u32,
        }
    }
}

/// A sandbox rule breach; handled identically to a provider failure
#[derive(Debug, Error)]
pub enum PolicyViolation {
    #[error("intent '{0}' is not in the sandbox allowlist")]
    IntentNotAllowed(String),

    #[error("intent '{0}' requires network access (allowNetwork=false)")]
    NetworkBlocked(String),

    #[error("intent '{0}' writes files (allowFileWrite=false)")]
    FileWriteBlocked(String),

    #[error("command length {length} exceeds maxCommandChars {limit}")]
    CommandTooLong { length: usize, limit: usize },

    #[error("network operation quota exhausted (maxNetworkOps={0})")]
    NetworkQuotaExceeded(u32),

    #[error("file write quota exhausted (maxFileWrites={0})")]
    FileWriteQuotaExceeded(u32),
}

const NETWORK_INTENTS: &[&str] = &["http.", "github.", "ai."];

const NETWORK_KEYWORDS: &[&str] = &[
    "curl ",
    "wget ",
    "git pull",
    "git push",
    "git fetch",
    "git clone",
    "npm install",
    "npm ci",
    "pip install",
    "docker pull",
    "docker push",
    "ssh ",
    "scp ",
    "rsync ",
];

const FILE_WRITE_INTENTS: &[&str] = &["vscode.applyPatch", "vscode.reviewDiff", "vscode.writeFile"];

const FILE_WRITE_KEYWORDS: &[&str] = &[
    ">", "rm ", "mv ", "cp ", "mkdir ", "touch ", "tee ", "sed -i", "truncate ",
];

fn command_text(step: &CompiledStep) -> &str {
    step.payload
        .get("command")
        .and_then(Value::as_str)
        .unwrap_or("")
}

/// Heuristic: does this step reach the network?
pub fn detect_intent_uses_network(step: &CompiledStep) -> bool {
    if NETWORK_INTENTS
        .iter()
        .any(|prefix| step.intent.starts_with(prefix))
    {
        return true;
    }
    if step.intent == "terminal.run" {
        let command = command_text(step);
        return NETWORK_KEYWORDS.iter().any(|kw| command.contains(kw));
    }
    false
}

/// Heuristic: does this step mutate files?
pub fn detect_intent_writes_files(step: &CompiledStep) -> bool {
    if FILE_WRITE_INTENTS.contains(&step.intent.as_str()) {
        return true;
    }
    if step.intent == "terminal.run" {
        let command = command_text(step);
        return FILE_WRITE_KEYWORDS.iter().any(|kw| command.contains(kw));
    }
    false
}

/// Validate a compiled step against the policy, recording quota usage
/// on the run's counters.
///
/// Checks run in a fixed order: allowlist, network, file-write,
/// command length, quotas.
pub fn validate_step(
    step: &CompiledStep,
    policy: &SandboxPolicy,
    counters: &SandboxCounters,
) -> Result<(), PolicyViolation> {
    if !policy.allowed_intents.is_empty()
        && !policy.allowed_intents.iter().any(|i| i == &step.intent)
    {
        return Err(PolicyViolation::IntentNotAllowed(step.intent.clone()));
    }

    let uses_network = detect_intent_uses_network(step);
    if uses_network && !policy.allow_network {
        return Err(PolicyViolation::NetworkBlocked(step.intent.clone()));
    }

    let writes_files = detect_intent_writes_files(step);
    if writes_files && !policy.allow_file_write {
        return Err(PolicyViolation::FileWriteBlocked(step.intent.clone()));
    }

    let command = command_text(step);
    if command.len() > policy.max_command_chars {
        return Err(PolicyViolation::CommandTooLong {
            length: command.len(),
            limit: policy.max_command_chars,
        });
    }

    if uses_network && counters.record_network_op() > policy.max_network_ops {
        return Err(PolicyViolation::NetworkQuotaExceeded(policy.max_network_ops));
    }
    if writes_files && counters.record_file_write() > policy.max_file_writes {
        return Err(PolicyViolation::FileWriteQuotaExceeded(policy.max_file_writes));
    }

    Ok(())
}

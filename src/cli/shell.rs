//! Host plumbing for the CLI: a minimal shell provider for
//! `terminal.run` and a console-backed input collector.

use crate::compile::InputCollector;
use crate::execution::{Provider, ProviderError, ProviderMeta, ProviderResult};
use async_trait::async_trait;
use console::Term;
use serde_json::Value;
use tracing::debug;

/// Runs `terminal.run` payloads through the system shell
pub struct ShellProvider;

#[async_trait]
impl Provider for ShellProvider {
    async fn invoke(
        &self,
        _capability: &str,
        payload: &Value,
        meta: &ProviderMeta,
    ) -> Result<ProviderResult, ProviderError> {
        let command = payload
            .get("command")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ProviderError::Failed("terminal.run requires \"command\"".to_string()))?;
        let cwd = payload.get("cwd").and_then(Value::as_str).unwrap_or(".");
        debug!(run_id = %meta.run_id, step_id = %meta.step_id, command, "running shell command");

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .output()
            .await
            .map_err(|e| ProviderError::Failed(format!("failed to spawn shell: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::Failed(format!(
                "command exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(ProviderResult::with_content(
            String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
        ))
    }
}

/// Collects `${input:...}` values by prompting on the terminal
pub struct TerminalCollector {
    term: Term,
}

impl TerminalCollector {
    pub fn new() -> Self {
        Self {
            term: Term::stdout(),
        }
    }
}

impl Default for TerminalCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl InputCollector for TerminalCollector {
    fn collect(&self, prompt: &str) -> Option<String> {
        if !self.term.is_term() {
            return None;
        }
        let _ = self.term.write_str(&format!("{prompt}: "));
        match self.term.read_line() {
            Ok(line) if !line.trim().is_empty() => Some(line.trim().to_string()),
            _ => None,
        }
    }
}

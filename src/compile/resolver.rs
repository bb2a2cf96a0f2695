//! Variable resolution and shell-argument sanitization
//!
//! Two template forms are recognized: `${var:NAME}` reads the run's
//! variable store, `${input:PROMPT}` reads the interactive-input cache
//! (collecting through the [`InputCollector`] seam on first use).
//! Missing variables resolve to empty string - required-ness is the
//! caller's concern.

use crate::core::VariableStore;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::debug;

use super::CompileError;

/// Seam for interactive input collection. The engine calls this at
/// most once per distinct prompt per run.
pub trait InputCollector: Send + Sync {
    /// Collect a value for the prompt; `None` means the user provided
    /// nothing and the template resolves to empty string.
    fn collect(&self, prompt: &str) -> Option<String>;
}

/// Collector that never produces input; every `${input:...}` resolves
/// to empty string.
pub struct NoInput;

impl InputCollector for NoInput {
    fn collect(&self, _prompt: &str) -> Option<String> {
        None
    }
}

fn template_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{(var|input):([^}]+)\}").expect("template regex"))
}

/// Wrap a value in double quotes with `\`, `"`, `$`, and backtick
/// backslash-escaped, turning it into a single inert shell token
/// regardless of content.
pub fn sanitize_shell_arg(arg: &str) -> String {
    let mut escaped = String::with_capacity(arg.len() + 2);
    escaped.push('"');
    for ch in arg.chars() {
        if matches!(ch, '\\' | '"' | '$' | '`') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('"');
    escaped
}

/// Reject arguments outside the strict allowlist
/// (alphanumeric, `-`, `_`, `.`, `/`, `:`, `@`).
pub fn validate_strict_shell_arg(arg: &str, context: &str) -> Result<(), CompileError> {
    if arg.is_empty() {
        return Ok(());
    }
    let ok = arg
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@'));
    if ok {
        Ok(())
    } else {
        Err(CompileError::InvalidArgument {
            context: context.to_string(),
            value: arg.to_string(),
        })
    }
}

/// Resolves template expressions against one run's variable store and
/// input cache.
pub struct Resolver<'a> {
    store: &'a VariableStore,
    input_cache: &'a mut HashMap<String, String>,
    collector: &'a dyn InputCollector,
}

impl<'a> Resolver<'a> {
    pub fn new(
        store: &'a VariableStore,
        input_cache: &'a mut HashMap<String, String>,
        collector: &'a dyn InputCollector,
    ) -> Self {
        Self {
            store,
            input_cache,
            collector,
        }
    }

    /// Resolve all templates in `text`. With `sanitize` set (required
    /// for any value flowing into a shell command) each substituted
    /// value becomes one shell-safe token.
    pub fn resolve(&mut self, text: &str, sanitize: bool) -> String {
        template_regex()
            .replace_all(text, |caps: &Captures| {
                let kind = &caps[1];
                let name = caps[2].trim().to_string();
                let value = match kind {
                    "var" => match self.store.get(&name) {
                        Some(v) => v.to_string(),
                        None => {
                            debug!(variable = %name, "unresolved variable, substituting empty");
                            String::new()
                        }
                    },
                    _ => self.resolve_input(&name),
                };
                if sanitize {
                    sanitize_shell_arg(&value)
                } else {
                    value
                }
            })
            .into_owned()
    }

    /// Recursively resolve every string in a JSON payload
    pub fn resolve_value(&mut self, value: &serde_json::Value, sanitize: bool) -> serde_json::Value {
        use serde_json::Value;
        match value {
            Value::String(s) => Value::String(self.resolve(s, sanitize)),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.resolve_value(item, sanitize))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v, sanitize)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn resolve_input(&mut self, prompt: &str) -> String {
        if let Some(cached) = self.input_cache.get(prompt) {
            return cached.clone();
        }
        let value = self.collector.collect(prompt).unwrap_or_default();
        self.input_cache.insert(prompt.to_string(), value.clone());
        value
    }
}

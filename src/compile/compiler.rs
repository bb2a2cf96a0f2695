//! Step compiler
//!
//! Resolves every string payload field, then restructures a closed set
//! of git/docker intents into `terminal.run` steps with a built shell
//! command. Everything else passes through structurally unchanged.
//! The compiler is pure: no I/O, no side effects.

use crate::compile::resolver::{sanitize_shell_arg, validate_strict_shell_arg, Resolver};
use crate::compile::CompileError;
use crate::core::{CompiledStep, Step};
use serde_json::{json, Value};

/// Compile a step against the run's variable environment.
///
/// `cwd` becomes the working directory of any translated terminal
/// command.
pub fn compile_step(
    step: &Step,
    resolver: &mut Resolver<'_>,
    cwd: &str,
) -> Result<CompiledStep, CompileError> {
    // Values flowing into a shell command must arrive as inert tokens.
    let sanitize = step.intent == "terminal.run";
    let payload = resolver.resolve_value(&step.payload, sanitize);

    if !step.intent.starts_with("git.") && !step.intent.starts_with("docker.") {
        return Ok(CompiledStep {
            intent: step.intent.clone(),
            capabilities: vec![step.intent.clone()],
            payload,
            description: step.description.clone(),
        });
    }

    let command = match step.intent.as_str() {
        "git.checkout" => {
            let branch = required_str(&payload, "branch", "git.checkout")?;
            validate_strict_shell_arg(branch, "branch")?;
            let create = payload.get("create").and_then(Value::as_bool).unwrap_or(false);
            if create {
                format!("git checkout -b {branch}")
            } else {
                format!("git checkout {branch}")
            }
        }
        "git.commit" => {
            let message = required_str(&payload, "message", "git.commit")?;
            let amend = payload.get("amend").and_then(Value::as_bool).unwrap_or(false);
            let safe = sanitize_shell_arg(message);
            if amend {
                format!("git commit --amend -m {safe}")
            } else {
                format!("git commit -m {safe}")
            }
        }
        "git.pull" => "git pull".to_string(),
        "git.push" => "git push".to_string(),
        "git.clone" => {
            let url = required_str(&payload, "url", "git.clone")?;
            let safe_url = sanitize_shell_arg(url);
            match payload.get("dir").and_then(Value::as_str).filter(|d| !d.is_empty()) {
                Some(dir) => {
                    validate_strict_shell_arg(dir, "dir")?;
                    format!("git clone {safe_url} {dir}")
                }
                None => format!("git clone {safe_url}"),
            }
        }
        "docker.build" => {
            let tag = required_str(&payload, "tag", "docker.build")?;
            let path = payload.get("path").and_then(Value::as_str).unwrap_or(".");
            validate_strict_shell_arg(tag, "tag")?;
            validate_strict_shell_arg(path, "path")?;
            format!("docker build -t {tag} {path}")
        }
        "docker.run" => {
            let image = required_str(&payload, "image", "docker.run")?;
            validate_strict_shell_arg(image, "image")?;
            let detach = payload.get("detach").and_then(Value::as_bool).unwrap_or(false);
            if detach {
                format!("docker run -d {image}")
            } else {
                format!("docker run {image}")
            }
        }
        // Unlisted git/docker intents are not compile targets.
        _ => {
            return Ok(CompiledStep {
                intent: step.intent.clone(),
                capabilities: vec![step.intent.clone()],
                payload,
                description: step.description.clone(),
            });
        }
    };

    Ok(CompiledStep {
        intent: "terminal.run".to_string(),
        capabilities: vec!["terminal.run".to_string()],
        payload: json!({ "command": command, "cwd": cwd }),
        description: step
            .description
            .clone()
            .or_else(|| Some(format!("Compiled: {command}"))),
    })
}

fn required_str<'v>(
    payload: &'v Value,
    field: &'static str,
    intent: &'static str,
) -> Result<&'v str, CompileError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(CompileError::MissingField { intent, field })
}

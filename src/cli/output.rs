//! CLI output formatting

use crate::execution::{LogStream, PipelineEvent, RunStatus};
use console::Emoji;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Format a run status for display
pub fn format_status(status: RunStatus) -> String {
    match status {
        RunStatus::Success => style("SUCCESS").green().to_string(),
        RunStatus::Failure => style("FAILURE").red().to_string(),
        RunStatus::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

/// Format a pipeline event for console display. Returns `None` for
/// events the console does not surface.
pub fn format_event(event: &PipelineEvent) -> Option<String> {
    match event {
        PipelineEvent::PipelineStart { run_id, name, total_steps } => Some(format!(
            "{} Starting pipeline {} ({} steps, {})",
            ROCKET,
            style(name).bold(),
            total_steps,
            style(short_id(run_id)).dim()
        )),
        PipelineEvent::PipelineEnd { run_id, status, .. } => Some(format!(
            "{} Pipeline ({}) finished: {}",
            INFO,
            style(short_id(run_id)).dim(),
            format_status(*status)
        )),
        PipelineEvent::PipelinePause { run_id } => {
            Some(format!("{} Pipeline ({}) paused", WARN, style(short_id(run_id)).dim()))
        }
        PipelineEvent::PipelineResume { run_id } => {
            Some(format!("{} Pipeline ({}) resumed", INFO, style(short_id(run_id)).dim()))
        }
        PipelineEvent::StepStart { step_id, intent_id, description, .. } => {
            let suffix = description
                .as_deref()
                .map(|d| format!(" - {}", style(d).dim()))
                .unwrap_or_default();
            Some(format!(
                "{} {} [{}]{}",
                SPINNER,
                style(step_id).cyan(),
                style(intent_id).dim(),
                suffix
            ))
        }
        PipelineEvent::StepEnd { step_id, success, .. } => Some(if *success {
            format!("{} {}", CHECK, style(step_id).green())
        } else {
            format!("{} {}", CROSS, style(step_id).red())
        }),
        PipelineEvent::StepLog { step_id, text, stream, .. } => Some(match stream {
            LogStream::Stdout => format!("  {} | {}", style(step_id).dim(), text),
            LogStream::Stderr => format!("  {} | {}", style(step_id).dim(), style(text).red()),
        }),
        PipelineEvent::ApprovalReviewReady { step_id, message, .. } => Some(format!(
            "{} Approval needed at {}: {}",
            WARN,
            style(step_id).cyan(),
            message
        )),
        PipelineEvent::GithubPullRequestCreated { url, .. } => {
            Some(format!("{} Pull request created: {}", ROCKET, style(url).cyan()))
        }
        PipelineEvent::PipelineDecision { .. } => None,
    }
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(8)]
}

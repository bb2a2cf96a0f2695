//! CLI command definitions

use clap::{Args, Subcommand};

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to a pipeline JSON file
    #[arg(short, long)]
    pub file: String,

    /// Skip provider side effects; control flow still executes
    #[arg(long)]
    pub dry_run: bool,

    /// Start at this step instead of the first one
    #[arg(long)]
    pub start_step: Option<String>,

    /// Variable overrides (key=value)
    #[arg(long = "var", value_parser = parse_key_value)]
    pub variable: Vec<(String, String)>,

    /// Working directory for terminal-bound intents
    #[arg(long)]
    pub cwd: Option<String>,

    /// Memory session for this run
    #[arg(long)]
    pub session: Option<String>,

    /// Approve every approval step without prompting
    #[arg(short = 'y', long)]
    pub yes: bool,
}

/// Validate a pipeline file
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to a pipeline JSON file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Inspect or clear run memory
#[derive(Debug, Args, Clone)]
pub struct MemoryCommand {
    #[command(subcommand)]
    pub action: MemoryAction,
}

#[derive(Debug, Subcommand, Clone)]
pub enum MemoryAction {
    /// List stored memory records
    List {
        /// Memory session to list
        #[arg(long)]
        session: Option<String>,

        /// Filter by key
        #[arg(long)]
        key: Option<String>,

        /// Number of records to show
        #[arg(short, long, default_value_t = 10)]
        limit: usize,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Clear stored memory records
    Clear {
        /// Memory session to clear
        #[arg(long)]
        session: Option<String>,

        /// Filter by key
        #[arg(long)]
        key: Option<String>,

        /// Keep the newest N matching records
        #[arg(long, default_value_t = 0)]
        keep_last: usize,
    },
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, '=').collect();
    if parts.len() != 2 {
        return Err(format!("Invalid key=value pair: {}", s));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}

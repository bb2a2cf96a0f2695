//! Command-line interface

pub mod commands;
pub mod output;
pub mod shell;

use clap::{Parser, Subcommand};
use commands::{MemoryCommand, RunCommand, ValidateCommand};

/// Declarative intent-pipeline runner
#[derive(Debug, Parser, Clone)]
#[command(name = "intentflow")]
#[command(version = "0.1.0")]
#[command(about = "Run declarative JSON intent pipelines", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to a runtime configuration JSON file
    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a pipeline file
    Run(RunCommand),

    /// Validate a pipeline file without running it
    Validate(ValidateCommand),

    /// Inspect or clear the run-memory store
    Memory(MemoryCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}

use std::ffi::OsString;

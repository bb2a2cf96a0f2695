//! Intent compilation: variable resolution plus translation of
//! high-level git/docker intents into dispatch-ready terminal commands

pub mod compiler;
pub mod resolver;

pub use compiler::compile_step;
pub use resolver::{sanitize_shell_arg, validate_strict_shell_arg, InputCollector, NoInput, Resolver};

use thiserror::Error;

/// Errors produced while compiling a step. The executor treats these
/// the same way as any other step failure.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{intent} requires \"{field}\"")]
    MissingField { intent: &'static str, field: &'static str },

    #[error("Invalid characters in {context}: {value}")]
    InvalidArgument { context: String, value: String },
}

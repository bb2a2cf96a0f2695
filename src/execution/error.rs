//! Step failure taxonomy
//!
//! Every variant is a "step failure" to the executor: retry,
//! continue-on-error, and on-failure routing apply uniformly.

use crate::compile::CompileError;
use crate::sandbox::PolicyViolation;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepError {
    #[error("compilation failed: {0}")]
    Compilation(#[from] CompileError),

    #[error("sandbox policy violation: {0}")]
    Policy(#[from] PolicyViolation),

    #[error("no provider registered for capability '{0}'")]
    UnknownCapability(String),

    #[error("provider failed: {0}")]
    Provider(String),

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("sub-pipeline depth {depth} reached the configured maximum ({max})")]
    DepthExceeded { depth: u32, max: u32 },

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("{0}")]
    Invalid(String),
}

//! intentflow - a declarative JSON intent-pipeline engine
//!
//! Pipelines are ordered lists of intent steps. Each step is compiled
//! (variables resolved, high-level intents translated into shell
//! commands), gated by a sandbox policy, and dispatched to a
//! registered provider. Control intents (`system.*`, `memory.*`) give
//! pipelines branching, loops, sub-pipelines, approvals, and durable
//! memory without any scripting language.

pub mod cli;
pub mod compile;
pub mod core;
pub mod execution;
pub mod memory;
pub mod sandbox;

// Re-export commonly used types
pub use compile::{compile_step, InputCollector, NoInput, Resolver};
pub use crate::core::{PipelineFile, RunContext, RuntimeConfig, Step, VariableStore};
pub use execution::{
    Engine, EngineContext, EventBus, PipelineEvent, ProviderRegistry, RunOptions, RunOutcome,
    RunStatus, StepError,
};
pub use memory::RunMemoryStore;
pub use sandbox::SandboxPolicy;

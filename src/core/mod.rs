//! Core domain models for intent pipelines

pub mod config;
pub mod context;
pub mod pipeline;
pub mod step;

pub use config::{LoopLimits, MemoryLimits, RuntimeConfig};
pub use context::{RunContext, SandboxCounters, VariableStore};
pub use pipeline::PipelineFile;
pub use step::{
    CompiledStep, LoopConfig, LoopErrorStrategy, LoopExecutionMode, RetryMode, RetryPolicy,
    RouteCondition, Step, SwitchRoute,
};

//! Pipeline execution: engine, events, providers, step errors

mod error;
mod events;
mod executor;
mod provider;

pub use error::StepError;
pub use events::{EventBus, LogStream, PipelineEvent, RunStatus, Subscription};
pub use executor::{Engine, EngineContext, RunOptions, RunOutcome};
pub use provider::{Provider, ProviderError, ProviderMeta, ProviderRegistry, ProviderResult};

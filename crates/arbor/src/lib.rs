//! Agent-orchestration runtime where deterministic code and LLM-driven
//! agents are uniformly modeled as functions.
//!
//! This crate re-exports the contract types, the runtime, and the
//! Anthropic provider, and adds convenience wiring plus a console tree
//! renderer. Most consumers only need [`prelude`].

pub mod viz;

pub use arbor_anthropic::{AnthropicConfig, AnthropicFactory};
pub use arbor_contract::{
    ArgError, ArgMap, ArgType, ArgValue, CachePolicy, Fault, FuncError, FunctionArg, FunctionKind,
    NodeState, NodeView, Provider, ProviderError, SessionFactory, TokenUsage, TranscriptPart,
};
pub use arbor_runtime::{
    raise_exception, AgentFunction, CodeFunction, ContextError, Function, InvokeError, Node,
    NodeLookupError, RegistryError, RunContext, Runtime, RuntimeBuilder, SessionError,
    SessionScope,
};

use std::sync::Arc;
use thiserror::Error;

/// Failures while assembling a ready-to-use runtime.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Build a runtime over the given specs with the Anthropic provider wired
/// from the environment (`ANTHROPIC_API_KEY`).
pub fn runtime_with_anthropic(
    specs: impl IntoIterator<Item = Arc<Function>>,
) -> Result<Runtime, SetupError> {
    let factory = AnthropicFactory::from_env()?;
    Ok(Runtime::builder()
        .with_specs(specs)
        .with_session_factory(Provider::Anthropic, Arc::new(factory))
        .build()?)
}

/// The commonly used surface in one import.
pub mod prelude {
    pub use crate::viz::ConsoleRender;
    pub use arbor_contract::{
        ArgMap, ArgType, ArgValue, Fault, FuncError, FunctionArg, NodeState, Provider,
    };
    pub use arbor_runtime::{
        raise_exception, AgentFunction, CodeFunction, Function, Node, RunContext, Runtime,
        SessionScope,
    };
}

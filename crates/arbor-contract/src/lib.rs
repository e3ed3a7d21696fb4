//! Shared contracts for the arbor invocation runtime: the argument model,
//! provider-neutral transcripts, token accounting, the fault taxonomy, the
//! provider session seam, and immutable node views.

pub mod args;
pub mod fault;
pub mod provider;
pub mod testing;
pub mod transcript;
pub mod usage;
pub mod view;

pub use args::{
    coerce_json_args, validate_coerce_args, ArgError, ArgMap, ArgType, ArgValue, FunctionArg,
    SpecError,
};
pub use fault::{Fault, FuncError};
pub use provider::{
    CachePolicy, ModelTurn, Provider, ProviderError, ProviderSession, SessionFactory,
    SessionRequest, ToolDecl, ToolRecord, ToolUseRequest,
};
pub use transcript::TranscriptPart;
pub use usage::TokenUsage;
pub use view::{FunctionKind, NodeState, NodeView};

//! Fault taxonomy.
//!
//! Two fault kinds matter to consumers of an agent tree: an *agent* fault
//! (the model itself declared the task failed via the raise-exception
//! built-in) and a *provider* fault (SDK, auth, rate limit, socket, or
//! framework failure inside the loop). Code invocations additionally
//! surface their own domain errors unchanged in meaning.

use crate::provider::Provider;
use thiserror::Error;

/// Terminal error stored on a failed invocation and rethrown by
/// `Node::result()`.
#[derive(Debug, Clone, Error)]
pub enum Fault {
    /// The model invoked the raise-exception built-in: a task-level failure
    /// decided by the agent itself.
    #[error("agent '{agent}' (node {node_id}) raised: {message}")]
    Agent {
        agent: String,
        node_id: u64,
        message: String,
    },

    /// Anything else escaping an agent loop: SDK malfunction, auth, rate
    /// limit, socket, or a framework bug during invoke.
    #[error("{provider} provider failure in agent '{agent}' (node {node_id}): {message}")]
    Provider {
        provider: Provider,
        agent: String,
        node_id: u64,
        message: String,
    },

    /// A domain error raised by a code callable.
    #[error("{kind}: {message}")]
    Code { kind: String, message: String },
}

impl Fault {
    /// Concise `Kind: message` rendering for LLM-facing tool results and
    /// view summaries. No stacktraces, no inner chains.
    pub fn concise(&self) -> String {
        match self {
            Fault::Agent { message, .. } => format!("AgentFault: {message}"),
            Fault::Provider { message, .. } => format!("ProviderFault: {message}"),
            Fault::Code { kind, message } => format!("{kind}: {message}"),
        }
    }
}

/// Errors a code callable may return. Converted to [`Fault`] by the node
/// runner with the raising node's identity attached.
#[derive(Debug, Error)]
pub enum FuncError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Emitted by the raise-exception built-in; mapped to an agent fault.
    #[error("{0}")]
    Raised(String),
}

impl FuncError {
    /// The fault kind name used in concise renderings.
    pub fn kind(&self) -> &'static str {
        match self {
            FuncError::InvalidArgument(_) => "InvalidArgument",
            FuncError::Failed(_) => "Failed",
            FuncError::Io(_) => "Io",
            FuncError::Raised(_) => "AgentRaise",
        }
    }

    /// Convert into a terminal fault for the node that raised it.
    pub fn into_fault(self, func_name: &str, node_id: u64) -> Fault {
        match self {
            FuncError::Raised(message) => Fault::Agent {
                agent: func_name.to_string(),
                node_id,
                message,
            },
            other => Fault::Code {
                kind: other.kind().to_string(),
                message: other.to_string(),
            },
        }
    }
}

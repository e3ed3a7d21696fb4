//! Execution core of an agent-orchestration framework in which
//! deterministic code and LLM-driven agents are uniformly modeled as
//! functions.
//!
//! Consumers declare function specs, build a [`Runtime`] (which registers
//! the transitive closure of every spec's `uses` list), obtain a
//! [`RunContext`], and invoke. Code bodies start immediately; agent loops
//! run on background tasks gated by a per-provider model-api semaphore.
//! Every invocation is a node in a tree observable through immutable,
//! versioned snapshots with a blocking watch primitive.
//!
//! ```no_run
//! use arbor_runtime::{CodeFunction, Runtime};
//! use arbor_contract::{ArgType, ArgValue, FunctionArg};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let add = CodeFunction::new(
//!     "add",
//!     "Add two integers.",
//!     vec![
//!         FunctionArg::new("a", ArgType::Int, "left operand"),
//!         FunctionArg::new("b", ArgType::Int, "right operand"),
//!     ],
//!     |_ctx, args| {
//!         Box::pin(async move {
//!             let a = args["a"].as_int().unwrap_or(0);
//!             let b = args["b"].as_int().unwrap_or(0);
//!             Ok(json!(a + b))
//!         })
//!     },
//! )?
//! .build();
//!
//! let runtime = Runtime::new(vec![add.clone()])?;
//! let node = runtime.get_ctx().invoke(
//!     &add,
//!     [("a".into(), ArgValue::Int(2)), ("b".into(), ArgValue::Int(3))].into(),
//!     None,
//! )?;
//! assert_eq!(node.result().await?, json!(5));
//! # Ok(())
//! # }
//! ```

mod agent_loop;
pub mod builtins;
mod context;
mod func;
mod node;
mod runtime;
mod session;

pub use builtins::raise_exception;
pub use context::{ContextError, RunContext};
pub use func::{render_template, AgentFunction, CodeCallable, CodeFunction, Function};
pub use node::Node;
pub use runtime::{
    InvokeError, NodeLookupError, RegistryError, Runtime, RuntimeBuilder, RuntimeConfig,
};
pub use session::{SessionBag, SessionError, SessionScope};

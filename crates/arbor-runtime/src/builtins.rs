//! Built-in functions exposed to agents.

use crate::func::{CodeFunction, Function};
use arbor_contract::args::{ArgType, FunctionArg};
use arbor_contract::fault::FuncError;
use std::sync::{Arc, LazyLock};

/// Name of the raise-exception built-in, used by the agent loop to detect
/// a model-declared failure within a tool batch.
pub const RAISE_EXCEPTION_NAME: &str = "raise_exception";

static RAISE_EXCEPTION: LazyLock<Arc<Function>> = LazyLock::new(|| {
    CodeFunction::new(
        RAISE_EXCEPTION_NAME,
        "Declare that the current task has failed and cannot be completed. \
         Use this instead of fabricating an answer; include a concise \
         description of the blocking cause.",
        vec![FunctionArg::new(
            "message",
            ArgType::Str,
            "Why the task is failing, including any inner cause worth relaying.",
        )],
        |_ctx, args| {
            let message = args
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Box::pin(async move { Err(FuncError::Raised(message)) })
        },
    )
    .expect("raise_exception schema is valid")
    .build()
});

/// The singleton raise-exception spec. Agents include it in their `uses`
/// list; registration picks it up through the transitive closure.
pub fn raise_exception() -> Arc<Function> {
    RAISE_EXCEPTION.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singleton_is_shared() {
        assert!(Arc::ptr_eq(&raise_exception(), &raise_exception()));
        assert_eq!(raise_exception().name(), RAISE_EXCEPTION_NAME);
    }
}

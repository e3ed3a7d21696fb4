//! Function specs: immutable descriptions of invocable units.
//!
//! A spec is either a *code function* (deterministic async callable) or an
//! *agent function* (prompt templates plus a tool list). Specs are always
//! handled as `Arc<Function>`; two specs are "the same" only when they are
//! the same allocation (`Arc::ptr_eq`).

use crate::context::RunContext;
use arbor_contract::args::{
    coerce_json_args, validate_coerce_args, ArgError, ArgMap, FunctionArg, SpecError,
};
use arbor_contract::fault::FuncError;
use arbor_contract::provider::{Provider, ToolDecl};
use arbor_contract::view::FunctionKind;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// The body of a code function. First parameter is always the invocation's
/// [`RunContext`]; arguments arrive pre-validated against the declared
/// schema.
pub type CodeCallable =
    Arc<dyn Fn(RunContext, ArgMap) -> BoxFuture<'static, Result<Value, FuncError>> + Send + Sync>;

/// An invocable unit: code or agent.
pub enum Function {
    Code(CodeFunction),
    Agent(AgentFunction),
}

impl Function {
    pub fn name(&self) -> &str {
        match self {
            Function::Code(f) => &f.name,
            Function::Agent(f) => &f.name,
        }
    }

    pub fn desc(&self) -> &str {
        match self {
            Function::Code(f) => &f.desc,
            Function::Agent(f) => &f.desc,
        }
    }

    pub fn args(&self) -> &[FunctionArg] {
        match self {
            Function::Code(f) => &f.args,
            Function::Agent(f) => &f.args,
        }
    }

    /// Other specs this function may invoke.
    pub fn uses(&self) -> &[Arc<Function>] {
        match self {
            Function::Code(f) => &f.uses,
            Function::Agent(f) => &f.uses,
        }
    }

    pub fn kind(&self) -> FunctionKind {
        match self {
            Function::Code(_) => FunctionKind::Code,
            Function::Agent(_) => FunctionKind::Agent,
        }
    }

    pub fn as_code(&self) -> Option<&CodeFunction> {
        match self {
            Function::Code(f) => Some(f),
            Function::Agent(_) => None,
        }
    }

    pub fn as_agent(&self) -> Option<&AgentFunction> {
        match self {
            Function::Agent(f) => Some(f),
            Function::Code(_) => None,
        }
    }

    /// Validate and coerce a typed argument map against this spec.
    pub fn validate_coerce_args(&self, inputs: ArgMap) -> Result<ArgMap, ArgError> {
        validate_coerce_args(self.args(), inputs)
    }

    /// Coerce model-produced JSON tool arguments against this spec.
    pub fn coerce_json_args(&self, args: &Value) -> Result<ArgMap, ArgError> {
        coerce_json_args(self.args(), args)
    }

    /// Render this spec as a tool declaration for providers.
    pub fn tool_decl(&self) -> ToolDecl {
        let mut properties = serde_json::Map::new();
        for arg in self.args() {
            properties.insert(arg.name.clone(), arg.schema_property());
        }
        let required: Vec<Value> = self
            .args()
            .iter()
            .filter(|a| !a.optional)
            .map(|a| Value::String(a.name.clone()))
            .collect();
        ToolDecl {
            name: self.name().to_string(),
            description: self.desc().to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Function::Code(c) => c.fmt(f),
            Function::Agent(a) => a.fmt(f),
        }
    }
}

fn check_unique_args(args: &[FunctionArg]) -> Result<(), SpecError> {
    let mut seen = BTreeSet::new();
    for arg in args {
        if !seen.insert(arg.name.as_str()) {
            return Err(SpecError::DuplicateArgName(arg.name.clone()));
        }
    }
    Ok(())
}

fn check_unique_uses(uses: &[Arc<Function>]) -> Result<(), SpecError> {
    let mut seen = BTreeSet::new();
    for dep in uses {
        if !seen.insert(dep.name().to_string()) {
            return Err(SpecError::DuplicateUseName(dep.name().to_string()));
        }
    }
    Ok(())
}

/// A deterministic invocable backed by an async callable.
pub struct CodeFunction {
    pub name: String,
    pub desc: String,
    pub args: Vec<FunctionArg>,
    pub uses: Vec<Arc<Function>>,
    /// Marks human-gated tools: such a tool disqualifies its agent from the
    /// ephemeral cache tier and is expected to yield the model-api lease
    /// while it blocks.
    pub interactive: bool,
    pub callable: CodeCallable,
}

impl CodeFunction {
    pub fn new<F>(
        name: impl Into<String>,
        desc: impl Into<String>,
        args: Vec<FunctionArg>,
        callable: F,
    ) -> Result<Self, SpecError>
    where
        F: Fn(RunContext, ArgMap) -> BoxFuture<'static, Result<Value, FuncError>>
            + Send
            + Sync
            + 'static,
    {
        check_unique_args(&args)?;
        Ok(Self {
            name: name.into(),
            desc: desc.into(),
            args,
            uses: Vec::new(),
            interactive: false,
            callable: Arc::new(callable),
        })
    }

    pub fn with_uses(mut self, uses: Vec<Arc<Function>>) -> Result<Self, SpecError> {
        check_unique_uses(&uses)?;
        self.uses = uses;
        Ok(self)
    }

    #[must_use]
    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    pub fn build(self) -> Arc<Function> {
        Arc::new(Function::Code(self))
    }

    /// Run the callable directly with the caller's context, outside the
    /// scheduler. Direct calls do not appear in the invocation tree.
    pub async fn call_direct(
        &self,
        ctx: RunContext,
        inputs: ArgMap,
    ) -> Result<Value, FuncError> {
        let inputs = validate_coerce_args(&self.args, inputs)
            .map_err(|e| FuncError::InvalidArgument(e.to_string()))?;
        (self.callable)(ctx, inputs).await
    }
}

impl std::fmt::Debug for CodeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeFunction")
            .field("name", &self.name)
            .field("args", &self.args.len())
            .field("uses", &self.uses.iter().map(|u| u.name()).collect::<Vec<_>>())
            .field("interactive", &self.interactive)
            .finish()
    }
}

/// An LLM-driven invocable: prompt templates, input variables, and the
/// tools (other specs) it may call.
pub struct AgentFunction {
    pub name: String,
    pub desc: String,
    pub args: Vec<FunctionArg>,
    pub system_prompt: String,
    pub user_prompt_template: String,
    /// Input variables whose values are filesystem paths, read to a string
    /// at invocation time before substitution.
    pub file_args: BTreeSet<String>,
    pub uses: Vec<Arc<Function>>,
    pub default_provider: Provider,
}

impl AgentFunction {
    pub fn new(
        name: impl Into<String>,
        desc: impl Into<String>,
        args: Vec<FunctionArg>,
        system_prompt: impl Into<String>,
        user_prompt_template: impl Into<String>,
    ) -> Result<Self, SpecError> {
        check_unique_args(&args)?;
        Ok(Self {
            name: name.into(),
            desc: desc.into(),
            args,
            system_prompt: system_prompt.into(),
            user_prompt_template: user_prompt_template.into(),
            file_args: BTreeSet::new(),
            uses: Vec::new(),
            default_provider: Provider::Anthropic,
        })
    }

    pub fn with_uses(mut self, uses: Vec<Arc<Function>>) -> Result<Self, SpecError> {
        check_unique_uses(&uses)?;
        self.uses = uses;
        Ok(self)
    }

    /// Tag input variables as filepaths.
    pub fn with_file_args<I, S>(mut self, names: I) -> Result<Self, SpecError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            let name = name.into();
            let arg = self
                .args
                .iter()
                .find(|a| a.name == name)
                .ok_or_else(|| SpecError::FileArgUnknown(name.clone()))?;
            if arg.ty != arbor_contract::args::ArgType::Str {
                return Err(SpecError::FileArgNotString {
                    name,
                    ty: arg.ty,
                });
            }
            self.file_args.insert(name);
        }
        Ok(self)
    }

    #[must_use]
    pub fn with_default_provider(mut self, provider: Provider) -> Self {
        self.default_provider = provider;
        self
    }

    pub fn build(self) -> Arc<Function> {
        Arc::new(Function::Agent(self))
    }
}

impl std::fmt::Debug for AgentFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentFunction")
            .field("name", &self.name)
            .field("args", &self.args.len())
            .field(
                "system_prompt",
                &format!("[{} chars]", self.system_prompt.len()),
            )
            .field("uses", &self.uses.iter().map(|u| u.name()).collect::<Vec<_>>())
            .field("default_provider", &self.default_provider)
            .finish()
    }
}

/// Substitute `{name}` placeholders from `vars`. `{{` and `}}` escape
/// literal braces. Referencing an unbound variable is an error: missing
/// inputs must never be silently dropped from a prompt.
pub fn render_template(
    template: &str,
    vars: &BTreeMap<String, String>,
) -> Result<String, SpecError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' => {
                if chars.peek() == Some(&'{') {
                    chars.next();
                    out.push('{');
                    continue;
                }
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => name.push(ch),
                        None => return Err(SpecError::UnbalancedBrace),
                    }
                }
                match vars.get(&name) {
                    Some(value) => out.push_str(value),
                    None => return Err(SpecError::MissingTemplateVar(name)),
                }
            }
            '}' => {
                if chars.peek() == Some(&'}') {
                    chars.next();
                    out.push('}');
                } else {
                    return Err(SpecError::UnbalancedBrace);
                }
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

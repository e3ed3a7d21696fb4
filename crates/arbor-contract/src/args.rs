//! Four-primitive argument model shared by every invocable function.
//!
//! Argument schemas are deliberately restricted to `str`/`int`/`float`/`bool`
//! so that every declared function can be presented to an LLM as a tool with
//! a flat JSON-schema object. Validation is explicit, not reflective: a
//! [`FunctionArg`] knows how to check and coerce a single value, and callers
//! fold that over a whole argument map.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// The primitive type of a single declared argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgType {
    Str,
    Int,
    Float,
    Bool,
}

impl ArgType {
    /// JSON-schema type name used in tool declarations.
    pub fn json_schema_type(self) -> &'static str {
        match self {
            ArgType::Str => "string",
            ArgType::Int => "integer",
            ArgType::Float => "number",
            ArgType::Bool => "boolean",
        }
    }
}

impl std::fmt::Display for ArgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ArgType::Str => "str",
            ArgType::Int => "int",
            ArgType::Float => "float",
            ArgType::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// A tagged argument value. The only dynamic value shape the runtime admits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Ordered argument map passed to invocations. Ordering keeps rendered
/// views and prompts deterministic.
pub type ArgMap = BTreeMap<String, ArgValue>;

impl ArgValue {
    pub fn arg_type(&self) -> ArgType {
        match self {
            ArgValue::Str(_) => ArgType::Str,
            ArgValue::Int(_) => ArgType::Int,
            ArgValue::Float(_) => ArgType::Float,
            ArgValue::Bool(_) => ArgType::Bool,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ArgValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ArgValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ArgValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Render the value for prompt substitution.
    pub fn render(&self) -> String {
        match self {
            ArgValue::Str(s) => s.clone(),
            ArgValue::Int(v) => v.to_string(),
            ArgValue::Float(v) => v.to_string(),
            ArgValue::Bool(v) => v.to_string(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ArgValue::Str(s) => Value::String(s.clone()),
            ArgValue::Int(v) => Value::from(*v),
            ArgValue::Float(v) => Value::from(*v),
            ArgValue::Bool(v) => Value::from(*v),
        }
    }

    /// Convert a JSON value (typically a model-produced tool argument) into
    /// a tagged value. Integral JSON numbers become `Int`, everything else
    /// numeric becomes `Float`.
    pub fn from_json(value: &Value) -> Result<Self, ArgError> {
        match value {
            Value::String(s) => Ok(ArgValue::Str(s.clone())),
            Value::Bool(b) => Ok(ArgValue::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(ArgValue::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(ArgValue::Float(f))
                } else {
                    Err(ArgError::UnrepresentableNumber(n.to_string()))
                }
            }
            other => Err(ArgError::UnsupportedJson(json_type_name(other).to_string())),
        }
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        ArgValue::Str(v.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        ArgValue::Str(v)
    }
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        ArgValue::Int(v)
    }
}

impl From<f64> for ArgValue {
    fn from(v: f64) -> Self {
        ArgValue::Float(v)
    }
}

impl From<bool> for ArgValue {
    fn from(v: bool) -> Self {
        ArgValue::Bool(v)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Argument validation and coercion errors.
#[derive(Debug, Clone, Error)]
pub enum ArgError {
    #[error("unknown argument(s): {}", .0.join(", "))]
    Unknown(Vec<String>),

    #[error("missing required argument(s): {}", .0.join(", "))]
    Missing(Vec<String>),

    #[error("argument '{name}' expects {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: ArgType,
        actual: ArgType,
    },

    #[error("argument '{name}' cannot coerce '{value}' into bool; expected 'true' or 'false'")]
    BadBoolString { name: String, value: String },

    #[error("argument '{name}' must be one of [{}], got '{value}'", .allowed.join(", "))]
    NotInChoices {
        name: String,
        value: String,
        allowed: Vec<String>,
    },

    #[error("JSON number {0} is not representable as int or float")]
    UnrepresentableNumber(String),

    #[error("unsupported JSON value of type {0} for a primitive argument")]
    UnsupportedJson(String),

    #[error("tool arguments must be a JSON object, got {0}")]
    NotAnObject(String),
}

/// Schema-construction errors for declared arguments and functions.
#[derive(Debug, Clone, Error)]
pub enum SpecError {
    #[error("duplicate argument name '{0}'")]
    DuplicateArgName(String),

    #[error("duplicate name '{0}' in uses list")]
    DuplicateUseName(String),

    #[error("choices are only supported for str arguments; '{name}' is {ty}")]
    ChoicesOnNonString { name: String, ty: ArgType },

    #[error("choices for argument '{0}' must be non-empty")]
    EmptyChoices(String),

    #[error("file-input variable '{0}' is not a declared argument")]
    FileArgUnknown(String),

    #[error("file-input variable '{name}' must be a str argument, got {ty}")]
    FileArgNotString { name: String, ty: ArgType },

    #[error("template references unknown variable '{0}'")]
    MissingTemplateVar(String),

    #[error("unbalanced '{{' or '}}' in template")]
    UnbalancedBrace,
}

/// One declared argument of a function: name, primitive type, description,
/// optionality, and (for strings) an optional closed set of choices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionArg {
    pub name: String,
    pub ty: ArgType,
    pub desc: String,
    pub optional: bool,
    pub choices: Option<BTreeSet<String>>,
}

impl FunctionArg {
    pub fn new(name: impl Into<String>, ty: ArgType, desc: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty,
            desc: desc.into(),
            optional: false,
            choices: None,
        }
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Restrict a str argument to a closed set of values.
    pub fn with_choices<I, S>(mut self, choices: I) -> Result<Self, SpecError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.ty != ArgType::Str {
            return Err(SpecError::ChoicesOnNonString {
                name: self.name.clone(),
                ty: self.ty,
            });
        }
        let set: BTreeSet<String> = choices.into_iter().map(Into::into).collect();
        if set.is_empty() {
            return Err(SpecError::EmptyChoices(self.name.clone()));
        }
        self.choices = Some(set);
        Ok(self)
    }

    /// Validate a value against this argument, applying the one permitted
    /// coercion: the strings "true"/"false" (case-insensitive) coerce to
    /// bool. Everything else must match the declared type exactly.
    pub fn validate_coerce(&self, value: ArgValue) -> Result<ArgValue, ArgError> {
        let value = match (&self.ty, value) {
            (ArgType::Bool, ArgValue::Str(s)) => match s.to_ascii_lowercase().as_str() {
                "true" => ArgValue::Bool(true),
                "false" => ArgValue::Bool(false),
                _ => {
                    return Err(ArgError::BadBoolString {
                        name: self.name.clone(),
                        value: s,
                    })
                }
            },
            (_, v) => v,
        };

        if value.arg_type() != self.ty {
            return Err(ArgError::TypeMismatch {
                name: self.name.clone(),
                expected: self.ty,
                actual: value.arg_type(),
            });
        }

        if let (Some(choices), ArgValue::Str(s)) = (&self.choices, &value) {
            if !choices.contains(s) {
                return Err(ArgError::NotInChoices {
                    name: self.name.clone(),
                    value: s.clone(),
                    allowed: choices.iter().cloned().collect(),
                });
            }
        }

        Ok(value)
    }

    /// JSON-schema property object for tool declarations.
    pub fn schema_property(&self) -> Value {
        let mut prop = serde_json::Map::new();
        prop.insert(
            "type".to_string(),
            Value::String(self.ty.json_schema_type().to_string()),
        );
        prop.insert("description".to_string(), Value::String(self.desc.clone()));
        if let Some(choices) = &self.choices {
            prop.insert(
                "enum".to_string(),
                Value::Array(choices.iter().cloned().map(Value::String).collect()),
            );
        }
        Value::Object(prop)
    }
}

/// Validate a full argument map against a declared schema.
///
/// Rejects unknown names, rejects missing required names, admits omitted
/// optionals (they are absent from the result), and applies per-argument
/// validation/coercion in declaration order.
pub fn validate_coerce_args(schema: &[FunctionArg], inputs: ArgMap) -> Result<ArgMap, ArgError> {
    let mut inputs = inputs;
    let unknown: Vec<String> = inputs
        .keys()
        .filter(|k| !schema.iter().any(|a| &a.name == *k))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        return Err(ArgError::Unknown(unknown));
    }

    let missing: Vec<String> = schema
        .iter()
        .filter(|a| !a.optional && !inputs.contains_key(&a.name))
        .map(|a| a.name.clone())
        .collect();
    if !missing.is_empty() {
        return Err(ArgError::Missing(missing));
    }

    let mut out = ArgMap::new();
    for arg in schema {
        if let Some(value) = inputs.remove(&arg.name) {
            out.insert(arg.name.clone(), arg.validate_coerce(value)?);
        }
    }
    Ok(out)
}

/// Convert a model-produced JSON object into an [`ArgMap`] for the given
/// schema, then validate it. JSON `null` for an optional argument counts as
/// omitted.
pub fn coerce_json_args(schema: &[FunctionArg], args: &Value) -> Result<ArgMap, ArgError> {
    let empty = serde_json::Map::new();
    let obj = match args {
        Value::Object(obj) => obj,
        Value::Null => &empty,
        other => return Err(ArgError::NotAnObject(json_type_name(other).to_string())),
    };

    let mut map = ArgMap::new();
    for (key, value) in obj {
        if value.is_null() {
            continue;
        }
        map.insert(key.clone(), ArgValue::from_json(value)?);
    }
    validate_coerce_args(schema, map)
}

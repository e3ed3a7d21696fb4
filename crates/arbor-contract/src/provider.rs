//! Provider abstraction: the seam between the provider-neutral agent loop
//! and concrete model SDK wire formats.
//!
//! A provider implements [`ProviderSession`]: it owns its SDK-typed
//! transcript storage, renders every request from system prompt + user seed
//! + the entire stored transcript verbatim and in original order, and
//! converts responses *to* neutral parts, never from them.

use crate::transcript::TranscriptPart;
use crate::usage::TokenUsage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Supported model providers. One best model per provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    Anthropic,
    OpenAi,
    Gemini,
    XAi,
}

impl Provider {
    /// The single model this framework targets per provider.
    pub fn default_model(self) -> &'static str {
        match self {
            Provider::Anthropic => "claude-opus-4-1-20250805",
            Provider::OpenAi => "gpt-5-2025-08-07",
            Provider::Gemini => "gemini-2.5-pro",
            Provider::XAi => "grok-4",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Provider::Anthropic => "Anthropic",
            Provider::OpenAi => "OpenAI",
            Provider::Gemini => "Gemini",
            Provider::XAi => "xAI",
        };
        f.write_str(name)
    }
}

/// Prompt-cache watermark selected once per agent invocation, before the
/// first request, and frozen thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    None,
    FiveMinute,
    OneHour,
}

/// A function exposed to the model as a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDecl {
    pub name: String,
    pub description: String,
    /// Flat JSON-schema object: properties + required.
    pub input_schema: Value,
}

/// Everything a provider needs to open a session for one agent invocation.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    /// Agent spec name, for diagnostics.
    pub agent: String,
    pub model: String,
    pub system_prompt: String,
    /// The rendered initial user turn.
    pub user_seed: String,
    pub tools: Vec<ToolDecl>,
}

/// One tool invocation extracted from a model response.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUseRequest {
    pub tool_use_id: String,
    pub tool_name: String,
    pub args: Value,
}

/// One tool outcome handed back to the provider for the aggregated
/// tool-result user turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRecord {
    pub tool_use_id: String,
    pub tool_name: String,
    pub output: String,
    pub is_error: bool,
}

/// The neutral projection of one model response.
#[derive(Debug, Clone, Default)]
pub struct ModelTurn {
    /// All assistant parts of this response in arrival order (thinking,
    /// text, tool uses). Appended to the invocation transcript untouched.
    pub parts: Vec<TranscriptPart>,
    /// Tool invocations to dispatch, in the order they appeared.
    pub tool_uses: Vec<ToolUseRequest>,
    /// This response's usage metadata (a delta, not a running total).
    pub usage: TokenUsage,
}

impl ModelTurn {
    /// Concatenated text parts of this turn; the invocation output when no
    /// tools were requested.
    pub fn text(&self) -> String {
        let chunks: Vec<&str> = self
            .parts
            .iter()
            .filter_map(|p| match p {
                TranscriptPart::ModelText { text } if !text.trim().is_empty() => {
                    Some(text.as_str())
                }
                _ => None,
            })
            .collect();
        chunks.join("\n").trim().to_string()
    }
}

/// A provider submission failure. `transient` is the provider's own
/// classification; only transient errors are retried by the loop.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub transient: bool,
    pub message: String,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            transient: true,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            transient: false,
            message: message.into(),
        }
    }
}

/// A live model session for one agent invocation.
///
/// Implementations own the SDK-typed replay history. The loop guarantees it
/// calls `record_tool_results` exactly once between two `step` calls that
/// returned tool uses.
#[async_trait]
pub trait ProviderSession: Send {
    /// Render the request (cache marker, if any, on only the latest
    /// message), submit it, ingest the response into the stored history,
    /// and return its neutral projection.
    async fn step(&mut self, cache: CachePolicy) -> Result<ModelTurn, ProviderError>;

    /// Append the aggregated tool results as a single user turn containing
    /// only tool-result parts.
    fn record_tool_results(&mut self, results: &[ToolRecord]);
}

/// Opens provider sessions. Registered per [`Provider`] on the runtime.
pub trait SessionFactory: Send + Sync {
    fn open(&self, request: SessionRequest) -> Result<Box<dyn ProviderSession>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_models_are_pinned() {
        assert_eq!(Provider::Anthropic.default_model(), "claude-opus-4-1-20250805");
        assert_eq!(Provider::OpenAi.default_model(), "gpt-5-2025-08-07");
        assert_eq!(Provider::Gemini.default_model(), "gemini-2.5-pro");
        assert_eq!(Provider::XAi.default_model(), "grok-4");
    }

    #[test]
    fn turn_text_joins_nonempty_text_parts() {
        let turn = ModelTurn {
            parts: vec![
                TranscriptPart::thinking("", "sig"),
                TranscriptPart::model_text("first"),
                TranscriptPart::model_text("   "),
                TranscriptPart::model_text("second"),
            ],
            tool_uses: vec![],
            usage: TokenUsage::default(),
        };
        assert_eq!(turn.text(), "first\nsecond");
    }
}

//! Provider-neutral transcript parts.
//!
//! Every agent invocation records its session as an ordered sequence of
//! these parts, converted *from* provider wire formats and never the other
//! way around. Order is preserved exactly as parts arrived, and reasoning
//! signatures are carried through untouched so the provider layer can
//! replay them verbatim.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptPart {
    /// A user-authored text turn (the rendered seed prompt).
    UserText { text: String },

    /// Assistant text output.
    ModelText { text: String },

    /// A reasoning block. `content` may be empty when the provider hides
    /// reasoning text; `signature` is the provider's opaque continuation
    /// token. Redacted reasoning keeps its signature with `redacted` set.
    Thinking {
        content: String,
        signature: String,
        redacted: bool,
    },

    /// A tool invocation requested by the model.
    ToolUse {
        tool_use_id: String,
        tool_name: String,
        args: Value,
    },

    /// The outcome of one tool invocation, fed back to the model.
    ToolResult {
        tool_use_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
}

impl TranscriptPart {
    pub fn user_text(text: impl Into<String>) -> Self {
        TranscriptPart::UserText { text: text.into() }
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        TranscriptPart::ModelText { text: text.into() }
    }

    pub fn thinking(content: impl Into<String>, signature: impl Into<String>) -> Self {
        TranscriptPart::Thinking {
            content: content.into(),
            signature: signature.into(),
            redacted: false,
        }
    }

    pub fn redacted_thinking(signature: impl Into<String>) -> Self {
        TranscriptPart::Thinking {
            content: String::new(),
            signature: signature.into(),
            redacted: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serde_tags_are_stable() {
        let part = TranscriptPart::ToolUse {
            tool_use_id: "tu-1".into(),
            tool_name: "echo".into(),
            args: json!({"text": "hi"}),
        };
        let v = serde_json::to_value(&part).unwrap();
        assert_eq!(v["type"], "tool_use");
        assert_eq!(v["tool_name"], "echo");

        let back: TranscriptPart = serde_json::from_value(v).unwrap();
        assert_eq!(back, part);
    }

    #[test]
    fn redacted_thinking_preserves_signature() {
        let part = TranscriptPart::redacted_thinking("opaque-bytes");
        match &part {
            TranscriptPart::Thinking {
                content,
                signature,
                redacted,
            } => {
                assert!(content.is_empty());
                assert_eq!(signature, "opaque-bytes");
                assert!(redacted);
            }
            _ => panic!("expected thinking part"),
        }
        let v = serde_json::to_value(&part).unwrap();
        assert_eq!(v["type"], "thinking");
        assert_eq!(v["redacted"], true);
    }
}

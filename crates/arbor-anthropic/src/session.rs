//! The Anthropic session: SDK-typed history, request rendering with the
//! cache marker on only the latest message, submission with status-based
//! transient classification, and conversion of responses to neutral parts.

use crate::wire::{
    CacheControl, ContentBlock, ErrorEnvelope, MessagesRequest, MessagesResponse, SystemBlock,
    ThinkingConfig, ToolChoice, WireMessage, WireTool, WireUsage,
};
use crate::AnthropicConfig;
use arbor_contract::provider::{
    CachePolicy, ModelTurn, ProviderError, ProviderSession, SessionRequest, ToolRecord,
    ToolUseRequest,
};
use arbor_contract::transcript::TranscriptPart;
use arbor_contract::usage::TokenUsage;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;

pub(crate) const ANTHROPIC_VERSION: &str = "2023-06-01";
pub(crate) const INTERLEAVED_THINKING_BETA: &str = "interleaved-thinking-2025-05-14";
pub(crate) const EXTENDED_CACHE_TTL_BETA: &str = "extended-cache-ttl-2025-04-11";

pub(crate) struct AnthropicSession {
    http: reqwest::Client,
    config: Arc<AnthropicConfig>,
    agent: String,
    model: String,
    system: String,
    tools: Vec<WireTool>,
    /// Replay history in wire types, never rewritten after append. Cache
    /// markers are applied to a per-request clone only.
    history: Vec<WireMessage>,
    tool_counter: u64,
}

impl AnthropicSession {
    pub(crate) fn new(
        http: reqwest::Client,
        config: Arc<AnthropicConfig>,
        request: SessionRequest,
    ) -> Self {
        let model = config
            .model
            .clone()
            .unwrap_or(request.model);
        let tools = request
            .tools
            .into_iter()
            .map(|decl| WireTool {
                name: decl.name,
                description: decl.description,
                input_schema: decl.input_schema,
            })
            .collect();
        Self {
            http,
            config,
            agent: request.agent,
            model,
            system: request.system_prompt,
            tools,
            history: vec![WireMessage::user(vec![ContentBlock::text(
                request.user_seed,
            )])],
            tool_counter: 0,
        }
    }

    fn next_tool_use_id(&mut self, tool_name: &str) -> String {
        self.tool_counter += 1;
        format!("anthropic-{}-{}", self.tool_counter, tool_name)
    }

    /// Clone the stored history and place the cache marker, if any, on the
    /// final content block of the latest message. The stored history never
    /// carries a marker, so exactly one message is marked per request.
    pub(crate) fn render_request(&self, cache: CachePolicy) -> MessagesRequest {
        let mut messages = self.history.clone();
        let ttl = match cache {
            CachePolicy::None => None,
            CachePolicy::FiveMinute => Some("5m"),
            CachePolicy::OneHour => Some("1h"),
        };
        if let Some(ttl) = ttl {
            if let Some(block) = messages
                .last_mut()
                .and_then(|msg| msg.content.last_mut())
            {
                block.set_cache_control(CacheControl::ephemeral(ttl));
            }
        }
        MessagesRequest {
            model: self.model.clone(),
            max_tokens: self.config.max_tokens,
            system: vec![SystemBlock::text(self.system.clone())],
            messages,
            tool_choice: (!self.tools.is_empty()).then(ToolChoice::auto),
            tools: self.tools.clone(),
            thinking: ThinkingConfig::enabled(self.config.thinking_budget),
        }
    }

    fn beta_header(&self, cache: CachePolicy) -> String {
        if cache == CachePolicy::OneHour {
            format!("{INTERLEAVED_THINKING_BETA},{EXTENDED_CACHE_TTL_BETA}")
        } else {
            INTERLEAVED_THINKING_BETA.to_string()
        }
    }

    async fn submit(
        &self,
        request: &MessagesRequest,
        cache: CachePolicy,
    ) -> Result<MessagesResponse, ProviderError> {
        let url = format!("{}/v1/messages", self.config.base_url);
        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("anthropic-beta", self.beta_header(cache))
            .json(request)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status.is_success() {
            return response.json::<MessagesResponse>().await.map_err(|e| {
                ProviderError::fatal(format!("failed to parse messages response: {e}"))
            });
        }

        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(envelope) => format!(
                "{status} ({}): {}",
                envelope.error.kind, envelope.error.message
            ),
            Err(_) => format!("{status}: {}", truncate(&body, 200)),
        };
        tracing::debug!(agent = %self.agent, %status, "anthropic request failed");
        Err(ProviderError {
            transient: is_transient_status(status),
            message,
        })
    }

    /// Append the assistant content to the replay history verbatim (only
    /// filling in any absent tool-use ids) and project it to neutral parts.
    fn ingest(&mut self, response: MessagesResponse) -> ModelTurn {
        let mut content = response.content;
        for block in &mut content {
            if let ContentBlock::ToolUse { id, name, .. } = block {
                if id.is_empty() {
                    *id = self.next_tool_use_id(&name.clone());
                }
            }
        }
        self.history.push(WireMessage::assistant(content.clone()));

        let mut parts = Vec::with_capacity(content.len());
        let mut tool_uses = Vec::new();
        for block in content {
            match block {
                ContentBlock::Thinking {
                    thinking,
                    signature,
                } => parts.push(TranscriptPart::Thinking {
                    content: thinking,
                    signature,
                    redacted: false,
                }),
                ContentBlock::RedactedThinking { data } => {
                    parts.push(TranscriptPart::redacted_thinking(data));
                }
                ContentBlock::Text { text, .. } => {
                    if !text.is_empty() {
                        parts.push(TranscriptPart::model_text(text));
                    }
                }
                ContentBlock::ToolUse { id, name, input } => {
                    parts.push(TranscriptPart::ToolUse {
                        tool_use_id: id.clone(),
                        tool_name: name.clone(),
                        args: input.clone(),
                    });
                    tool_uses.push(ToolUseRequest {
                        tool_use_id: id,
                        tool_name: name,
                        args: input,
                    });
                }
                ContentBlock::ToolResult { .. } => {}
            }
        }

        ModelTurn {
            parts,
            tool_uses,
            usage: map_usage(&response.usage),
        }
    }
}

#[async_trait]
impl ProviderSession for AnthropicSession {
    async fn step(&mut self, cache: CachePolicy) -> Result<ModelTurn, ProviderError> {
        let request = self.render_request(cache);
        let response = self.submit(&request, cache).await?;
        Ok(self.ingest(response))
    }

    fn record_tool_results(&mut self, results: &[ToolRecord]) {
        let content = results
            .iter()
            .map(|record| ContentBlock::ToolResult {
                tool_use_id: record.tool_use_id.clone(),
                content: record.output.clone(),
                is_error: record.is_error,
                cache_control: None,
            })
            .collect();
        self.history.push(WireMessage::user(content));
    }
}

fn map_usage(usage: &WireUsage) -> TokenUsage {
    let cache_read = usage.cache_read_input_tokens.unwrap_or(0);
    let cache_write = usage.cache_creation_input_tokens.unwrap_or(0);
    TokenUsage {
        input_tokens_cache_read: cache_read,
        input_tokens_cache_write: cache_write,
        input_tokens_regular: usage.input_tokens,
        input_tokens_total: usage.input_tokens + cache_read + cache_write,
        // The Messages API reports one combined output count.
        output_tokens_reasoning: None,
        output_tokens_text: None,
        output_tokens_total: usage.output_tokens,
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504 | 529)
}

fn classify_transport_error(error: reqwest::Error) -> ProviderError {
    ProviderError {
        transient: error.is_timeout() || error.is_connect(),
        message: format!("transport error: {error}"),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_contract::provider::ToolDecl;
    use serde_json::json;

    fn test_session(tools: Vec<ToolDecl>) -> AnthropicSession {
        let config = Arc::new(AnthropicConfig::new("test-key"));
        AnthropicSession::new(
            reqwest::Client::new(),
            config,
            SessionRequest {
                agent: "probe".into(),
                model: "claude-opus-4-1-20250805".into(),
                system_prompt: "be terse".into(),
                user_seed: "hello".into(),
                tools,
            },
        )
    }

    fn echo_decl() -> ToolDecl {
        ToolDecl {
            name: "echo".into(),
            description: "Echo text.".into(),
            input_schema: json!({"type": "object", "properties": {}, "required": []}),
        }
    }

    fn tool_response() -> MessagesResponse {
        serde_json::from_value(json!({
            "content": [
                {"type": "thinking", "thinking": "", "signature": "sig-1"},
                {"type": "tool_use", "id": "tu-1", "name": "echo", "input": {"text": "a"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 100, "output_tokens": 10,
                      "cache_creation_input_tokens": 40, "cache_read_input_tokens": 5}
        }))
        .unwrap()
    }

    #[test]
    fn marker_lands_on_only_the_latest_block() {
        let mut session = test_session(vec![echo_decl()]);

        // First request: marker on the seed.
        let req = session.render_request(CachePolicy::FiveMinute);
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["messages"][0]["content"][0]["cache_control"]["ttl"], "5m");

        // Advance one cycle.
        let _ = session.ingest(tool_response());
        session.record_tool_results(&[ToolRecord {
            tool_use_id: "tu-1".into(),
            tool_name: "echo".into(),
            output: "a".into(),
            is_error: false,
        }]);

        let req = session.render_request(CachePolicy::FiveMinute);
        let v = serde_json::to_value(&req).unwrap();
        let messages = v["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        // Exactly one marker across the whole request, on the last block of
        // the last message.
        let mut marker_count = 0;
        for msg in messages {
            for block in msg["content"].as_array().unwrap() {
                if block.get("cache_control").is_some() {
                    marker_count += 1;
                }
            }
        }
        assert_eq!(marker_count, 1);
        let last = messages.last().unwrap();
        assert!(last["content"]
            .as_array()
            .unwrap()
            .last()
            .unwrap()
            .get("cache_control")
            .is_some());

        // The stored history stayed clean: a no-marker render shows none.
        let req = session.render_request(CachePolicy::None);
        let v = serde_json::to_value(&req).unwrap();
        for msg in v["messages"].as_array().unwrap() {
            for block in msg["content"].as_array().unwrap() {
                assert!(block.get("cache_control").is_none());
            }
        }
    }

    #[test]
    fn history_replays_assistant_blocks_verbatim() {
        let mut session = test_session(vec![echo_decl()]);
        let turn = session.ingest(tool_response());
        session.record_tool_results(&[ToolRecord {
            tool_use_id: "tu-1".into(),
            tool_name: "echo".into(),
            output: "a".into(),
            is_error: false,
        }]);

        assert_eq!(turn.tool_uses.len(), 1);
        assert_eq!(turn.tool_uses[0].tool_use_id, "tu-1");

        let req = session.render_request(CachePolicy::None);
        let v = serde_json::to_value(&req).unwrap();
        let messages = v["messages"].as_array().unwrap();
        // user seed, assistant turn, tool-result user turn
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[1]["content"][0]["type"], "thinking");
        assert_eq!(messages[1]["content"][0]["signature"], "sig-1");
        assert_eq!(messages[1]["content"][1]["type"], "tool_use");
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"][0]["type"], "tool_result");
        assert_eq!(messages[2]["content"][0]["tool_use_id"], "tu-1");
        assert_eq!(messages[2]["content"][0]["is_error"], false);
    }

    #[test]
    fn redacted_thinking_is_projected_and_replayed() {
        let mut session = test_session(vec![]);
        let response: MessagesResponse = serde_json::from_value(json!({
            "content": [
                {"type": "redacted_thinking", "data": "opaque-blob"},
                {"type": "text", "text": "answer"}
            ],
            "usage": {"input_tokens": 1, "output_tokens": 2}
        }))
        .unwrap();
        let turn = session.ingest(response);
        assert_eq!(
            turn.parts[0],
            TranscriptPart::redacted_thinking("opaque-blob")
        );
        assert_eq!(turn.text(), "answer");

        let req = session.render_request(CachePolicy::None);
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(
            v["messages"][1]["content"][0]["type"],
            "redacted_thinking"
        );
        assert_eq!(v["messages"][1]["content"][0]["data"], "opaque-blob");
    }

    #[test]
    fn usage_mapping_sums_cache_tiers_into_input_total() {
        let mut session = test_session(vec![echo_decl()]);
        let turn = session.ingest(tool_response());
        assert_eq!(turn.usage.input_tokens_cache_read, 5);
        assert_eq!(turn.usage.input_tokens_cache_write, 40);
        assert_eq!(turn.usage.input_tokens_regular, 100);
        assert_eq!(turn.usage.input_tokens_total, 145);
        assert_eq!(turn.usage.output_tokens_total, 10);
        assert_eq!(turn.usage.output_tokens_reasoning, None);
    }

    #[test]
    fn missing_tool_use_ids_get_a_counter_fallback() {
        let mut session = test_session(vec![echo_decl()]);
        let response: MessagesResponse = serde_json::from_value(json!({
            "content": [
                {"type": "tool_use", "id": "", "name": "echo", "input": {}}
            ],
            "usage": {"input_tokens": 1, "output_tokens": 1}
        }))
        .unwrap();
        let turn = session.ingest(response);
        assert_eq!(turn.tool_uses[0].tool_use_id, "anthropic-1-echo");

        // The replayed history carries the same generated id.
        let req = session.render_request(CachePolicy::None);
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["messages"][1]["content"][0]["id"], "anthropic-1-echo");
    }

    #[test]
    fn transient_statuses_are_classified() {
        for code in [408u16, 429, 500, 502, 503, 504, 529] {
            assert!(is_transient_status(StatusCode::from_u16(code).unwrap()));
        }
        for code in [400u16, 401, 403, 404, 422] {
            assert!(!is_transient_status(StatusCode::from_u16(code).unwrap()));
        }
    }

    #[test]
    fn beta_header_adds_extended_ttl_for_one_hour() {
        let session = test_session(vec![]);
        assert_eq!(
            session.beta_header(CachePolicy::FiveMinute),
            INTERLEAVED_THINKING_BETA
        );
        let header = session.beta_header(CachePolicy::OneHour);
        assert!(header.contains(INTERLEAVED_THINKING_BETA));
        assert!(header.contains(EXTENDED_CACHE_TTL_BETA));
    }

    #[test]
    fn tool_choice_auto_only_with_tools() {
        let session = test_session(vec![echo_decl()]);
        let req = session.render_request(CachePolicy::None);
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["tool_choice"]["type"], "auto");
        assert_eq!(v["tools"][0]["name"], "echo");

        let bare = test_session(vec![]);
        let req = bare.render_request(CachePolicy::None);
        let v = serde_json::to_value(&req).unwrap();
        assert!(v.get("tool_choice").is_none());
        assert!(v.get("tools").is_none());
    }
}

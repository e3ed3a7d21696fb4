//! Deterministic provider sessions for loop and runtime tests.
//!
//! A [`ScriptedFactory`] hands out sessions that replay pre-scripted turns
//! and record everything the loop does (open requests, cache markers per
//! step, aggregated tool-result batches) into a shared [`ScriptedLog`] for
//! assertions.

use crate::provider::{
    CachePolicy, ModelTurn, ProviderError, ProviderSession, SessionFactory, SessionRequest,
    ToolRecord, ToolUseRequest,
};
use crate::transcript::TranscriptPart;
use crate::usage::TokenUsage;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Everything the scripted sessions observed, for test assertions.
#[derive(Default)]
pub struct ScriptedLog {
    /// Ordered event strings: `open:<agent>`, `step:<agent>`,
    /// `record:<agent>:<n>`.
    pub events: Mutex<Vec<String>>,
    /// Cache marker passed to each `step`, in call order across sessions.
    pub markers: Mutex<Vec<CachePolicy>>,
    /// Every aggregated tool-result batch handed back to a session.
    pub records: Mutex<Vec<Vec<ToolRecord>>>,
    /// Every session-open request.
    pub requests: Mutex<Vec<SessionRequest>>,
}

impl ScriptedLog {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn markers(&self) -> Vec<CachePolicy> {
        self.markers.lock().unwrap().clone()
    }

    pub fn records(&self) -> Vec<Vec<ToolRecord>> {
        self.records.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

type Script = VecDeque<Result<ModelTurn, ProviderError>>;

/// A [`SessionFactory`] that serves scripted sessions per agent name. Each
/// `open` for an agent consumes that agent's next queued script.
pub struct ScriptedFactory {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    pub log: Arc<ScriptedLog>,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            log: Arc::new(ScriptedLog::default()),
        })
    }

    /// Queue one session's worth of turns for the named agent.
    pub fn push_script(&self, agent: &str, turns: Vec<Result<ModelTurn, ProviderError>>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(agent.to_string())
            .or_default()
            .push_back(turns.into());
    }
}

impl SessionFactory for ScriptedFactory {
    fn open(&self, request: SessionRequest) -> Result<Box<dyn ProviderSession>, ProviderError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.agent)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| {
                ProviderError::fatal(format!("no script queued for agent '{}'", request.agent))
            })?;
        self.log
            .events
            .lock()
            .unwrap()
            .push(format!("open:{}", request.agent));
        let agent = request.agent.clone();
        self.log.requests.lock().unwrap().push(request);
        Ok(Box::new(ScriptedSession {
            agent,
            turns: script,
            log: self.log.clone(),
        }))
    }
}

struct ScriptedSession {
    agent: String,
    turns: Script,
    log: Arc<ScriptedLog>,
}

#[async_trait]
impl ProviderSession for ScriptedSession {
    async fn step(&mut self, cache: CachePolicy) -> Result<ModelTurn, ProviderError> {
        self.log
            .events
            .lock()
            .unwrap()
            .push(format!("step:{}", self.agent));
        self.log.markers.lock().unwrap().push(cache);
        self.turns.pop_front().unwrap_or_else(|| {
            Err(ProviderError::fatal(format!(
                "script for agent '{}' exhausted",
                self.agent
            )))
        })
    }

    fn record_tool_results(&mut self, results: &[ToolRecord]) {
        self.log
            .events
            .lock()
            .unwrap()
            .push(format!("record:{}:{}", self.agent, results.len()));
        self.log.records.lock().unwrap().push(results.to_vec());
    }
}

/// Usage with only the input/output totals set, enough for sum assertions.
pub fn usage(input: u64, output: u64) -> TokenUsage {
    TokenUsage {
        input_tokens_regular: input,
        input_tokens_total: input,
        output_tokens_total: output,
        ..TokenUsage::default()
    }
}

/// A turn that thinks and then answers with text (terminates the loop).
pub fn text_turn(signature: &str, text: &str, usage: TokenUsage) -> ModelTurn {
    ModelTurn {
        parts: vec![
            TranscriptPart::thinking("", signature),
            TranscriptPart::model_text(text),
        ],
        tool_uses: vec![],
        usage,
    }
}

/// A turn that thinks and then requests the given tool calls.
pub fn tool_turn(signature: &str, uses: &[(&str, &str, Value)], usage: TokenUsage) -> ModelTurn {
    let mut parts = vec![TranscriptPart::thinking("", signature)];
    let mut tool_uses = Vec::with_capacity(uses.len());
    for (id, name, args) in uses {
        parts.push(TranscriptPart::ToolUse {
            tool_use_id: id.to_string(),
            tool_name: name.to_string(),
            args: args.clone(),
        });
        tool_uses.push(ToolUseRequest {
            tool_use_id: id.to_string(),
            tool_name: name.to_string(),
            args: args.clone(),
        });
    }
    ModelTurn {
        parts,
        tool_uses,
        usage,
    }
}

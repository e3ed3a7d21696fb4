//! The agent loop: the provider-neutral automaton driving one LLM session
//! with interleaved reasoning and tool use.
//!
//! Per request-cycle the loop re-acquires the model-api lease if it was
//! courteously released, submits the full transcript verbatim through the
//! provider session, appends the response parts untouched, dispatches any
//! tool calls as child invocations, and folds all results into a single
//! follow-up user turn. A model-declared raise-exception is honored after
//! the whole batch has been attempted.

use crate::builtins::RAISE_EXCEPTION_NAME;
use crate::context::{ModelLease, RunContext};
use crate::func::{render_template, AgentFunction, Function};
use crate::node::{Node, NodeCell};
use crate::runtime::{RunRecord, RuntimeInner};
use arbor_contract::fault::Fault;
use arbor_contract::provider::{
    CachePolicy, ModelTurn, Provider, ProviderError, ProviderSession, SessionFactory,
    SessionRequest, ToolRecord, ToolUseRequest,
};
use arbor_contract::transcript::TranscriptPart;
use arbor_contract::view::NodeState;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const ONE_HOUR: Duration = Duration::from_secs(3600);

/// Wall-clock trace of one invocation's tool calls, folded into the
/// per-spec history at completion.
#[derive(Default)]
struct LoopStats {
    call_times: Vec<Instant>,
}

impl LoopStats {
    fn note_call(&mut self) {
        self.call_times.push(Instant::now());
    }

    fn into_record(self) -> RunRecord {
        let intervals: Vec<Duration> = self
            .call_times
            .windows(2)
            .map(|pair| pair[1].duration_since(pair[0]))
            .collect();
        let mean_interval = if intervals.is_empty() {
            None
        } else {
            Some(intervals.iter().sum::<Duration>() / intervals.len() as u32)
        };
        RunRecord {
            tool_calls: self.call_times.len() as u32,
            mean_interval,
        }
    }
}

/// Entry point spawned by the scheduler for every agent invocation.
pub(crate) async fn run(
    inner: Arc<RuntimeInner>,
    cell: Arc<NodeCell>,
    ctx: RunContext,
    provider: Provider,
    factory: Arc<dyn SessionFactory>,
) {
    let Some(agent) = cell.func.as_agent() else {
        inner.post_exception(
            &cell,
            Fault::Code {
                kind: "Internal".to_string(),
                message: "agent loop started on a non-agent node".to_string(),
            },
        );
        return;
    };

    let mut stats = LoopStats::default();
    let outcome = drive(&inner, &cell, &ctx, agent, provider, factory.as_ref(), &mut stats).await;
    inner.record_agent_run(&agent.name, stats.into_record());

    match outcome {
        Ok(text) => inner.post_success(&cell, Value::String(text)),
        Err(fault) => inner.post_exception(&cell, fault),
    }
    if cell.parent.is_none() {
        ctx.yield_model_lease();
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    inner: &Arc<RuntimeInner>,
    cell: &Arc<NodeCell>,
    ctx: &RunContext,
    agent: &AgentFunction,
    provider: Provider,
    factory: &dyn SessionFactory,
    stats: &mut LoopStats,
) -> Result<String, Fault> {
    let node_id = cell.id;
    let provider_fault = |e: ProviderError| Fault::Provider {
        provider,
        agent: agent.name.clone(),
        node_id,
        message: e.message,
    };

    if let Err(err) = ctx.post_status_update(NodeState::Running) {
        tracing::warn!(node = node_id, error = %err, "could not post Running state");
    }

    // Resolve input variables: filepath-tagged values are read at
    // invocation time, everything else substitutes literally.
    let mut vars = BTreeMap::new();
    for (name, value) in &cell.inputs {
        let resolved = if agent.file_args.contains(name) {
            let path = value.render();
            tokio::fs::read_to_string(&path).await.map_err(|e| Fault::Code {
                kind: "Io".to_string(),
                message: format!("failed to read input file '{path}': {e}"),
            })?
        } else {
            value.render()
        };
        vars.insert(name.clone(), resolved);
    }
    let template_fault = |e: arbor_contract::SpecError| Fault::Code {
        kind: "Template".to_string(),
        message: e.to_string(),
    };
    let system_prompt = render_template(&agent.system_prompt, &vars).map_err(template_fault)?;
    let user_seed = render_template(&agent.user_prompt_template, &vars).map_err(template_fault)?;

    // The cache watermark is decided once, before the first request, and
    // frozen for the whole invocation.
    let cache = decide_cache_policy(agent, inner);
    cell.set_cache_policy(cache);
    tracing::debug!(node = node_id, agent = %agent.name, policy = ?cache, "cache policy frozen");

    let tools = agent.uses.iter().map(|f| f.tool_decl()).collect();
    let mut session = factory
        .open(SessionRequest {
            agent: agent.name.clone(),
            model: provider.default_model().to_string(),
            system_prompt,
            user_seed: user_seed.clone(),
            tools,
        })
        .map_err(provider_fault)?;

    cell.push_transcript(TranscriptPart::user_text(user_seed));

    let lease = ctx.lease().ok_or_else(|| Fault::Code {
        kind: "Internal".to_string(),
        message: "agent context carries no model-api lease".to_string(),
    })?;

    for step in 0..inner.config.max_steps {
        ensure_lease(inner, &lease, provider).await.map_err(provider_fault)?;

        let turn = submit_with_retry(inner, session.as_mut(), cache)
            .await
            .map_err(provider_fault)?;
        tracing::debug!(
            node = node_id,
            step,
            tool_uses = turn.tool_uses.len(),
            "model turn received"
        );

        cell.accumulate_usage(&turn.usage);
        cell.extend_transcript(turn.parts.clone());

        if turn.tool_uses.is_empty() {
            return Ok(turn.text());
        }

        // Dispatch the whole batch first; results are joined in call order
        // afterwards, so parallel tool calls stay logically concurrent.
        let mut children: Vec<Result<Node, String>> = Vec::with_capacity(turn.tool_uses.len());
        for tool_use in &turn.tool_uses {
            stats.note_call();
            children.push(dispatch_tool(ctx, agent, tool_use));
        }

        let mut sentinel: Option<String> = None;
        let mut records: Vec<ToolRecord> = Vec::with_capacity(children.len());
        for (tool_use, child) in turn.tool_uses.iter().zip(children) {
            let (output, is_error) = match child {
                Err(message) => (message, true),
                Ok(node) => match node.result().await {
                    Ok(value) => (render_output(&value), false),
                    Err(fault) => {
                        if tool_use.tool_name == RAISE_EXCEPTION_NAME {
                            // Honored after the rest of the batch has been
                            // attempted; the sentinel call itself gets no
                            // tool-result part.
                            sentinel = Some(match &fault {
                                Fault::Agent { message, .. } => message.clone(),
                                other => other.concise(),
                            });
                            continue;
                        }
                        (fault.concise(), true)
                    }
                },
            };
            cell.push_transcript(TranscriptPart::ToolResult {
                tool_use_id: tool_use.tool_use_id.clone(),
                tool_name: tool_use.tool_name.clone(),
                output: output.clone(),
                is_error,
            });
            records.push(ToolRecord {
                tool_use_id: tool_use.tool_use_id.clone(),
                tool_name: tool_use.tool_name.clone(),
                output,
                is_error,
            });
        }

        if let Some(message) = sentinel {
            return Err(Fault::Agent {
                agent: agent.name.clone(),
                node_id,
                message,
            });
        }

        session.record_tool_results(&records);
    }

    Err(Fault::Provider {
        provider,
        agent: agent.name.clone(),
        node_id,
        message: format!(
            "agent loop exceeded {} steps without producing a final answer",
            inner.config.max_steps
        ),
    })
}

/// Create the child invocation for one tool call. Failures become
/// immediate error results in the aggregated batch.
fn dispatch_tool(
    ctx: &RunContext,
    agent: &AgentFunction,
    tool_use: &ToolUseRequest,
) -> Result<Node, String> {
    let func = agent
        .uses
        .iter()
        .find(|f| f.name() == tool_use.tool_name)
        .ok_or_else(|| {
            let available: Vec<&str> = agent.uses.iter().map(|f| f.name()).collect();
            format!(
                "UnknownTool: '{}' is not among the available tools [{}]",
                tool_use.tool_name,
                available.join(", ")
            )
        })?;
    let args = func
        .coerce_json_args(&tool_use.args)
        .map_err(|e| format!("InvalidArgument: {e}"))?;
    ctx.invoke(func, args, None)
        .map_err(|e| format!("InvokeError: {e}"))
}

/// Render a child's output value into the textual tool result.
fn render_output(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Submit one request, retrying transient provider errors on the
/// configured backoff schedule, then giving up.
async fn submit_with_retry(
    inner: &RuntimeInner,
    session: &mut dyn ProviderSession,
    cache: CachePolicy,
) -> Result<ModelTurn, ProviderError> {
    let backoff = &inner.config.retry_backoff;
    let mut attempt = 0usize;
    loop {
        match session.step(cache).await {
            Ok(turn) => return Ok(turn),
            Err(err) if err.transient && attempt < backoff.len() => {
                tracing::debug!(
                    delay_ms = backoff[attempt].as_millis() as u64,
                    error = %err,
                    "transient provider error; backing off"
                );
                tokio::time::sleep(backoff[attempt]).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Re-acquire the tree's model-api permit if a courteous release (or a
/// fresh tree) left the lease empty.
async fn ensure_lease(
    inner: &RuntimeInner,
    lease: &ModelLease,
    provider: Provider,
) -> Result<(), ProviderError> {
    if lease.holds(provider) {
        return Ok(());
    }
    let semaphore = inner.semaphore_for(provider);
    let permit = semaphore
        .acquire_owned()
        .await
        .map_err(|_| ProviderError::fatal("model-api semaphore closed"))?;
    lease.store(provider, permit);
    Ok(())
}

/// Cache-watermark selection.
///
/// No tools: nothing to cache across cycles. Only plain leaf tools (code
/// functions that spawn nothing and never block on a human): the session
/// turns around quickly, so the ephemeral 5-minute tier pays off. Anything
/// else consults how this agent spec actually behaved over its last five
/// completed invocations before paying for the one-hour tier.
fn decide_cache_policy(agent: &AgentFunction, inner: &RuntimeInner) -> CachePolicy {
    if agent.uses.is_empty() {
        return CachePolicy::None;
    }

    let all_plain_leaves = agent.uses.iter().all(|f| match f.as_ref() {
        Function::Code(code) => code.uses.is_empty() && !code.interactive,
        Function::Agent(_) => false,
    });
    if all_plain_leaves {
        return CachePolicy::FiveMinute;
    }

    let records = inner.agent_history(&agent.name);
    if records.is_empty() {
        return CachePolicy::None;
    }
    let total_calls: u32 = records.iter().map(|r| r.tool_calls).sum();
    let avg_calls = f64::from(total_calls) / records.len() as f64;
    let intervals: Vec<Duration> = records.iter().filter_map(|r| r.mean_interval).collect();
    if intervals.is_empty() {
        return CachePolicy::None;
    }
    let mean_interval = intervals.iter().sum::<Duration>() / intervals.len() as u32;
    if avg_calls > 1.0 && mean_interval < ONE_HOUR {
        CachePolicy::OneHour
    } else {
        CachePolicy::None
    }
}

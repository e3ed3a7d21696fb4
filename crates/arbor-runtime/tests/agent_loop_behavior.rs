//! Agent-loop behavior driven through scripted provider sessions:
//! transcript replay order, cache-watermark selection, batch tool
//! dispatch, the raise-exception sentinel, retries, and semaphore
//! courtesy.

use arbor_contract::args::{ArgMap, ArgType, ArgValue, FunctionArg};
use arbor_contract::fault::{Fault, FuncError};
use arbor_contract::provider::{CachePolicy, Provider, ProviderError};
use arbor_contract::testing::{text_turn, tool_turn, usage, ScriptedFactory};
use arbor_contract::transcript::TranscriptPart;
use arbor_contract::view::{FunctionKind, NodeState};
use arbor_runtime::{raise_exception, AgentFunction, CodeFunction, Function, Runtime};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

fn echo_spec() -> Arc<Function> {
    CodeFunction::new(
        "echo",
        "Echo the given text back.",
        vec![FunctionArg::new("text", ArgType::Str, "What to echo.")],
        |_ctx, args| {
            let text = args["text"].as_str().unwrap_or_default().to_string();
            Box::pin(async move { Ok(Value::String(text)) })
        },
    )
    .unwrap()
    .build()
}

fn runtime_with(factory: &Arc<ScriptedFactory>, specs: Vec<Arc<Function>>) -> Runtime {
    Runtime::builder()
        .with_specs(specs)
        .with_session_factory(Provider::Anthropic, factory.clone())
        .with_retry_backoff(vec![Duration::from_millis(1); 2])
        .build()
        .unwrap()
}

fn str_args(pairs: &[(&str, &str)]) -> ArgMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), ArgValue::Str(v.to_string())))
        .collect()
}

#[tokio::test]
async fn leaf_agent_runs_two_cycles_with_ephemeral_cache() {
    let factory = ScriptedFactory::new();
    factory.push_script(
        "echo_agent",
        vec![
            Ok(tool_turn(
                "sig-1",
                &[("tu-1", "echo", json!({"text": "hello"}))],
                usage(100, 10),
            )),
            Ok(text_turn("sig-2", "done: hello", usage(120, 8))),
        ],
    );

    let agent = AgentFunction::new(
        "echo_agent",
        "Echo things via the echo tool.",
        vec![FunctionArg::new("text", ArgType::Str, "Text to echo.")],
        "You echo text using the echo tool.",
        "Echo: {text}",
    )
    .unwrap()
    .with_uses(vec![echo_spec()])
    .unwrap()
    .build();

    let runtime = runtime_with(&factory, vec![agent.clone()]);
    let node = runtime
        .get_ctx()
        .invoke(&agent, str_args(&[("text", "hello")]), None)
        .unwrap();
    assert_eq!(node.result().await.unwrap(), json!("done: hello"));

    // Only non-branching leaf tools: the ephemeral tier, frozen for the
    // invocation and marked on every request.
    assert_eq!(node.cache_policy(), Some(CachePolicy::FiveMinute));
    assert_eq!(
        factory.log.markers(),
        vec![CachePolicy::FiveMinute, CachePolicy::FiveMinute]
    );

    let view = runtime.get_view(node.id()).unwrap();
    assert_eq!(view.kind, FunctionKind::Agent);
    assert_eq!(view.state, NodeState::Success);

    // Transcript part order across both cycles.
    let transcript = view.transcript.clone().unwrap();
    let shapes: Vec<&str> = transcript
        .iter()
        .map(|p| match p {
            TranscriptPart::UserText { .. } => "user",
            TranscriptPart::Thinking { .. } => "thinking",
            TranscriptPart::ToolUse { .. } => "tool_use",
            TranscriptPart::ToolResult { .. } => "tool_result",
            TranscriptPart::ModelText { .. } => "model_text",
        })
        .collect();
    assert_eq!(
        shapes,
        vec!["user", "thinking", "tool_use", "tool_result", "thinking", "model_text"]
    );
    match &transcript[0] {
        TranscriptPart::UserText { text } => assert_eq!(text, "Echo: hello"),
        other => panic!("expected rendered seed, got {other:?}"),
    }
    match &transcript[3] {
        TranscriptPart::ToolResult {
            output, is_error, ..
        } => {
            assert_eq!(output, "hello");
            assert!(!is_error);
        }
        other => panic!("expected tool result, got {other:?}"),
    }

    // Token usage is the sum of both responses.
    let totals = view.usage.clone().unwrap();
    assert_eq!(totals.input_tokens_total, 220);
    assert_eq!(totals.output_tokens_total, 18);

    // The echo child completed inside the agent's subtree.
    assert_eq!(view.children.len(), 1);
    assert_eq!(view.children[0].func, "echo");
    assert_eq!(view.children[0].state, NodeState::Success);

    // The aggregated batch handed back to the provider.
    let records = factory.log.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0][0].tool_use_id, "tu-1");
    assert_eq!(records[0][0].output, "hello");
}

#[tokio::test]
async fn zero_tool_agent_never_emits_a_marker() {
    let factory = ScriptedFactory::new();
    factory.push_script(
        "bare_agent",
        vec![Ok(text_turn("sig-1", "just text", usage(10, 2)))],
    );

    let agent = AgentFunction::new("bare_agent", "", vec![], "system", "user prompt")
        .unwrap()
        .build();
    let runtime = runtime_with(&factory, vec![agent.clone()]);
    let node = runtime.get_ctx().invoke(&agent, ArgMap::new(), None).unwrap();

    assert_eq!(node.result().await.unwrap(), json!("just text"));
    assert_eq!(factory.log.markers(), vec![CachePolicy::None]);
}

#[tokio::test]
async fn raise_exception_in_batch_is_honored_after_the_batch() {
    let factory = ScriptedFactory::new();
    factory.push_script(
        "batch_agent",
        vec![Ok(tool_turn(
            "sig-1",
            &[
                ("tu-1", "echo", json!({"text": "a"})),
                ("tu-2", "raise_exception", json!({"message": "stop"})),
            ],
            usage(50, 5),
        ))],
    );

    let agent = AgentFunction::new(
        "batch_agent",
        "",
        vec![],
        "system",
        "go",
    )
    .unwrap()
    .with_uses(vec![echo_spec(), raise_exception()])
    .unwrap()
    .build();

    let runtime = runtime_with(&factory, vec![agent.clone()]);
    let node = runtime.get_ctx().invoke(&agent, ArgMap::new(), None).unwrap();

    let fault = node.result().await.unwrap_err();
    match &fault {
        Fault::Agent { agent, message, .. } => {
            assert_eq!(agent, "batch_agent");
            assert_eq!(message, "stop");
        }
        other => panic!("expected agent fault, got {other:?}"),
    }

    let view = runtime.get_view(node.id()).unwrap();
    assert_eq!(view.state, NodeState::Error);
    assert_eq!(view.exception.as_deref(), Some("AgentFault: stop"));

    // Both tool calls were attempted: echo succeeded, the sentinel errored.
    assert_eq!(view.children.len(), 2);
    assert_eq!(view.children[0].func, "echo");
    assert_eq!(view.children[0].state, NodeState::Success);
    assert_eq!(view.children[1].func, "raise_exception");
    assert_eq!(view.children[1].state, NodeState::Error);

    // The invocation ended on the sentinel: no tool-result turn went back
    // to the provider.
    assert!(factory.log.records().is_empty());
}

#[tokio::test]
async fn planner_delegates_to_worker_agent() {
    let factory = ScriptedFactory::new();
    factory.push_script(
        "planner",
        vec![
            Ok(tool_turn(
                "sig-p1",
                &[("tu-1", "worker", json!({"goal": "X"}))],
                usage(200, 20),
            )),
            Ok(text_turn("sig-p2", "plan complete", usage(250, 15))),
        ],
    );
    factory.push_script(
        "worker",
        vec![Ok(text_turn("sig-w1", "worker output", usage(80, 9)))],
    );

    let worker = AgentFunction::new(
        "worker",
        "Do one unit of work.",
        vec![FunctionArg::new("goal", ArgType::Str, "What to achieve.")],
        "You are a worker.",
        "Goal: {goal}",
    )
    .unwrap()
    .build();
    let planner = AgentFunction::new(
        "planner",
        "Plan by delegating to the worker.",
        vec![FunctionArg::new("goal", ArgType::Str, "Overall goal.")],
        "You are a planner.",
        "Achieve: {goal}",
    )
    .unwrap()
    .with_uses(vec![worker.clone(), raise_exception()])
    .unwrap()
    .build();

    let runtime = runtime_with(&factory, vec![planner.clone()]);
    let root = runtime
        .get_ctx()
        .invoke(&planner, str_args(&[("goal", "X")]), None)
        .unwrap();
    assert_eq!(root.result().await.unwrap(), json!("plan complete"));

    // Two-level tree: planner -> worker, each with its own transcript.
    let view = runtime.get_view(root.id()).unwrap();
    assert_eq!(view.children.len(), 1);
    let worker_view = &view.children[0];
    assert_eq!(worker_view.func, "worker");
    assert_eq!(worker_view.kind, FunctionKind::Agent);
    assert_eq!(worker_view.state, NodeState::Success);
    assert!(worker_view.transcript.is_some());

    // The worker's final text came back to the planner as a tool result.
    let transcript = view.transcript.clone().unwrap();
    assert!(transcript.iter().any(|p| matches!(
        p,
        TranscriptPart::ToolResult { output, is_error, .. }
            if output == "worker output" && !is_error
    )));

    // A branching tool list with no history: no cache marker anywhere.
    assert_eq!(
        factory.log.markers(),
        vec![CachePolicy::None, CachePolicy::None, CachePolicy::None]
    );

    // Every event in the worker's subtree republished the planner, so the
    // planner's final version is at least as new as the worker's.
    assert!(view.update_seqnum >= worker_view.update_seqnum);
}

#[tokio::test]
async fn tool_argument_errors_are_surfaced_to_the_model() {
    let factory = ScriptedFactory::new();
    factory.push_script(
        "echo_agent",
        vec![
            Ok(tool_turn(
                "sig-1",
                &[("tu-1", "echo", json!({"text": 123}))],
                usage(10, 1),
            )),
            Ok(text_turn("sig-2", "recovered", usage(12, 2))),
        ],
    );

    let agent = AgentFunction::new("echo_agent", "", vec![], "system", "go")
        .unwrap()
        .with_uses(vec![echo_spec()])
        .unwrap()
        .build();
    let runtime = runtime_with(&factory, vec![agent.clone()]);
    let node = runtime.get_ctx().invoke(&agent, ArgMap::new(), None).unwrap();
    assert_eq!(node.result().await.unwrap(), json!("recovered"));

    // The bad call produced an error-flagged result, no child node, and
    // the loop continued.
    let records = factory.log.records();
    assert_eq!(records.len(), 1);
    assert!(records[0][0].is_error);
    assert!(records[0][0].output.starts_with("InvalidArgument:"));
    let view = runtime.get_view(node.id()).unwrap();
    assert!(view.children.is_empty());
}

#[tokio::test]
async fn child_faults_are_rendered_concisely_with_error_flag() {
    let boom = CodeFunction::new("boom", "Always fails.", vec![], |_ctx, _args| {
        Box::pin(async { Err(FuncError::Failed("kaput".into())) })
    })
    .unwrap()
    .build();

    let factory = ScriptedFactory::new();
    factory.push_script(
        "fragile_agent",
        vec![
            Ok(tool_turn("sig-1", &[("tu-1", "boom", json!({}))], usage(10, 1))),
            Ok(text_turn("sig-2", "noted the failure", usage(12, 2))),
        ],
    );

    let agent = AgentFunction::new("fragile_agent", "", vec![], "system", "go")
        .unwrap()
        .with_uses(vec![boom])
        .unwrap()
        .build();
    let runtime = runtime_with(&factory, vec![agent.clone()]);
    let node = runtime.get_ctx().invoke(&agent, ArgMap::new(), None).unwrap();

    // The agent observed the failure textually and decided to finish.
    assert_eq!(node.result().await.unwrap(), json!("noted the failure"));
    let records = factory.log.records();
    assert_eq!(records[0][0].output, "Failed: kaput");
    assert!(records[0][0].is_error);

    let view = runtime.get_view(node.id()).unwrap();
    assert_eq!(view.children[0].state, NodeState::Error);
}

#[tokio::test]
async fn transient_errors_retry_then_succeed() {
    let factory = ScriptedFactory::new();
    factory.push_script(
        "bare_agent",
        vec![
            Err(ProviderError::transient("429 rate limited")),
            Ok(text_turn("sig-1", "after retry", usage(5, 1))),
        ],
    );

    let agent = AgentFunction::new("bare_agent", "", vec![], "system", "go")
        .unwrap()
        .build();
    let runtime = runtime_with(&factory, vec![agent.clone()]);
    let node = runtime.get_ctx().invoke(&agent, ArgMap::new(), None).unwrap();

    assert_eq!(node.result().await.unwrap(), json!("after retry"));
    assert_eq!(factory.log.markers().len(), 2);
}

#[tokio::test]
async fn fatal_errors_become_provider_faults_without_retry() {
    let factory = ScriptedFactory::new();
    factory.push_script(
        "bare_agent",
        vec![Err(ProviderError::fatal("401 unauthorized"))],
    );

    let agent = AgentFunction::new("bare_agent", "", vec![], "system", "go")
        .unwrap()
        .build();
    let runtime = runtime_with(&factory, vec![agent.clone()]);
    let node = runtime.get_ctx().invoke(&agent, ArgMap::new(), None).unwrap();

    let fault = node.result().await.unwrap_err();
    match &fault {
        Fault::Provider {
            provider,
            agent,
            message,
            ..
        } => {
            assert_eq!(*provider, Provider::Anthropic);
            assert_eq!(agent, "bare_agent");
            assert!(message.contains("401"));
        }
        other => panic!("expected provider fault, got {other:?}"),
    }
    assert_eq!(factory.log.markers().len(), 1);
}

#[tokio::test]
async fn exhausted_retries_give_up() {
    let factory = ScriptedFactory::new();
    // Backoff schedule has two entries: three attempts total, all failing.
    factory.push_script(
        "bare_agent",
        vec![
            Err(ProviderError::transient("503")),
            Err(ProviderError::transient("503")),
            Err(ProviderError::transient("503")),
        ],
    );

    let agent = AgentFunction::new("bare_agent", "", vec![], "system", "go")
        .unwrap()
        .build();
    let runtime = runtime_with(&factory, vec![agent.clone()]);
    let node = runtime.get_ctx().invoke(&agent, ArgMap::new(), None).unwrap();

    let fault = node.result().await.unwrap_err();
    assert!(matches!(fault, Fault::Provider { .. }));
    assert_eq!(factory.log.markers().len(), 3);
}

#[tokio::test]
async fn file_inputs_are_read_at_invocation_time() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    std::fs::write(&path, "contents from disk").unwrap();

    let factory = ScriptedFactory::new();
    factory.push_script(
        "reader_agent",
        vec![Ok(text_turn("sig-1", "read it", usage(5, 1)))],
    );

    let agent = AgentFunction::new(
        "reader_agent",
        "",
        vec![FunctionArg::new("notes", ArgType::Str, "Path to notes.")],
        "system",
        "Consider:\n{notes}",
    )
    .unwrap()
    .with_file_args(["notes"])
    .unwrap()
    .build();

    let runtime = runtime_with(&factory, vec![agent.clone()]);
    let node = runtime
        .get_ctx()
        .invoke(
            &agent,
            str_args(&[("notes", path.to_str().unwrap())]),
            None,
        )
        .unwrap();
    node.result().await.unwrap();

    let view = runtime.get_view(node.id()).unwrap();
    let transcript = view.transcript.clone().unwrap();
    match &transcript[0] {
        TranscriptPart::UserText { text } => {
            assert_eq!(text, "Consider:\ncontents from disk");
        }
        other => panic!("expected seed, got {other:?}"),
    }

    // The factory saw the same rendered seed.
    let requests = factory.log.requests.lock().unwrap();
    assert_eq!(requests[0].user_seed, "Consider:\ncontents from disk");
    assert_eq!(requests[0].model, "claude-opus-4-1-20250805");
}

#[tokio::test]
async fn missing_input_file_fails_the_invocation() {
    let factory = ScriptedFactory::new();
    let agent = AgentFunction::new(
        "reader_agent",
        "",
        vec![FunctionArg::new("notes", ArgType::Str, "Path to notes.")],
        "system",
        "{notes}",
    )
    .unwrap()
    .with_file_args(["notes"])
    .unwrap()
    .build();

    let runtime = runtime_with(&factory, vec![agent.clone()]);
    let node = runtime
        .get_ctx()
        .invoke(&agent, str_args(&[("notes", "/nonexistent/xyz.txt")]), None)
        .unwrap();

    let fault = node.result().await.unwrap_err();
    assert!(fault.concise().starts_with("Io:"));
    // The session was never opened.
    assert_eq!(factory.log.request_count(), 0);
}

#[tokio::test]
async fn courteous_release_lets_another_tree_through() {
    let factory = ScriptedFactory::new();
    factory.push_script(
        "agent_a",
        vec![
            Ok(tool_turn("sig-a1", &[("tu-1", "slow_tool", json!({}))], usage(1, 1))),
            Ok(text_turn("sig-a2", "a done", usage(1, 1))),
        ],
    );
    factory.push_script(
        "agent_b",
        vec![Ok(text_turn("sig-b1", "b done", usage(1, 1)))],
    );

    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let started_inner = started.clone();
    let release_inner = release.clone();
    let slow_tool = CodeFunction::new(
        "slow_tool",
        "Long blocking operation that yields the model-api lease.",
        vec![],
        move |ctx, _args| {
            let started = started_inner.clone();
            let release = release_inner.clone();
            Box::pin(async move {
                ctx.yield_model_lease();
                started.notify_one();
                release.notified().await;
                Ok(Value::String("slow done".into()))
            })
        },
    )
    .unwrap()
    .build();

    let agent_a = AgentFunction::new("agent_a", "", vec![], "system", "go")
        .unwrap()
        .with_uses(vec![slow_tool])
        .unwrap()
        .build();
    let agent_b = AgentFunction::new("agent_b", "", vec![], "system", "go")
        .unwrap()
        .build();

    let runtime = Runtime::builder()
        .with_specs(vec![agent_a.clone(), agent_b.clone()])
        .with_session_factory(Provider::Anthropic, factory.clone())
        .with_provider_concurrency(Provider::Anthropic, 1)
        .build()
        .unwrap();
    let ctx = runtime.get_ctx();

    // A starts first and takes the single permit; its tool yields it.
    let a = ctx.invoke(&agent_a, ArgMap::new(), None).unwrap();
    started.notified().await;

    // While A's tool blocks, B (another tree) acquires and completes a
    // whole request.
    let b = ctx.invoke(&agent_b, ArgMap::new(), None).unwrap();
    assert_eq!(b.result().await.unwrap(), json!("b done"));

    // A resumes, re-acquires, and finishes.
    release.notify_one();
    assert_eq!(a.result().await.unwrap(), json!("a done"));

    // B's request happened strictly between A's two requests.
    let events = factory.log.events();
    let a_steps: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.as_str() == "step:agent_a")
        .map(|(i, _)| i)
        .collect();
    let b_step = events
        .iter()
        .position(|e| e == "step:agent_b")
        .expect("agent_b stepped");
    assert_eq!(a_steps.len(), 2);
    assert!(a_steps[0] < b_step && b_step < a_steps[1]);
}

//! Tool loop behaviour: termination, recovery, structured output,
//! concurrency of pure tools.

mod common;

use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use agentweave::agents::{
    AgentDefinition, ChatModel, ToolLoop, ToolLoopConfig, ToolLoopError, MAX_TOOL_ITERATIONS,
};
use agentweave::tools::{ToolFailure, ToolRegistry};
use agentweave::utils::collections::props_from;

use common::agents::{
    agent_def, multi_tool_response, text_response, tool_call_response, ScriptedModel,
};
use common::tools::test_registry;

fn loop_with(
    model: Arc<ScriptedModel>,
    registry: &ToolRegistry,
    tool_refs: &[&str],
    config: ToolLoopConfig,
) -> ToolLoop {
    let bindings = tool_refs
        .iter()
        .map(|r| registry.resolve(r).unwrap())
        .collect();
    let model: Arc<dyn ChatModel> = model;
    ToolLoop::new(model, bindings, config, CancellationToken::new())
}

fn definition() -> AgentDefinition {
    agent_def("agent-test", vec![], None)
}

#[tokio::test]
async fn terminates_in_at_most_max_iterations() {
    let registry = test_registry();
    let model = ScriptedModel::always(tool_call_response("echo", json!({"message": "again"})));
    let tool_loop = loop_with(
        model.clone(),
        &registry,
        &["builtin:echo"],
        ToolLoopConfig::default(),
    );

    let err = tool_loop
        .run(&definition(), &props_from([("input", json!("go"))]))
        .await
        .unwrap_err();
    match err {
        ToolLoopError::BudgetExhausted { iterations, transcript, .. } => {
            assert_eq!(iterations, MAX_TOOL_ITERATIONS);
            assert!(!transcript.is_empty());
        }
        other => panic!("expected BudgetExhausted, got {other:?}"),
    }
    assert_eq!(model.calls(), MAX_TOOL_ITERATIONS);
}

#[tokio::test]
async fn final_text_terminates_the_loop() {
    let registry = test_registry();
    let model = ScriptedModel::new(vec![
        tool_call_response("add", json!({"a": 1, "b": 2})),
        text_response("the sum is 3"),
    ]);
    let tool_loop = loop_with(
        model.clone(),
        &registry,
        &["builtin:add"],
        ToolLoopConfig::default(),
    );

    let result = tool_loop
        .run(&definition(), &props_from([("question", json!("1+2?"))]))
        .await
        .unwrap();
    assert_eq!(result.output, json!("the sum is 3"));
    assert_eq!(result.iterations, 2);
    assert_eq!(result.invocations.len(), 1);
    assert_eq!(result.invocations[0].result.as_ref().unwrap(), &json!(3.0));
    assert!(result.usage.total_tokens > 0);
}

#[tokio::test]
async fn invalid_arguments_surface_as_tool_results() {
    let registry = test_registry();
    let model = ScriptedModel::new(vec![
        tool_call_response("echo", json!({"message": 42})),
        text_response("that did not work"),
    ]);
    let tool_loop = loop_with(
        model.clone(),
        &registry,
        &["builtin:echo"],
        ToolLoopConfig::default(),
    );

    let result = tool_loop
        .run(&definition(), &props_from([("input", json!("hi"))]))
        .await
        .unwrap();

    // The loop completed; the failure went to the model, not the caller.
    assert_eq!(result.output, json!("that did not work"));
    assert!(matches!(
        result.invocations[0].result,
        Err(ToolFailure::InvalidArguments { .. })
    ));
    let tool_msg = result
        .transcript
        .iter()
        .find(|m| m.tool_call_id.is_some())
        .unwrap();
    assert!(tool_msg.content.contains("INVALID_ARGUMENTS"));
}

#[tokio::test]
async fn unbound_tool_calls_become_unavailable_results() {
    let registry = test_registry();
    let model = ScriptedModel::new(vec![
        tool_call_response("launch_missiles", json!({})),
        text_response("never mind"),
    ]);
    let tool_loop = loop_with(
        model,
        &registry,
        &["builtin:echo"],
        ToolLoopConfig::default(),
    );

    let result = tool_loop
        .run(&definition(), &props_from([("input", json!("x"))]))
        .await
        .unwrap();
    assert!(matches!(
        result.invocations[0].result,
        Err(ToolFailure::ToolUnavailable { .. })
    ));
}

#[tokio::test]
async fn structured_output_validates_and_retries_once() {
    let registry = test_registry();
    let mut definition = definition();
    definition.output_schema = Some(json!({
        "type": "object",
        "properties": {"answer": {"type": "integer"}},
        "required": ["answer"]
    }));

    // First response is prose; the correction round produces valid JSON.
    let model = ScriptedModel::new(vec![
        text_response("the answer is three"),
        text_response("{\"answer\": 3}"),
    ]);
    let tool_loop = loop_with(model.clone(), &registry, &[], ToolLoopConfig::default());

    let result = tool_loop
        .run(&definition, &props_from([("q", json!("2+1?"))]))
        .await
        .unwrap();
    assert_eq!(result.output, json!({"answer": 3}));
    assert_eq!(result.iterations, 2);
    assert_eq!(model.calls(), 2);
}

#[tokio::test]
async fn structured_output_fails_after_second_violation() {
    let registry = test_registry();
    let mut definition = definition();
    definition.output_schema = Some(json!({"type": "object"}));

    let model = ScriptedModel::always(text_response("still not json"));
    let tool_loop = loop_with(model, &registry, &[], ToolLoopConfig::default());

    let err = tool_loop
        .run(&definition, &props_from([("q", json!("?"))]))
        .await
        .unwrap_err();
    assert!(matches!(err, ToolLoopError::SchemaValidation { .. }));
}

#[tokio::test]
async fn pure_tool_calls_run_concurrently() {
    let mut registry = ToolRegistry::new();
    registry.register_builtin(common::tools::AddTool::slow(Duration::from_millis(150)));

    let model = ScriptedModel::new(vec![
        multi_tool_response(vec![
            ("add", json!({"a": 1, "b": 1})),
            ("add", json!({"a": 2, "b": 2})),
            ("add", json!({"a": 3, "b": 3})),
        ]),
        text_response("done adding"),
    ]);
    let tool_loop = loop_with(
        model,
        &registry,
        &["builtin:add"],
        ToolLoopConfig::default(),
    );

    let started = Instant::now();
    let result = tool_loop
        .run(&definition(), &props_from([("input", json!("sum"))]))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.invocations.len(), 3);
    // Three 150ms pure calls in parallel finish well under the serial 450ms.
    assert!(
        elapsed < Duration::from_millis(400),
        "tool calls appear serialized: {elapsed:?}"
    );
}

#[tokio::test]
async fn cancellation_stops_the_loop() {
    let registry = test_registry();
    let model = ScriptedModel::always(tool_call_response("echo", json!({"message": "x"})));
    let bindings = vec![registry.resolve("builtin:echo").unwrap()];
    let cancel = CancellationToken::new();
    let model_dyn: Arc<dyn ChatModel> = model;
    let tool_loop = ToolLoop::new(
        model_dyn,
        bindings,
        ToolLoopConfig::default(),
        cancel.clone(),
    );

    cancel.cancel();
    let err = tool_loop
        .run(&definition(), &props_from([("input", json!("x"))]))
        .await
        .unwrap_err();
    assert!(matches!(err, ToolLoopError::Cancelled));
}

//! End-to-end scenarios over compiled graphs with scripted models.

mod common;

use serde_json::json;

use agentweave::event_bus::Event;
use agentweave::graph::spec::JoinNodeConfig;
use agentweave::graph::GraphBuilder;
use agentweave::runtime::{Checkpointer, ExecutionRequest};
use agentweave::types::{ExecutionStatus, NodeType};

use common::agents::{
    agent_def, array_schema, int_schema, text_response, tool_call_response, ScriptedModel,
};
use common::fixtures::{event_names, harness, wait_for_terminal};
use common::tools::test_registry;

/// Linear AGENT chain: start → a → b → end. `a` writes x=2, `b` reads $.x
/// and writes y=3.
#[tokio::test]
async fn linear_agent_chain() {
    let spec = GraphBuilder::new("linear")
        .state_schema(json!({
            "properties": {"x": {"type": "integer"}, "y": {"type": "integer"}}
        }))
        .node(
            "a",
            NodeType::Agent,
            json!({"agent_id": "agent-a", "output_key": "x"}),
        )
        .node(
            "b",
            NodeType::Agent,
            json!({
                "agent_id": "agent-b",
                "output_key": "y",
                "input_mapping": {"val": "$.x"}
            }),
        )
        .edge("__start__", "a")
        .edge("a", "b")
        .edge("b", "__end__")
        .build();

    let model_a = ScriptedModel::text("2");
    let model_b = ScriptedModel::text("3");
    let h = harness(
        spec,
        vec![
            (agent_def("agent-a", vec![], int_schema()), model_a.clone()),
            (agent_def("agent-b", vec![], int_schema()), model_b.clone()),
        ],
        test_registry(),
    )
    .await;

    let response = h.runner.run(ExecutionRequest::default()).await.unwrap();
    assert_eq!(response.status, ExecutionStatus::Completed);

    let output = response.output.unwrap();
    assert_eq!(output["x"], json!(2));
    assert_eq!(output["y"], json!(3));

    // One checkpoint per super-step (plus the initial one).
    let latest = h
        .checkpointer
        .load_latest(&response.thread_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.step_index, 2);

    // Causal ordering: b read x after a wrote it.
    let steps = h.checkpointer.steps(&response.execution_id).await.unwrap();
    assert_eq!(steps.len(), 2);
    let step_a = steps.iter().find(|s| s.node_id == "a").unwrap();
    let step_b = steps.iter().find(|s| s.node_id == "b").unwrap();
    assert!(step_a.step_index < step_b.step_index);
    assert_eq!(step_b.input_snapshot["x"], json!(2));

    // Event grammar for the whole execution.
    let events = wait_for_terminal(&h.sink).await;
    assert_eq!(
        event_names(&events),
        vec![
            "execution_start",
            "node_start",
            "node_complete",
            "node_start",
            "node_complete",
            "execution_complete",
        ]
    );
    assert_eq!(model_a.calls(), 1);
    assert_eq!(model_b.calls(), 1);
}

/// Router short-circuit: default route completes without visiting the
/// conditional path; a confirmed plan visits it exactly once.
#[tokio::test]
async fn router_short_circuit() {
    let spec = || {
        GraphBuilder::new("router")
            .state_schema(json!({
                "properties": {"plan_confirmed": {"type": "boolean"}}
            }))
            .router_node("r")
            .node(
                "path",
                NodeType::Agent,
                json!({"agent_id": "agent-path", "output_key": "path_out"}),
            )
            .edge("__start__", "r")
            .conditional_edge("r", "path", "state.get(\"plan_confirmed\", false) == true")
            .edge("r", "__end__")
            .edge("path", "__end__")
            .build()
    };

    // Empty input: the default edge wins and `path` never runs.
    let model = ScriptedModel::text("unused");
    let h = harness(
        spec(),
        vec![(agent_def("agent-path", vec![], None), model.clone())],
        test_registry(),
    )
    .await;
    let response = h
        .runner
        .run(ExecutionRequest {
            input: json!({}),
            ..ExecutionRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(response.status, ExecutionStatus::Completed);
    assert_eq!(model.calls(), 0);

    // Confirmed: the conditional edge fires and `path` runs exactly once.
    let model = ScriptedModel::text("went down the path");
    let h = harness(
        spec(),
        vec![(agent_def("agent-path", vec![], None), model.clone())],
        test_registry(),
    )
    .await;
    let response = h
        .runner
        .run(ExecutionRequest {
            input: json!({"plan_confirmed": true}),
            ..ExecutionRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(response.status, ExecutionStatus::Completed);
    assert_eq!(model.calls(), 1);

    let steps = h.checkpointer.steps(&response.execution_id).await.unwrap();
    let path_runs = steps.iter().filter(|s| s.node_id == "path").count();
    assert_eq!(path_runs, 1);
}

/// Parallel fan-out with an append_list join: three branches each emit one
/// item; the merged list holds all three and the join fires strictly after
/// every branch.
#[tokio::test]
async fn parallel_fan_out_and_join() {
    let spec = GraphBuilder::new("parallel")
        .state_schema(json!({
            "properties": {"items": {"type": "array", "merge": "append_list"}}
        }))
        .parallel_node("p")
        .node(
            "a",
            NodeType::Agent,
            json!({"agent_id": "agent-a", "output_key": "items"}),
        )
        .node(
            "b",
            NodeType::Agent,
            json!({"agent_id": "agent-b", "output_key": "items"}),
        )
        .node(
            "c",
            NodeType::Agent,
            json!({"agent_id": "agent-c", "output_key": "items"}),
        )
        .join_node(
            "j",
            JoinNodeConfig {
                wait_for: vec!["a".into(), "b".into(), "c".into()],
                aggregation_strategy: "append_list".into(),
                output_key: "parallel_results".into(),
                failure_policy: Default::default(),
            },
        )
        .edge("__start__", "p")
        .edge("p", "a")
        .edge("p", "b")
        .edge("p", "c")
        .edge("a", "j")
        .edge("b", "j")
        .edge("c", "j")
        .edge("j", "__end__")
        .build();

    let models = [
        ScriptedModel::text("[1]"),
        ScriptedModel::text("[2]"),
        ScriptedModel::text("[3]"),
    ];
    let h = harness(
        spec,
        vec![
            (agent_def("agent-a", vec![], array_schema()), models[0].clone()),
            (agent_def("agent-b", vec![], array_schema()), models[1].clone()),
            (agent_def("agent-c", vec![], array_schema()), models[2].clone()),
        ],
        test_registry(),
    )
    .await;

    let response = h.runner.run(ExecutionRequest::default()).await.unwrap();
    assert_eq!(response.status, ExecutionStatus::Completed);

    let output = response.output.unwrap();
    let mut items: Vec<i64> = output["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_i64().unwrap())
        .collect();
    items.sort_unstable();
    assert_eq!(items, vec![1, 2, 3]);
    assert_eq!(output["parallel_results"]["items"], json!([1, 2, 3]));

    // The join's step is strictly greater than every branch step.
    let steps = h.checkpointer.steps(&response.execution_id).await.unwrap();
    let join_step = steps.iter().find(|s| s.node_id == "j").unwrap().step_index;
    for branch in ["a", "b", "c"] {
        let branch_step = steps
            .iter()
            .find(|s| s.node_id == branch)
            .unwrap()
            .step_index;
        assert!(branch_step < join_step, "{branch} ran after the join");
    }
}

/// Pause/resume wizard: the first call suspends awaiting confirmation; the
/// second call on the same thread completes without replaying phase one.
#[tokio::test]
async fn pause_and_resume_wizard() {
    let spec = GraphBuilder::new("wizard")
        .state_schema(json!({
            "properties": {
                "plan_confirmed": {"type": "boolean"},
                "plan": {"type": "array", "merge": "replace"}
            }
        }))
        .node(
            "plan",
            NodeType::Agent,
            json!({"agent_id": "agent-plan", "output_key": "draft"}),
        )
        .router_node("confirm")
        .node(
            "apply",
            NodeType::Agent,
            json!({"agent_id": "agent-apply", "output_key": "result"}),
        )
        .edge("__start__", "plan")
        .edge("plan", "confirm")
        .conditional_edge("confirm", "apply", "state.get(\"plan_confirmed\", false) == true")
        .edge("confirm", "__end__")
        .edge("apply", "__end__")
        .build();

    let plan_model = ScriptedModel::text("1. draft the plan");
    let apply_model = ScriptedModel::text("plan applied");
    let h = harness(
        spec,
        vec![
            (agent_def("agent-plan", vec![], None), plan_model.clone()),
            (agent_def("agent-apply", vec![], None), apply_model.clone()),
        ],
        test_registry(),
    )
    .await;

    let first = h
        .runner
        .run(ExecutionRequest {
            input: json!({"topic": "migration"}),
            interrupt_before: vec!["confirm".to_string()],
            ..ExecutionRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(first.status, ExecutionStatus::AwaitingInput);
    assert!(first.awaiting_input_reason.unwrap().contains("confirm"));
    assert_eq!(plan_model.calls(), 1);
    assert_eq!(apply_model.calls(), 0);

    let second = h
        .runner
        .run(ExecutionRequest {
            thread_id: Some(first.thread_id.clone()),
            input: json!({"plan_confirmed": true, "plan": ["step one"]}),
            ..ExecutionRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(second.status, ExecutionStatus::Completed);
    assert_eq!(second.thread_id, first.thread_id);

    let output = second.output.unwrap();
    assert_eq!(output["result"], json!("plan applied"));
    assert_eq!(output["draft"], json!("1. draft the plan"));

    // Total LLM calls are the sum of both phases: nothing replayed.
    assert_eq!(plan_model.calls(), 1);
    assert_eq!(apply_model.calls(), 1);
}

/// Tool failure recovery: the tool times out, the model reads the error
/// result and apologises; the node still completes.
#[tokio::test]
async fn tool_failure_recovery() {
    let spec = GraphBuilder::new("recovery")
        .node(
            "helper",
            NodeType::Agent,
            json!({"agent_id": "agent-helper", "output_key": "answer"}),
        )
        .edge("__start__", "helper")
        .edge("helper", "__end__")
        .build();

    let model = ScriptedModel::new(vec![
        tool_call_response("sleepy", json!({})),
        text_response("sorry, the lookup timed out"),
    ]);
    let h = harness(
        spec,
        vec![(
            agent_def("agent-helper", vec!["builtin:sleepy"], None),
            model.clone(),
        )],
        test_registry(),
    )
    .await;

    let response = h.runner.run(ExecutionRequest::default()).await.unwrap();
    assert_eq!(response.status, ExecutionStatus::Completed);
    assert_eq!(
        response.output.unwrap()["answer"],
        json!("sorry, the lookup timed out")
    );
    assert_eq!(model.calls(), 2);

    let steps = h.checkpointer.steps(&response.execution_id).await.unwrap();
    let helper = steps.iter().find(|s| s.node_id == "helper").unwrap();
    assert!(helper.error.is_none());
    let tool_results: Vec<_> = helper
        .events
        .iter()
        .filter(|e| matches!(e, Event::ToolResult { ok: false, .. }))
        .collect();
    assert_eq!(tool_results.len(), 1, "one failed tool invocation recorded");

    let events = wait_for_terminal(&h.sink).await;
    let names = event_names(&events);
    let call_pos = names.iter().position(|n| *n == "tool_call").unwrap();
    let result_pos = names.iter().position(|n| *n == "tool_result").unwrap();
    assert!(call_pos < result_pos);
}

/// Budget exhaustion: a model that only ever asks for tools exhausts its
/// three iterations; the node errors and the execution fails.
#[tokio::test]
async fn budget_exhaustion_fails_node() {
    let spec = GraphBuilder::new("budget")
        .node(
            "looper",
            NodeType::Agent,
            json!({
                "agent_id": "agent-loop",
                "output_key": "never",
                "max_iterations": 3
            }),
        )
        .edge("__start__", "looper")
        .edge("looper", "__end__")
        .build();

    let model = ScriptedModel::always(tool_call_response("echo", json!({"message": "again"})));
    let h = harness(
        spec,
        vec![(
            agent_def("agent-loop", vec!["builtin:echo"], None),
            model.clone(),
        )],
        test_registry(),
    )
    .await;

    let response = h.runner.run(ExecutionRequest::default()).await.unwrap();
    assert_eq!(response.status, ExecutionStatus::Failed);
    let error = response.error.unwrap();
    assert!(error.contains("TOOL_LOOP_BUDGET_EXHAUSTED"), "error: {error}");
    assert_eq!(model.calls(), 3);

    let events = wait_for_terminal(&h.sink).await;
    let node_errors = events
        .iter()
        .filter(|e| matches!(e, Event::NodeError { .. }))
        .count();
    assert_eq!(node_errors, 1);
}

/// Cancellation: after the signal no node completes and the execution ends
/// CANCELLED, with the cancelled event on the stream.
#[tokio::test]
async fn cancellation_discards_in_flight_work() {
    let spec = GraphBuilder::new("cancel")
        .node(
            "slow",
            NodeType::Agent,
            json!({"agent_id": "agent-slow", "output_key": "out"}),
        )
        .edge("__start__", "slow")
        .edge("slow", "__end__")
        .build();

    let model = ScriptedModel::text("too late").with_delay(std::time::Duration::from_secs(5));
    let h = harness(
        spec,
        vec![(agent_def("agent-slow", vec![], None), model.clone())],
        test_registry(),
    )
    .await;

    let mut stream = h.runner.events();
    let runner = h.runner.clone();
    let handle = tokio::spawn(async move { runner.run(ExecutionRequest::default()).await });

    let execution_id = loop {
        match stream.recv().await.expect("event stream open") {
            Event::ExecutionStart { execution_id, .. } => break execution_id,
            _ => continue,
        }
    };
    assert!(h.runner.cancel(&execution_id));

    let response = handle.await.unwrap().unwrap();
    assert_eq!(response.status, ExecutionStatus::Cancelled);

    let events = wait_for_terminal(&h.sink).await;
    assert!(events
        .iter()
        .all(|e| !matches!(e, Event::NodeComplete { .. })));
    assert!(matches!(
        events.last().unwrap(),
        Event::ExecutionCancelled { .. }
    ));

    // No node step records were written for the cancelled super-step.
    let steps = h.checkpointer.steps(&execution_id).await.unwrap();
    assert!(steps.is_empty());
}

/// Join failure policies: `any` fails the join as soon as one predecessor
/// fails; `all_required` lets the healthy branch's delta through.
#[tokio::test]
async fn join_failure_policy() {
    fn build(policy: &str) -> agentweave::graph::GraphSpec {
        GraphBuilder::new("policies")
            .state_schema(json!({
                "properties": {"items": {"type": "array", "merge": "append_list"}}
            }))
            .parallel_node("p")
            .node(
                "ok",
                NodeType::Agent,
                json!({"agent_id": "agent-ok", "output_key": "items"}),
            )
            .node(
                "bad",
                NodeType::Agent,
                json!({"agent_id": "agent-bad", "output_key": "items", "max_iterations": 1}),
            )
            .join_node(
                "j",
                serde_json::from_value(json!({
                    "wait_for": ["ok", "bad"],
                    "aggregation_strategy": "append_list",
                    "failure_policy": policy
                }))
                .unwrap(),
            )
            .edge("__start__", "p")
            .edge("p", "ok")
            .edge("p", "bad")
            .edge("ok", "j")
            .edge("bad", "j")
            .edge("j", "__end__")
            .build()
    }

    async fn run(policy: &str) -> agentweave::runtime::ExecutionResponse {
        let ok_model = ScriptedModel::text("[10]");
        // Only ever asks for tools, so a 1-iteration budget always fails.
        let bad_model =
            ScriptedModel::always(tool_call_response("echo", json!({"message": "x"})));
        let h = harness(
            build(policy),
            vec![
                (
                    agent_def("agent-ok", vec![], array_schema()),
                    ok_model.clone(),
                ),
                (
                    agent_def("agent-bad", vec!["builtin:echo"], None),
                    bad_model.clone(),
                ),
            ],
            test_registry(),
        )
        .await;
        h.runner.run(ExecutionRequest::default()).await.unwrap()
    }

    let any = run("any").await;
    assert_eq!(any.status, ExecutionStatus::Failed);
    assert!(any.error.unwrap().contains("JOIN_FAILED"));

    let lenient = run("all_required").await;
    assert_eq!(lenient.status, ExecutionStatus::Completed);
    let output = lenient.output.unwrap();
    assert_eq!(output["items"], json!([10]));
}

/// Catch edges: a failing node routes to its on_error target, which can
/// read the recorded error.
#[tokio::test]
async fn catch_edge_routes_failures() {
    let spec = GraphBuilder::new("catch")
        .node(
            "fragile",
            NodeType::Agent,
            json!({"agent_id": "agent-fragile", "output_key": "out", "max_iterations": 1}),
        )
        .node(
            "cleanup",
            NodeType::Agent,
            json!({
                "agent_id": "agent-cleanup",
                "output_key": "cleaned",
                "input_mapping": {"why": "$.last_error.kind || \"unknown\""}
            }),
        )
        .edge("__start__", "fragile")
        .edge("fragile", "__end__")
        .catch_edge("fragile", "cleanup")
        .edge("cleanup", "__end__")
        .build();

    let fragile = ScriptedModel::always(tool_call_response("echo", json!({"message": "x"})));
    let cleanup = ScriptedModel::text("tidied up");
    let h = harness(
        spec,
        vec![
            (
                agent_def("agent-fragile", vec!["builtin:echo"], None),
                fragile,
            ),
            (agent_def("agent-cleanup", vec![], None), cleanup.clone()),
        ],
        test_registry(),
    )
    .await;

    let response = h.runner.run(ExecutionRequest::default()).await.unwrap();
    assert_eq!(response.status, ExecutionStatus::Completed);
    assert_eq!(response.output.unwrap()["cleaned"], json!("tidied up"));
    assert_eq!(cleanup.calls(), 1);
}

/// Dynamic fan-out: one dispatch per array element, each branch seeing its
/// own `parallel_item`.
#[tokio::test]
async fn dynamic_fan_out_dispatches_per_item() {
    let spec = GraphBuilder::new("fanout")
        .state_schema(json!({
            "properties": {
                "docs": {"type": "array", "merge": "replace"},
                "summaries": {"type": "array", "merge": "append_list"}
            }
        }))
        .node(
            "p",
            NodeType::Parallel,
            json!({"fan_out_key": "docs"}),
        )
        .node(
            "worker",
            NodeType::Agent,
            json!({
                "agent_id": "agent-worker",
                "output_key": "summaries",
                "input_mapping": {"doc": "$.parallel_item"}
            }),
        )
        .node(
            "other",
            NodeType::Agent,
            json!({
                "agent_id": "agent-other",
                "output_key": "summaries",
                "input_mapping": {"doc": "$.parallel_item"}
            }),
        )
        .join_node(
            "j",
            JoinNodeConfig {
                wait_for: vec!["worker".into(), "other".into()],
                aggregation_strategy: "append_list".into(),
                output_key: "gathered".into(),
                failure_policy: Default::default(),
            },
        )
        .edge("__start__", "p")
        .edge("p", "worker")
        .edge("p", "other")
        .edge("worker", "j")
        .edge("other", "j")
        .edge("j", "__end__")
        .build();

    let worker = ScriptedModel::always(text_response("[\"s\"]"));
    let other = ScriptedModel::always(text_response("[\"o\"]"));
    let h = harness(
        spec,
        vec![
            (
                agent_def("agent-worker", vec![], array_schema()),
                worker.clone(),
            ),
            (
                agent_def("agent-other", vec![], array_schema()),
                other.clone(),
            ),
        ],
        test_registry(),
    )
    .await;

    let response = h
        .runner
        .run(ExecutionRequest {
            input: json!({"docs": ["d1", "d2", "d3"]}),
            ..ExecutionRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(response.status, ExecutionStatus::Completed);

    // Three items × two branches = six dispatches, one model call each.
    assert_eq!(worker.calls(), 3);
    assert_eq!(other.calls(), 3);
    let output = response.output.unwrap();
    assert_eq!(output["summaries"].as_array().unwrap().len(), 6);
}

//! Compiler validation: every class of graph error surfaces at compile
//! time with a specific error kind.

mod common;

use serde_json::json;
use std::sync::Arc;

use agentweave::graph::{CompileError, Compiler, GraphBuilder, GraphSpec};
use agentweave::types::NodeType;

use common::agents::{agent_def, MapResolver};
use common::tools::test_registry;

fn compiler(resolver: MapResolver) -> Compiler {
    Compiler::new(Arc::new(resolver)).with_tools(Arc::new(test_registry()))
}

fn default_resolver() -> MapResolver {
    MapResolver::new()
        .with_agent(agent_def("agent-a", vec![], None))
        .with_agent(agent_def("agent-b", vec![], None))
}

async fn compile(spec: GraphSpec) -> Result<(), CompileError> {
    compiler(default_resolver()).compile(&spec).await.map(|_| ())
}

fn agent(node_id: &str, agent_id: &str) -> (String, NodeType, serde_json::Value) {
    (
        node_id.to_string(),
        NodeType::Agent,
        json!({"agent_id": agent_id, "output_key": node_id}),
    )
}

fn linear_spec() -> GraphSpec {
    let (a_id, a_ty, a_cfg) = agent("a", "agent-a");
    GraphBuilder::new("ok")
        .node(a_id, a_ty, a_cfg)
        .edge("__start__", "a")
        .edge("a", "__end__")
        .build()
}

#[tokio::test]
async fn valid_linear_graph_compiles() {
    let graph = compiler(default_resolver())
        .compile(&linear_spec())
        .await
        .unwrap();
    assert_eq!(graph.entry.len(), 1);
    assert!(graph.node("a").is_some());
}

#[tokio::test]
async fn duplicate_node_ids_rejected() {
    let (id, ty, cfg) = agent("a", "agent-a");
    let spec = GraphBuilder::new("dup")
        .node(id.clone(), ty, cfg.clone())
        .node(id, ty, cfg)
        .edge("__start__", "a")
        .edge("a", "__end__")
        .build();
    assert!(matches!(
        compile(spec).await,
        Err(CompileError::DuplicateNode { .. })
    ));
}

#[tokio::test]
async fn unknown_edge_endpoint_rejected() {
    let (id, ty, cfg) = agent("a", "agent-a");
    let spec = GraphBuilder::new("ghost")
        .node(id, ty, cfg)
        .edge("__start__", "a")
        .edge("a", "ghost")
        .build();
    assert!(matches!(
        compile(spec).await,
        Err(CompileError::UnknownEndpoint { unknown, .. }) if unknown == "ghost"
    ));
}

#[tokio::test]
async fn missing_entry_rejected() {
    let (id, ty, cfg) = agent("a", "agent-a");
    let spec = GraphBuilder::new("no-entry")
        .node(id, ty, cfg)
        .edge("a", "__end__")
        .build();
    assert!(matches!(compile(spec).await, Err(CompileError::MissingEntry)));
}

#[tokio::test]
async fn agent_fan_out_rejected() {
    let (a_id, a_ty, a_cfg) = agent("a", "agent-a");
    let (b_id, b_ty, b_cfg) = agent("b", "agent-b");
    let spec = GraphBuilder::new("fanout")
        .node(a_id, a_ty, a_cfg)
        .node(b_id, b_ty, b_cfg)
        .edge("__start__", "a")
        .edge("a", "b")
        .edge("a", "__end__")
        .edge("b", "__end__")
        .build();
    assert!(matches!(
        compile(spec).await,
        Err(CompileError::NodeShape { node_id, .. }) if node_id == "a"
    ));
}

#[tokio::test]
async fn parallel_needs_two_branches() {
    let (a_id, a_ty, a_cfg) = agent("a", "agent-a");
    let spec = GraphBuilder::new("narrow")
        .parallel_node("p")
        .node(a_id, a_ty, a_cfg)
        .edge("__start__", "p")
        .edge("p", "a")
        .edge("a", "__end__")
        .build();
    assert!(matches!(
        compile(spec).await,
        Err(CompileError::NodeShape { node_id, .. }) if node_id == "p"
    ));
}

#[tokio::test]
async fn join_wait_for_must_match_incoming() {
    let (a_id, a_ty, a_cfg) = agent("a", "agent-a");
    let (b_id, b_ty, b_cfg) = agent("b", "agent-b");
    let spec = GraphBuilder::new("mismatch")
        .parallel_node("p")
        .node(a_id, a_ty, a_cfg)
        .node(b_id, b_ty, b_cfg)
        .node(
            "j",
            NodeType::Join,
            json!({"wait_for": ["a", "someone_else"]}),
        )
        .edge("__start__", "p")
        .edge("p", "a")
        .edge("p", "b")
        .edge("a", "j")
        .edge("b", "j")
        .edge("j", "__end__")
        .build();
    assert!(matches!(
        compile(spec).await,
        Err(CompileError::WaitForMismatch { .. })
    ));
}

#[tokio::test]
async fn conditions_only_on_router_edges() {
    let (a_id, a_ty, a_cfg) = agent("a", "agent-a");
    let spec = GraphBuilder::new("sneaky")
        .node(a_id, a_ty, a_cfg)
        .edge("__start__", "a")
        .conditional_edge("a", "__end__", "state.get('x', false)")
        .build();
    assert!(matches!(
        compile(spec).await,
        Err(CompileError::InvalidEdge { .. })
    ));
}

#[tokio::test]
async fn unconditional_cycle_rejected() {
    // a -> p -> a is a loop with no router anywhere in it.
    let (a_id, a_ty, a_cfg) = agent("a", "agent-a");
    let spec = GraphBuilder::new("loop")
        .node(a_id, a_ty, a_cfg)
        .parallel_node("p")
        .edge("__start__", "a")
        .edge("a", "p")
        .edge("p", "a")
        .edge("p", "__end__")
        .build();
    assert!(matches!(
        compile(spec).await,
        Err(CompileError::UnconditionalCycle { .. })
    ));
}

#[tokio::test]
async fn router_broken_cycle_compiles() {
    let (a_id, a_ty, a_cfg) = agent("a", "agent-a");
    let spec = GraphBuilder::new("retry-loop")
        .state_schema(json!({"properties": {"retry": {"type": "boolean"}}}))
        .node(a_id, a_ty, a_cfg)
        .router_node("r")
        .edge("__start__", "a")
        .edge("a", "r")
        .conditional_edge("r", "a", "state.get('retry', false)")
        .edge("r", "__end__")
        .build();
    assert!(compile(spec).await.is_ok());
}

#[tokio::test]
async fn end_must_be_reachable() {
    let (a_id, a_ty, a_cfg) = agent("a", "agent-a");
    let (b_id, b_ty, b_cfg) = agent("b", "agent-b");
    let spec = GraphBuilder::new("trapped")
        .node(a_id, a_ty, a_cfg)
        .node(b_id, b_ty, b_cfg)
        .edge("__start__", "a")
        .edge("a", "b")
        .edge("b", "a")
        .build();
    assert!(matches!(
        compile(spec).await,
        Err(CompileError::EndUnreachable)
    ));
}

#[tokio::test]
async fn parallel_branches_must_share_a_join() {
    let (a_id, a_ty, a_cfg) = agent("a", "agent-a");
    let (b_id, b_ty, b_cfg) = agent("b", "agent-b");
    let spec = GraphBuilder::new("twojoins")
        .parallel_node("p")
        .node(a_id, a_ty, a_cfg)
        .node(b_id, b_ty, b_cfg)
        .node("j1", NodeType::Join, json!({"wait_for": ["a", "x"]}))
        .node("j2", NodeType::Join, json!({"wait_for": ["b", "y"]}))
        .node("x", NodeType::Agent, json!({"agent_id": "agent-a"}))
        .node("y", NodeType::Agent, json!({"agent_id": "agent-b"}))
        .edge("__start__", "p")
        .edge("p", "a")
        .edge("p", "b")
        .edge("a", "j1")
        .edge("x", "j1")
        .edge("b", "j2")
        .edge("y", "j2")
        .edge("j1", "__end__")
        .edge("j2", "__end__")
        .edge("__start__", "x")
        .edge("__start__", "y")
        .build();
    assert!(matches!(
        compile(spec).await,
        Err(CompileError::AmbiguousJoin { .. })
    ));
}

#[tokio::test]
async fn unknown_join_strategy_rejected() {
    let (a_id, a_ty, a_cfg) = agent("a", "agent-a");
    let (b_id, b_ty, b_cfg) = agent("b", "agent-b");
    let spec = GraphBuilder::new("strategy")
        .parallel_node("p")
        .node(a_id, a_ty, a_cfg)
        .node(b_id, b_ty, b_cfg)
        .node(
            "j",
            NodeType::Join,
            json!({"wait_for": ["a", "b"], "aggregation_strategy": "blend"}),
        )
        .edge("__start__", "p")
        .edge("p", "a")
        .edge("p", "b")
        .edge("a", "j")
        .edge("b", "j")
        .edge("j", "__end__")
        .build();
    match compile(spec).await {
        Err(CompileError::UnknownStrategy {
            strategy,
            available,
            ..
        }) => {
            assert_eq!(strategy, "blend");
            assert!(available.contains(&"append_list".to_string()));
        }
        other => panic!("expected UnknownStrategy, got {other:?}"),
    }
}

#[tokio::test]
async fn unresolved_agent_rejected() {
    let spec = GraphBuilder::new("missing-agent")
        .node("a", NodeType::Agent, json!({"agent_id": "nobody"}))
        .edge("__start__", "a")
        .edge("a", "__end__")
        .build();
    assert!(matches!(
        compile(spec).await,
        Err(CompileError::Resolve(_))
    ));
}

#[tokio::test]
async fn unresolved_tool_rejected() {
    let resolver = MapResolver::new()
        .with_agent(agent_def("agent-armed", vec!["builtin:chainsaw"], None));
    let spec = GraphBuilder::new("missing-tool")
        .node("a", NodeType::Agent, json!({"agent_id": "agent-armed"}))
        .edge("__start__", "a")
        .edge("a", "__end__")
        .build();
    assert!(matches!(
        compiler(resolver).compile(&spec).await,
        Err(CompileError::Tool { .. })
    ));
}

#[tokio::test]
async fn subgraph_recursion_hits_depth_limit() {
    // A workflow whose subgraph is itself recurses until the limit.
    let spec = GraphBuilder::new("recursive")
        .subgraph_node("child", "recursive", "child_out")
        .edge("__start__", "child")
        .edge("child", "__end__")
        .build();
    let resolver = MapResolver::new().with_workflow("recursive", spec.clone());
    assert!(matches!(
        compiler(resolver).compile(&spec).await,
        Err(CompileError::DepthExceeded { limit: 4 })
    ));
}

#[tokio::test]
async fn malformed_condition_rejected() {
    let (a_id, a_ty, a_cfg) = agent("a", "agent-a");
    let spec = GraphBuilder::new("bad-cond")
        .router_node("r")
        .node(a_id, a_ty, a_cfg)
        .edge("__start__", "r")
        .conditional_edge("r", "a", "open('/etc/passwd')")
        .edge("r", "__end__")
        .edge("a", "__end__")
        .build();
    assert!(matches!(
        compile(spec).await,
        Err(CompileError::Condition { .. })
    ));
}

#[tokio::test]
async fn malformed_mapping_rejected() {
    let spec = GraphBuilder::new("bad-map")
        .node(
            "a",
            NodeType::Agent,
            json!({"agent_id": "agent-a", "input_mapping": {"x": "no_dollar_prefix"}}),
        )
        .edge("__start__", "a")
        .edge("a", "__end__")
        .build();
    assert!(matches!(
        compile(spec).await,
        Err(CompileError::Mapping { .. })
    ));
}

#[tokio::test]
async fn parallel_router_may_not_read_undeclared_properties() {
    let (b_id, b_ty, b_cfg) = agent("b", "agent-b");
    let spec = GraphBuilder::new("sibling-peek")
        .parallel_node("p")
        .router_node("r")
        .node(b_id, b_ty, b_cfg)
        .node("j", NodeType::Join, json!({"wait_for": ["r", "b"]}))
        .edge("__start__", "p")
        .edge("p", "r")
        .edge("p", "b")
        .conditional_edge("r", "j", "state.get('sibling_output', false)")
        .edge("r", "j")
        .edge("b", "j")
        .edge("j", "__end__")
        .build();
    assert!(matches!(
        compile(spec).await,
        Err(CompileError::RouterReadsUndeclared { property, .. }) if property == "sibling_output"
    ));
}

#[tokio::test]
async fn dynamic_fan_out_branches_must_feed_the_join() {
    let (a_id, a_ty, a_cfg) = agent("a", "agent-a");
    let (b_id, b_ty, b_cfg) = agent("b", "agent-b");
    let spec = GraphBuilder::new("long-branch")
        .state_schema(json!({"properties": {"docs": {"type": "array"}}}))
        .node("p", NodeType::Parallel, json!({"fan_out_key": "docs"}))
        .node(a_id, a_ty, a_cfg)
        .node("mid", NodeType::Agent, json!({"agent_id": "agent-a"}))
        .node(b_id, b_ty, b_cfg)
        .node("j", NodeType::Join, json!({"wait_for": ["mid", "b"]}))
        .edge("__start__", "p")
        .edge("p", "a")
        .edge("p", "b")
        .edge("a", "mid")
        .edge("mid", "j")
        .edge("b", "j")
        .edge("j", "__end__")
        .build();
    assert!(matches!(
        compile(spec).await,
        Err(CompileError::FanOutBranchShape { branch, .. }) if branch == "a"
    ));
}

#[tokio::test]
async fn router_with_two_unconditional_edges_rejected() {
    let (a_id, a_ty, a_cfg) = agent("a", "agent-a");
    let (b_id, b_ty, b_cfg) = agent("b", "agent-b");
    let spec = GraphBuilder::new("two-defaults")
        .router_node("r")
        .node(a_id, a_ty, a_cfg)
        .node(b_id, b_ty, b_cfg)
        .edge("__start__", "r")
        .edge("r", "a")
        .edge("r", "b")
        .edge("a", "__end__")
        .edge("b", "__end__")
        .build();
    assert!(matches!(
        compile(spec).await,
        Err(CompileError::NodeShape { node_id, .. }) if node_id == "r"
    ));
}

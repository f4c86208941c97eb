//! Pause/resume wizard: an agent drafts a plan, the run suspends for
//! confirmation, and a second request on the same thread applies it.
//!
//! Run with: cargo run --example confirm_wizard

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use agentweave::agents::{
    AgentDefinition, ChatModel, ChatRequest, ChatResponse, ModelConfig, ProviderError,
    ProviderPool,
};
use agentweave::event_bus::format_sse;
use agentweave::graph::{Compiler, GraphBuilder, GraphSpec, ResolveError, ResourceResolver};
use agentweave::runtime::{ExecutionRequest, ExecutionRunner, InMemoryCheckpointer};
use agentweave::types::NodeType;

/// Stands in for a real provider adapter.
struct CannedModel(&'static str);

#[async_trait]
impl ChatModel for CannedModel {
    async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        Ok(ChatResponse {
            content: self.0.to_string(),
            ..ChatResponse::default()
        })
    }
}

struct DemoResolver;

#[async_trait]
impl ResourceResolver for DemoResolver {
    async fn agent(&self, agent_id: &str) -> Result<AgentDefinition, ResolveError> {
        Ok(AgentDefinition {
            agent_id: agent_id.to_string(),
            name: agent_id.to_string(),
            instructions: "You are a meticulous planner.".to_string(),
            model: ModelConfig {
                provider: agent_id.to_string(),
                model_name: "canned".to_string(),
                temperature: Some(0.2),
                max_tokens: Some(256),
            },
            tools: vec![],
            output_schema: None,
        })
    }

    async fn workflow(&self, workflow_id: &str) -> Result<GraphSpec, ResolveError> {
        Err(ResolveError::WorkflowNotFound {
            workflow_id: workflow_id.to_string(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let spec = GraphBuilder::new("confirm-wizard")
        .state_schema(json!({
            "properties": {"plan_confirmed": {"type": "boolean"}}
        }))
        .node(
            "plan",
            NodeType::Agent,
            json!({"agent_id": "planner", "output_key": "draft"}),
        )
        .router_node("confirm")
        .node(
            "apply",
            NodeType::Agent,
            json!({"agent_id": "executor", "output_key": "result"}),
        )
        .edge("__start__", "plan")
        .edge("plan", "confirm")
        .conditional_edge("confirm", "apply", "state.get('plan_confirmed', false)")
        .edge("confirm", "__end__")
        .edge("apply", "__end__")
        .build();

    let compiler = Compiler::new(Arc::new(DemoResolver));
    let graph = Arc::new(compiler.compile(&spec).await?);

    let planner: Arc<dyn ChatModel> = Arc::new(CannedModel("1. back up, 2. migrate, 3. verify"));
    let executor: Arc<dyn ChatModel> = Arc::new(CannedModel("migration complete"));
    let pool = ProviderPool::new()
        .with_model("planner", planner, None)
        .with_model("executor", executor, None);

    let runner = ExecutionRunner::new(graph, pool)
        .with_checkpointer(Arc::new(InMemoryCheckpointer::new()));

    let mut events = runner.events();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print!("{}", format_sse(&event));
            if event.is_terminal() {
                break;
            }
        }
    });

    let paused = runner
        .run(ExecutionRequest {
            input: json!({"topic": "database migration"}),
            interrupt_before: vec!["confirm".to_string()],
            ..ExecutionRequest::default()
        })
        .await?;
    println!(
        "-- paused: status={} reason={:?}",
        paused.status, paused.awaiting_input_reason
    );

    let done = runner
        .run(ExecutionRequest {
            thread_id: Some(paused.thread_id),
            input: json!({"plan_confirmed": true}),
            ..ExecutionRequest::default()
        })
        .await?;
    println!("-- finished: status={}", done.status);
    println!("-- output: {}", done.output.unwrap_or_default());

    Ok(())
}

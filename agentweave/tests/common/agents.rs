//! Scripted chat models and in-memory resolvers for integration tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentweave::agents::{
    AgentDefinition, ChatModel, ChatRequest, ChatResponse, ModelConfig, ProviderError, TokenUsage,
    ToolCall,
};
use agentweave::graph::{GraphSpec, ResolveError, ResourceResolver};

/// A model that replays a fixed script of responses.
///
/// When the script runs dry it either repeats the configured fallback
/// (`always`) or returns a plain "done" text response.
pub struct ScriptedModel {
    script: Mutex<VecDeque<ChatResponse>>,
    fallback: Option<ChatResponse>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(script: Vec<ChatResponse>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback: None,
            delay: None,
            calls: AtomicUsize::new(0),
        })
    }

    /// Repeats the same response forever.
    pub fn always(response: ChatResponse) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(response),
            delay: None,
            calls: AtomicUsize::new(0),
        })
    }

    /// Single text response.
    pub fn text(content: &str) -> Arc<Self> {
        Self::new(vec![text_response(content)])
    }

    /// Adds an artificial latency before each response.
    pub fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(self.script.lock().clone()),
            fallback: self.fallback.clone(),
            delay: Some(delay),
            calls: AtomicUsize::new(0),
        })
    }

    /// Model calls performed so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().pop_front();
        Ok(next
            .or_else(|| self.fallback.clone())
            .unwrap_or_else(|| text_response("done")))
    }
}

/// Plain text response with token usage attached.
pub fn text_response(content: &str) -> ChatResponse {
    ChatResponse {
        content: content.to_string(),
        tool_calls: vec![],
        usage: TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        },
    }
}

/// Response requesting a single tool call.
pub fn tool_call_response(name: &str, arguments: Value) -> ChatResponse {
    ChatResponse {
        content: String::new(),
        tool_calls: vec![ToolCall {
            id: format!("call_{name}"),
            name: name.to_string(),
            arguments,
        }],
        usage: TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        },
    }
}

/// Response requesting several tool calls in one iteration.
pub fn multi_tool_response(calls: Vec<(&str, Value)>) -> ChatResponse {
    ChatResponse {
        content: String::new(),
        tool_calls: calls
            .into_iter()
            .enumerate()
            .map(|(i, (name, arguments))| ToolCall {
                id: format!("call_{i}_{name}"),
                name: name.to_string(),
                arguments,
            })
            .collect(),
        usage: TokenUsage::default(),
    }
}

/// Agent definition wired to a per-agent provider name (`prov-<agent_id>`),
/// so each agent in a test binds to its own scripted model.
pub fn agent_def(agent_id: &str, tools: Vec<&str>, output_schema: Option<Value>) -> AgentDefinition {
    AgentDefinition {
        agent_id: agent_id.to_string(),
        name: agent_id.to_string(),
        instructions: format!("You are the {agent_id} agent."),
        model: ModelConfig {
            provider: format!("prov-{agent_id}"),
            model_name: "scripted".to_string(),
            temperature: Some(0.0),
            max_tokens: Some(512),
        },
        tools: tools.into_iter().map(ToString::to_string).collect(),
        output_schema,
    }
}

/// Integer output schema, handy for numeric scenario agents.
pub fn int_schema() -> Option<Value> {
    Some(json!({"type": "integer"}))
}

/// Array output schema.
pub fn array_schema() -> Option<Value> {
    Some(json!({"type": "array"}))
}

/// In-memory [`ResourceResolver`].
#[derive(Default)]
pub struct MapResolver {
    agents: FxHashMap<String, AgentDefinition>,
    workflows: FxHashMap<String, GraphSpec>,
}

impl MapResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent(mut self, definition: AgentDefinition) -> Self {
        self.agents.insert(definition.agent_id.clone(), definition);
        self
    }

    pub fn with_workflow(mut self, workflow_id: &str, spec: GraphSpec) -> Self {
        self.workflows.insert(workflow_id.to_string(), spec);
        self
    }
}

#[async_trait]
impl ResourceResolver for MapResolver {
    async fn agent(&self, agent_id: &str) -> Result<AgentDefinition, ResolveError> {
        self.agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| ResolveError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })
    }

    async fn workflow(&self, workflow_id: &str) -> Result<GraphSpec, ResolveError> {
        self.workflows
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| ResolveError::WorkflowNotFound {
                workflow_id: workflow_id.to_string(),
            })
    }
}

//! Agent definitions, the LLM provider seam, and the bounded tool loop.

pub mod provider;
pub mod retry;
pub mod tool_loop;

pub use provider::{
    ChatMessage, ChatModel, ChatRequest, ChatResponse, ModelConfig, ProviderError, ProviderPool,
    Role, TokenUsage, ToolCall,
};
pub use retry::{RetryPolicy, RetryingModel};
pub use tool_loop::{LoopResult, ToolLoop, ToolLoopConfig, ToolLoopError, MAX_TOOL_ITERATIONS};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An agent definition as resolved from storage at graph compile time.
///
/// The engine never interprets `instructions`; they become the system prompt
/// verbatim. `tools` holds namespaced tool references resolved against the
/// tool registry during compilation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub agent_id: String,
    pub name: String,
    pub instructions: String,
    pub model: ModelConfig,
    #[serde(default)]
    pub tools: Vec<String>,
    /// When set, the loop runs in structured-output mode and validates the
    /// final response against this JSON Schema.
    #[serde(default)]
    pub output_schema: Option<Value>,
}

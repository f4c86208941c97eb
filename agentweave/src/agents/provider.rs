//! LLM provider seam: the minimal interface the agent loop requires.
//!
//! Provider adapters live outside the engine; the loop only needs a
//! completion call that accepts messages plus tool schemas and reports tool
//! calls and token usage back. Connections are pooled per provider behind
//! [`ProviderPool`], which also carries the per-provider request semaphores
//! that respect rate limits.

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::tools::ToolDefinition;

/// Model configuration carried by an agent definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: String,
    pub model_name: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// Message role in a conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool call requested by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One message in the loop transcript.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    /// Tool result message tied to the originating call id.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// Accumulated token usage across loop iterations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Adds another usage sample in place.
    pub fn absorb(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// One completion request.
#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub model: ModelConfig,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    /// Structured-output schema forwarded to the provider's native facility.
    pub output_schema: Option<Value>,
}

/// One completion response.
#[derive(Clone, Debug, Default)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
}

/// Provider failures, classified for the retry policy.
#[derive(Clone, Debug, Error, Diagnostic)]
pub enum ProviderError {
    #[error("provider '{provider}' rate limited")]
    #[diagnostic(code(agentweave::provider::rate_limited))]
    RateLimited { provider: String },

    #[error("provider '{provider}' unavailable: {detail}")]
    #[diagnostic(code(agentweave::provider::unavailable))]
    Unavailable { provider: String, detail: String },

    #[error("provider '{provider}' timed out")]
    #[diagnostic(code(agentweave::provider::timeout))]
    Timeout { provider: String },

    #[error("provider '{provider}' refused the request: {detail}")]
    #[diagnostic(code(agentweave::provider::refused))]
    Refused { provider: String, detail: String },

    #[error("no model registered for provider '{provider}'")]
    #[diagnostic(
        code(agentweave::provider::not_configured),
        help("register the provider on the ProviderPool before running workflows")
    )]
    NotConfigured { provider: String },
}

impl ProviderError {
    /// Idempotent failures worth retrying with backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::Unavailable { .. }
                | ProviderError::Timeout { .. }
        )
    }
}

/// The minimal LLM interface the tool loop drives.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// Per-provider model handles and request semaphores.
///
/// The engine does not assume stateful connections; a `ChatModel` is shared
/// freely across executions while the optional semaphore caps outstanding
/// requests per provider.
#[derive(Clone, Default)]
pub struct ProviderPool {
    models: FxHashMap<String, Arc<dyn ChatModel>>,
    limits: FxHashMap<String, Arc<Semaphore>>,
}

impl ProviderPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a model for a provider, optionally capping concurrent
    /// requests.
    #[must_use]
    pub fn with_model(
        mut self,
        provider: impl Into<String>,
        model: Arc<dyn ChatModel>,
        max_in_flight: Option<usize>,
    ) -> Self {
        let provider = provider.into();
        if let Some(limit) = max_in_flight {
            self.limits
                .insert(provider.clone(), Arc::new(Semaphore::new(limit.max(1))));
        }
        self.models.insert(provider, model);
        self
    }

    /// Resolves the model for a provider.
    pub fn model(&self, provider: &str) -> Result<Arc<dyn ChatModel>, ProviderError> {
        self.models
            .get(provider)
            .cloned()
            .ok_or_else(|| ProviderError::NotConfigured {
                provider: provider.to_string(),
            })
    }

    /// Acquires the provider's rate-limit permit, when one is configured.
    pub async fn acquire(&self, provider: &str) -> Option<OwnedSemaphorePermit> {
        match self.limits.get(provider) {
            // Semaphores are never closed, so acquire cannot fail.
            Some(sem) => Arc::clone(sem).acquire_owned().await.ok(),
            None => None,
        }
    }
}

//! The bounded ReAct-style tool loop driving an AGENT node.
//!
//! Given an agent definition, bound tools, and an input bundle, the loop
//! calls the model, executes requested tools, and feeds results back until
//! the model returns a non-tool final message or the iteration cap fires.
//! Tool failures are surfaced to the model as structured tool results, not
//! as loop errors, so the model can observe and recover from them.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::agents::provider::{
    ChatMessage, ChatModel, ChatRequest, ChatResponse, ProviderError, TokenUsage, ToolCall,
};
use crate::agents::AgentDefinition;
use crate::event_bus::Event;
use crate::tools::{ToolBinding, ToolFailure, ToolInvocation};
use crate::utils::digest::value_digest;

/// Default iteration cap.
pub const MAX_TOOL_ITERATIONS: usize = 10;

/// Loop tuning knobs. Timeouts nest strictly: iteration > tool call.
#[derive(Clone, Debug)]
pub struct ToolLoopConfig {
    pub max_iterations: usize,
    /// Budget for one model call plus its tool calls.
    pub iteration_timeout: Option<Duration>,
    /// Upper bound applied on top of each tool's own declared timeout.
    pub tool_timeout_cap: Option<Duration>,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: MAX_TOOL_ITERATIONS,
            iteration_timeout: None,
            tool_timeout_cap: None,
        }
    }
}

/// Successful loop outcome.
#[derive(Clone, Debug)]
pub struct LoopResult {
    /// Final response: schema-validated value in structured-output mode,
    /// otherwise the model's text.
    pub output: Value,
    /// Full message transcript in strict sequential order.
    pub transcript: Vec<ChatMessage>,
    /// Every tool invocation performed, in emission order.
    pub invocations: Vec<ToolInvocation>,
    /// Token usage accumulated across iterations.
    pub usage: TokenUsage,
    /// Model calls performed.
    pub iterations: usize,
}

/// Loop-terminating errors.
#[derive(Debug, Error, Diagnostic)]
pub enum ToolLoopError {
    #[error("tool loop exhausted its budget of {iterations} iterations")]
    #[diagnostic(
        code(agentweave::tool_loop::budget_exhausted),
        help("raise max_iterations or configure on_budget=return_partial on the node")
    )]
    BudgetExhausted {
        iterations: usize,
        transcript: Vec<ChatMessage>,
        usage: TokenUsage,
    },

    #[error("structured output failed schema validation after retry: {detail}")]
    #[diagnostic(code(agentweave::tool_loop::schema_validation))]
    SchemaValidation { detail: String },

    #[error("iteration {iteration} exceeded its time budget")]
    #[diagnostic(code(agentweave::tool_loop::iteration_timeout))]
    IterationTimeout { iteration: usize },

    #[error(transparent)]
    #[diagnostic(code(agentweave::tool_loop::provider))]
    Provider(#[from] ProviderError),

    #[error("tool loop cancelled")]
    #[diagnostic(code(agentweave::tool_loop::cancelled))]
    Cancelled,
}

/// One loop instance, owned by an AGENT node execution.
pub struct ToolLoop {
    model: Arc<dyn ChatModel>,
    bindings: Vec<ToolBinding>,
    config: ToolLoopConfig,
    cancel: CancellationToken,
    node_id: String,
    events: Option<flume::Sender<Event>>,
}

impl ToolLoop {
    pub fn new(
        model: Arc<dyn ChatModel>,
        bindings: Vec<ToolBinding>,
        config: ToolLoopConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            model,
            bindings,
            config,
            cancel,
            node_id: String::new(),
            events: None,
        }
    }

    /// Attaches lifecycle event emission for `tool_call` / `tool_result`.
    #[must_use]
    pub fn with_events(mut self, node_id: impl Into<String>, sender: flume::Sender<Event>) -> Self {
        self.node_id = node_id.into();
        self.events = Some(sender);
        self
    }

    /// Runs the loop to a terminal response.
    #[instrument(skip(self, definition, input_bundle), fields(agent = %definition.agent_id), err)]
    pub async fn run(
        &self,
        definition: &AgentDefinition,
        input_bundle: &FxHashMap<String, Value>,
    ) -> Result<LoopResult, ToolLoopError> {
        let mut messages = vec![
            ChatMessage::system(&definition.instructions),
            ChatMessage::user(render_bundle(input_bundle)),
        ];

        let tool_definitions: Vec<_> = self
            .bindings
            .iter()
            .map(|b| b.definition().clone())
            .collect();
        let by_name: FxHashMap<&str, &ToolBinding> = self
            .bindings
            .iter()
            .map(|b| (b.name(), b))
            .collect();

        let mut usage = TokenUsage::default();
        let mut invocations: Vec<ToolInvocation> = Vec::new();
        let mut schema_retried = false;

        for iteration in 1..=self.config.max_iterations {
            if self.cancel.is_cancelled() {
                return Err(ToolLoopError::Cancelled);
            }

            let iteration_deadline = self
                .config
                .iteration_timeout
                .map(|budget| Instant::now() + budget);

            let request = ChatRequest {
                model: definition.model.clone(),
                messages: messages.clone(),
                tools: tool_definitions.clone(),
                output_schema: definition.output_schema.clone(),
            };

            let response = self
                .call_model(request, iteration, iteration_deadline)
                .await?;
            usage.absorb(response.usage);

            if response.tool_calls.is_empty() {
                messages.push(ChatMessage::assistant(response.content.clone(), vec![]));

                match self.finalize(definition, &response, &mut messages, schema_retried)? {
                    Finalize::Done(output) => {
                        debug!(iterations = iteration, "tool loop complete");
                        return Ok(LoopResult {
                            output,
                            transcript: messages,
                            invocations,
                            usage,
                            iterations: iteration,
                        });
                    }
                    Finalize::RetrySchema => {
                        schema_retried = true;
                        continue;
                    }
                }
            }

            messages.push(ChatMessage::assistant(
                response.content.clone(),
                response.tool_calls.clone(),
            ));

            let records = self
                .run_tool_calls(&response.tool_calls, &by_name, iteration, iteration_deadline)
                .await?;

            for (call, record) in response.tool_calls.iter().zip(records) {
                let content = match &record.result {
                    Ok(value) => value.to_string(),
                    Err(failure) => failure.to_result_value().to_string(),
                };
                messages.push(ChatMessage::tool_result(call.id.clone(), content));
                invocations.push(record);
            }
        }

        Err(ToolLoopError::BudgetExhausted {
            iterations: self.config.max_iterations,
            transcript: messages,
            usage,
        })
    }

    async fn call_model(
        &self,
        request: ChatRequest,
        iteration: usize,
        deadline: Option<Instant>,
    ) -> Result<ChatResponse, ToolLoopError> {
        let call = self.model.complete(request);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ToolLoopError::Cancelled),
            outcome = async {
                match deadline {
                    Some(deadline) => {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        tokio::time::timeout(remaining, call)
                            .await
                            .map_err(|_| ToolLoopError::IterationTimeout { iteration })?
                            .map_err(ToolLoopError::from)
                    }
                    None => call.await.map_err(ToolLoopError::from),
                }
            } => outcome,
        }
    }

    fn finalize(
        &self,
        definition: &AgentDefinition,
        response: &ChatResponse,
        messages: &mut Vec<ChatMessage>,
        already_retried: bool,
    ) -> Result<Finalize, ToolLoopError> {
        let Some(schema) = &definition.output_schema else {
            return Ok(Finalize::Done(Value::String(response.content.clone())));
        };

        let violation = match serde_json::from_str::<Value>(&response.content) {
            Ok(value) => {
                let validator = jsonschema::validator_for(schema).map_err(|e| {
                    ToolLoopError::SchemaValidation {
                        detail: format!("invalid output schema: {e}"),
                    }
                })?;
                let errors: Vec<String> =
                    validator.iter_errors(&value).map(|e| e.to_string()).collect();
                if errors.is_empty() {
                    return Ok(Finalize::Done(value));
                }
                errors.join("; ")
            }
            Err(e) => format!("response is not valid JSON: {e}"),
        };

        if already_retried {
            return Err(ToolLoopError::SchemaValidation { detail: violation });
        }

        // One correction round; the retry consumes an iteration.
        messages.push(ChatMessage::user(format!(
            "Your response failed schema validation: {violation}. \
             Respond again with JSON matching the declared output schema."
        )));
        Ok(Finalize::RetrySchema)
    }

    async fn run_tool_calls(
        &self,
        calls: &[ToolCall],
        by_name: &FxHashMap<&str, &ToolBinding>,
        iteration: usize,
        deadline: Option<Instant>,
    ) -> Result<Vec<ToolInvocation>, ToolLoopError> {
        if self.cancel.is_cancelled() {
            return Err(ToolLoopError::Cancelled);
        }

        let all_pure = calls.iter().all(|call| {
            by_name
                .get(call.name.as_str())
                .map_or(true, |b| b.side_effect_free())
        });

        let records = if all_pure && calls.len() > 1 {
            let futures: Vec<_> = calls
                .iter()
                .map(|call| self.run_one_call(call, by_name, deadline))
                .collect();
            let records = futures_util::future::join_all(futures).await;
            for record in &records {
                self.emit_call_events(record, true);
            }
            records
        } else {
            let mut records = Vec::with_capacity(calls.len());
            for call in calls {
                if self.cancel.is_cancelled() {
                    return Err(ToolLoopError::Cancelled);
                }
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        return Err(ToolLoopError::IterationTimeout { iteration });
                    }
                }
                self.emit(|| Event::ToolCall {
                    node_id: self.node_id.clone(),
                    tool_id: record_tool_id(call, by_name),
                    arguments_digest: value_digest(&call.arguments),
                });
                let record = self.run_one_call(call, by_name, deadline).await;
                self.emit_call_events(&record, false);
                records.push(record);
            }
            records
        };

        Ok(records)
    }

    async fn run_one_call(
        &self,
        call: &ToolCall,
        by_name: &FxHashMap<&str, &ToolBinding>,
        deadline: Option<Instant>,
    ) -> ToolInvocation {
        let Some(binding) = by_name.get(call.name.as_str()) else {
            let now = chrono::Utc::now();
            return ToolInvocation {
                tool_id: call.name.clone(),
                arguments: call.arguments.clone(),
                started_at: now,
                finished_at: now,
                result: Err(ToolFailure::ToolUnavailable {
                    reference: call.name.clone(),
                    detail: "tool is not bound to this agent".to_string(),
                }),
            };
        };

        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let cap = match (self.config.tool_timeout_cap, remaining) {
            (Some(cap), Some(rem)) => Some(cap.min(rem)),
            (Some(cap), None) => Some(cap),
            (None, rem) => rem,
        };
        binding
            .invoke(call.arguments.clone(), binding.deadline(cap), &self.cancel)
            .await
    }

    fn emit_call_events(&self, record: &ToolInvocation, include_call: bool) {
        if include_call {
            self.emit(|| Event::ToolCall {
                node_id: self.node_id.clone(),
                tool_id: record.tool_id.clone(),
                arguments_digest: value_digest(&record.arguments),
            });
        }
        let duration_ms = (record.finished_at - record.started_at)
            .num_milliseconds()
            .max(0) as u64;
        self.emit(|| Event::ToolResult {
            node_id: self.node_id.clone(),
            tool_id: record.tool_id.clone(),
            ok: record.result.is_ok(),
            duration_ms,
        });
    }

    fn emit(&self, event: impl FnOnce() -> Event) {
        if let Some(sender) = &self.events {
            let _ = sender.send(event());
        }
    }
}

enum Finalize {
    Done(Value),
    RetrySchema,
}

fn record_tool_id(call: &ToolCall, by_name: &FxHashMap<&str, &ToolBinding>) -> String {
    by_name
        .get(call.name.as_str())
        .map(|b| b.reference().to_string())
        .unwrap_or_else(|| call.name.clone())
}

/// Renders the mapped input bundle into the user prompt, one `key: value`
/// line per argument in sorted key order.
fn render_bundle(bundle: &FxHashMap<String, Value>) -> String {
    if bundle.is_empty() {
        return String::new();
    }
    let mut keys: Vec<&String> = bundle.keys().collect();
    keys.sort();
    keys.iter()
        .map(|key| {
            let value = &bundle[*key];
            match value {
                Value::String(s) => format!("{key}: {s}"),
                other => format!("{key}: {other}"),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

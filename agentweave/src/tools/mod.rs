//! Tool registry and invoker.
//!
//! Tools are referenced from agent definitions by namespaced reference
//! (`builtin:<name>` or `custom:<name>`), resolved at graph compile time into
//! [`ToolBinding`]s that pair the implementation with its compiled JSON
//! Schema validator. Invocation validates arguments, enforces the per-call
//! deadline, and categorises failures so the LLM can observe and recover from
//! them inside the tool loop.
//!
//! The process-wide registry is installed once at startup via
//! [`ToolRegistry::install`] and never mutated afterwards; request handlers
//! only read it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Default per-call timeout when a tool does not declare one.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// An executable tool implementation.
///
/// Implementations declare a JSON Schema for their arguments; the invoker
/// validates calls against it before execution, so tool bodies may assume
/// well-shaped input.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name as exposed to the LLM.
    fn name(&self) -> &str;

    /// Human-readable description for the LLM.
    fn description(&self) -> &str {
        ""
    }

    /// JSON Schema for the tool's arguments.
    fn input_schema(&self) -> Value;

    /// Pure tools may run concurrently within one loop iteration.
    fn side_effect_free(&self) -> bool {
        false
    }

    /// Per-call deadline.
    fn timeout(&self) -> Duration {
        DEFAULT_TOOL_TIMEOUT
    }

    /// Executes the tool with validated arguments.
    async fn execute(&self, args: Value) -> Result<Value, ToolFailure>;
}

/// Wire-facing description of a tool, sent to the LLM with each request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Categorised tool failure.
///
/// Failures propagate to the agent as structured tool results, not as loop
/// errors; the model sees them and may retry or apologise.
#[derive(Clone, Debug, PartialEq, Error, Diagnostic, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolFailure {
    #[error("invalid arguments: {detail}")]
    #[diagnostic(code(agentweave::tools::invalid_arguments))]
    InvalidArguments { detail: String },

    #[error("tool timed out after {timeout_secs}s")]
    #[diagnostic(code(agentweave::tools::timeout))]
    ToolTimeout { timeout_secs: u64 },

    #[error("tool '{reference}' unavailable: {detail}")]
    #[diagnostic(
        code(agentweave::tools::unavailable),
        help("register the tool before compiling workflows that reference it")
    )]
    ToolUnavailable { reference: String, detail: String },

    #[error("tool failed: {detail}")]
    #[diagnostic(code(agentweave::tools::failed))]
    ToolFailed { detail: String },
}

impl ToolFailure {
    /// Renders the failure as the structured tool-result payload shown to
    /// the LLM.
    #[must_use]
    pub fn to_result_value(&self) -> Value {
        json!({ "error": self })
    }
}

/// A resolved tool reference: implementation plus compiled argument schema.
#[derive(Clone)]
pub struct ToolBinding {
    reference: String,
    definition: ToolDefinition,
    tool: Arc<dyn Tool>,
    validator: Arc<jsonschema::Validator>,
}

impl std::fmt::Debug for ToolBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolBinding")
            .field("reference", &self.reference)
            .field("name", &self.definition.name)
            .finish()
    }
}

/// Record of one tool invocation, embedded into the step's event list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_id: String,
    pub arguments: Value,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub result: Result<Value, ToolFailure>,
}

impl ToolBinding {
    /// Namespaced reference this binding resolved from.
    #[must_use]
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Definition sent to the LLM.
    #[must_use]
    pub fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    /// Tool name as the LLM addresses it.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Whether the underlying tool is declared pure.
    #[must_use]
    pub fn side_effect_free(&self) -> bool {
        self.tool.side_effect_free()
    }

    /// Per-call deadline, capped by `cap` when one applies.
    #[must_use]
    pub fn deadline(&self, cap: Option<Duration>) -> Duration {
        match cap {
            Some(cap) => self.tool.timeout().min(cap),
            None => self.tool.timeout(),
        }
    }

    /// Validates arguments, executes under the deadline, and records the
    /// outcome.
    ///
    /// Failures land in the invocation record rather than erroring out; the
    /// caller forwards them to the model as structured tool results.
    pub async fn invoke(
        &self,
        arguments: Value,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> ToolInvocation {
        let started_at = Utc::now();
        let result = self.invoke_inner(&arguments, deadline, cancel).await;
        ToolInvocation {
            tool_id: self.reference.clone(),
            arguments,
            started_at,
            finished_at: Utc::now(),
            result,
        }
    }

    async fn invoke_inner(
        &self,
        arguments: &Value,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, ToolFailure> {
        let violations: Vec<String> = self
            .validator
            .iter_errors(arguments)
            .map(|e| e.to_string())
            .collect();
        if !violations.is_empty() {
            return Err(ToolFailure::InvalidArguments {
                detail: violations.join("; "),
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(ToolFailure::ToolFailed {
                detail: "cancelled".to_string(),
            }),
            outcome = tokio::time::timeout(deadline, self.tool.execute(arguments.clone())) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => Err(ToolFailure::ToolTimeout {
                        timeout_secs: deadline.as_secs(),
                    }),
                }
            }
        }
    }
}

/// Registry of tool implementations, keyed by namespaced reference.
///
/// Built-in tools register under their own name and resolve via
/// `builtin:<name>`; custom tools register under a full `custom:<name>`
/// reference.
#[derive(Default)]
pub struct ToolRegistry {
    builtin: FxHashMap<String, Arc<dyn Tool>>,
    custom: FxHashMap<String, Arc<dyn Tool>>,
}

static GLOBAL: OnceLock<ToolRegistry> = OnceLock::new();

impl ToolRegistry {
    /// New empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a built-in tool under its own name.
    pub fn register_builtin(&mut self, tool: impl Tool + 'static) -> &mut Self {
        self.builtin.insert(tool.name().to_string(), Arc::new(tool));
        self
    }

    /// Registers a custom tool under a full `custom:<name>` reference.
    pub fn register_custom(&mut self, reference: impl Into<String>, tool: impl Tool + 'static) -> &mut Self {
        self.custom.insert(reference.into(), Arc::new(tool));
        self
    }

    /// Builder-style registration of a built-in tool.
    #[must_use]
    pub fn with_builtin(mut self, tool: impl Tool + 'static) -> Self {
        self.register_builtin(tool);
        self
    }

    /// Installs the process-wide registry. Call once at startup; later calls
    /// return the registry back as an error.
    pub fn install(registry: ToolRegistry) -> Result<(), ToolRegistry> {
        GLOBAL.set(registry)
    }

    /// The process-wide registry, if installed.
    #[must_use]
    pub fn global() -> Option<&'static ToolRegistry> {
        GLOBAL.get()
    }

    /// Resolves a namespaced reference into a binding with a compiled
    /// argument validator.
    pub fn resolve(&self, reference: &str) -> Result<ToolBinding, ToolFailure> {
        let tool = match reference.split_once(':') {
            Some(("builtin", name)) => {
                self.builtin
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ToolFailure::ToolUnavailable {
                        reference: reference.to_string(),
                        detail: format!(
                            "built-in tool '{name}' not found; available: {}",
                            self.builtin_names().join(", ")
                        ),
                    })?
            }
            Some(("custom", _)) => {
                self.custom
                    .get(reference)
                    .cloned()
                    .ok_or_else(|| ToolFailure::ToolUnavailable {
                        reference: reference.to_string(),
                        detail: "custom tool not registered".to_string(),
                    })?
            }
            _ => {
                return Err(ToolFailure::ToolUnavailable {
                    reference: reference.to_string(),
                    detail: "expected 'builtin:<name>' or 'custom:<name>'".to_string(),
                })
            }
        };

        let schema = tool.input_schema();
        let validator = jsonschema::validator_for(&schema).map_err(|e| {
            ToolFailure::ToolUnavailable {
                reference: reference.to_string(),
                detail: format!("invalid input schema: {e}"),
            }
        })?;

        Ok(ToolBinding {
            reference: reference.to_string(),
            definition: ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: schema,
            },
            tool,
            validator: Arc::new(validator),
        })
    }

    /// Sorted built-in tool names.
    #[must_use]
    pub fn builtin_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.builtin.keys().cloned().collect();
        names.sort();
        names
    }
}

//! Lifecycle event vocabulary.
//!
//! Events are emitted in a fixed order per execution:
//! `execution_start → (node_start (tool_call tool_result)* node_complete |
//! node_error)* → execution_complete | execution_cancelled`. Live
//! subscribers receive them over the bus; all events are also appended to
//! the durable step records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::ExecutionStatus;

/// One lifecycle event.
///
/// Large payloads (state snapshots, deltas, tool arguments) are referenced
/// by digest; the full values live in step records.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Event {
    ExecutionStart {
        execution_id: String,
        thread_id: String,
    },
    NodeStart {
        node_id: String,
        step_index: u64,
        input_snapshot_ref: String,
    },
    ToolCall {
        node_id: String,
        tool_id: String,
        arguments_digest: String,
    },
    ToolResult {
        node_id: String,
        tool_id: String,
        ok: bool,
        duration_ms: u64,
    },
    NodeComplete {
        node_id: String,
        step_index: u64,
        delta_digest: String,
    },
    NodeError {
        node_id: String,
        step_index: u64,
        error: String,
    },
    ExecutionComplete {
        status: ExecutionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
    },
    ExecutionCancelled {
        execution_id: String,
    },
}

impl Event {
    /// SSE event name for this variant.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Event::ExecutionStart { .. } => "execution_start",
            Event::NodeStart { .. } => "node_start",
            Event::ToolCall { .. } => "tool_call",
            Event::ToolResult { .. } => "tool_result",
            Event::NodeComplete { .. } => "node_complete",
            Event::NodeError { .. } => "node_error",
            Event::ExecutionComplete { .. } => "execution_complete",
            Event::ExecutionCancelled { .. } => "execution_cancelled",
        }
    }

    /// JSON payload (the `data` half of the SSE encoding).
    #[must_use]
    pub fn payload(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.get("data").cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// `true` for the two stream-terminating variants.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::ExecutionComplete { .. } | Event::ExecutionCancelled { .. }
        )
    }

    /// Node id for node-scoped events.
    #[must_use]
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Event::NodeStart { node_id, .. }
            | Event::ToolCall { node_id, .. }
            | Event::ToolResult { node_id, .. }
            | Event::NodeComplete { node_id, .. }
            | Event::NodeError { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}

//! Canned tools for integration tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use agentweave::tools::{Tool, ToolFailure, ToolRegistry};

/// Pure echo: returns its `message` argument.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "echoes the message back"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"message": {"type": "string"}},
            "required": ["message"],
            "additionalProperties": false
        })
    }

    fn side_effect_free(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolFailure> {
        Ok(json!({"echoed": args["message"]}))
    }
}

/// Pure adder with a configurable artificial latency.
pub struct AddTool {
    pub latency: Duration,
}

impl AddTool {
    pub fn instant() -> Self {
        Self {
            latency: Duration::ZERO,
        }
    }

    pub fn slow(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl Tool for AddTool {
    fn name(&self) -> &str {
        "add"
    }

    fn description(&self) -> &str {
        "adds two numbers"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "a": {"type": "number"},
                "b": {"type": "number"}
            },
            "required": ["a", "b"]
        })
    }

    fn side_effect_free(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolFailure> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let a = args["a"].as_f64().unwrap_or(0.0);
        let b = args["b"].as_f64().unwrap_or(0.0);
        Ok(json!(a + b))
    }
}

/// Declares a 50ms deadline and sleeps far past it, so every invocation
/// surfaces as `ToolTimeout`.
pub struct SleepyTool;

#[async_trait]
impl Tool for SleepyTool {
    fn name(&self) -> &str {
        "sleepy"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(50)
    }

    async fn execute(&self, _args: Value) -> Result<Value, ToolFailure> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(Value::Null)
    }
}

/// Always fails with `ToolFailed`.
pub struct BrokenTool;

#[async_trait]
impl Tool for BrokenTool {
    fn name(&self) -> &str {
        "broken"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    async fn execute(&self, _args: Value) -> Result<Value, ToolFailure> {
        Err(ToolFailure::ToolFailed {
            detail: "wires crossed".to_string(),
        })
    }
}

/// Registry holding every canned tool.
pub fn test_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry
        .register_builtin(EchoTool)
        .register_builtin(AddTool::instant())
        .register_builtin(SleepyTool)
        .register_builtin(BrokenTool);
    registry
}

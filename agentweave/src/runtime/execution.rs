//! Execution records: the caller-visible lifecycle of one run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::ExecutionStatus;

/// One workflow execution, created at submission and mutated by the runtime
/// until it reaches exactly one terminal status.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub workflow_id: String,
    pub thread_id: String,
    pub status: ExecutionStatus,
    /// Input payload the execution was submitted with.
    #[serde(default)]
    pub input: Value,
    /// Node(s) executing in the current super-step, for progress display.
    #[serde(default)]
    pub current_node: Option<String>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    /// New record in `PENDING`.
    #[must_use]
    pub fn new(
        execution_id: impl Into<String>,
        workflow_id: impl Into<String>,
        thread_id: impl Into<String>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            workflow_id: workflow_id.into(),
            thread_id: thread_id.into(),
            status: ExecutionStatus::Pending,
            input: Value::Null,
            current_node: None,
            output: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Transition into `RUNNING`.
    pub fn start(&mut self) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Transition into a terminal (or awaiting) status.
    pub fn finish(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.current_node = None;
        if status.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
    }
}

/// Lightweight progress view over an execution's step history.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionProgress {
    pub completed_steps: usize,
    pub current_node: Option<String>,
    pub status: Option<ExecutionStatus>,
}

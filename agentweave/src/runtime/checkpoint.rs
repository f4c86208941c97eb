//! Checkpointing: the durable copy of a running execution.
//!
//! A checkpoint is the `(state, frontier, join ledger)` triple at a
//! super-step boundary, keyed by thread id with a strictly increasing
//! `step_index`. Saves are atomic per super-step: a reader never observes a
//! partially written state. Saves for one thread are serialized; different
//! threads write concurrently.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::event_bus::Event;
use crate::runtime::frontier::FrontierEntry;
use crate::runtime::ledger::JoinLedger;
use crate::state::WorkflowState;

/// Durable snapshot of one super-step boundary.
#[derive(Clone, Debug, PartialEq)]
pub struct Checkpoint {
    pub thread_id: String,
    pub step_index: u64,
    pub state: WorkflowState,
    pub frontier: Vec<FrontierEntry>,
    pub join_ledger: JoinLedger,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    #[must_use]
    pub fn new(
        thread_id: impl Into<String>,
        state: WorkflowState,
        frontier: Vec<FrontierEntry>,
        join_ledger: JoinLedger,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            step_index: state.step(),
            state,
            frontier,
            join_ledger,
            created_at: Utc::now(),
        }
    }
}

/// Durable record of one node completion.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct StepRecord {
    pub execution_id: String,
    pub step_index: u64,
    pub node_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input_snapshot: Value,
    pub output_delta: Value,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Checkpointer failures.
#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointerError {
    #[error("checkpoint backend error: {message}")]
    #[diagnostic(code(agentweave::checkpoint::backend))]
    Backend { message: String },

    #[error("checkpoint serialization error: {message}")]
    #[diagnostic(code(agentweave::checkpoint::serde))]
    Serde { message: String },

    #[error("stale checkpoint write for thread '{thread_id}': step {attempted} <= {latest}")]
    #[diagnostic(
        code(agentweave::checkpoint::stale_write),
        help("step_index must increase strictly per thread")
    )]
    StaleWrite {
        thread_id: String,
        attempted: u64,
        latest: u64,
    },
}

/// Pluggable persistence for checkpoints and step history.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Atomically persists a checkpoint. `step_index` must exceed the
    /// thread's newest persisted step.
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), CheckpointerError>;

    /// Newest checkpoint for a thread.
    async fn load_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointerError>;

    /// Appends one step record to the durable history.
    async fn append_step(&self, step: StepRecord) -> Result<(), CheckpointerError>;

    /// Step history for an execution, in step order.
    async fn steps(&self, execution_id: &str) -> Result<Vec<StepRecord>, CheckpointerError>;

    /// Removes every checkpoint for a thread (execution deletion).
    async fn delete_thread(&self, thread_id: &str) -> Result<(), CheckpointerError>;

    /// Known thread ids.
    async fn list_threads(&self) -> Result<Vec<String>, CheckpointerError>;
}

#[derive(Default)]
struct InMemoryInner {
    checkpoints: FxHashMap<String, Vec<Checkpoint>>,
    steps: FxHashMap<String, Vec<StepRecord>>,
}

/// Volatile checkpointer for tests and development.
///
/// The single mutex serializes saves per thread trivially; contention is
/// irrelevant at test scale.
#[derive(Default)]
pub struct InMemoryCheckpointer {
    inner: Arc<Mutex<InMemoryInner>>,
}

impl InMemoryCheckpointer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Checkpointer for InMemoryCheckpointer {
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), CheckpointerError> {
        let mut inner = self.inner.lock();
        let chain = inner
            .checkpoints
            .entry(checkpoint.thread_id.clone())
            .or_default();
        if let Some(latest) = chain.last() {
            if checkpoint.step_index <= latest.step_index {
                return Err(CheckpointerError::StaleWrite {
                    thread_id: checkpoint.thread_id.clone(),
                    attempted: checkpoint.step_index,
                    latest: latest.step_index,
                });
            }
        }
        chain.push(checkpoint);
        Ok(())
    }

    async fn load_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointerError> {
        Ok(self
            .inner
            .lock()
            .checkpoints
            .get(thread_id)
            .and_then(|chain| chain.last())
            .cloned())
    }

    async fn append_step(&self, step: StepRecord) -> Result<(), CheckpointerError> {
        self.inner
            .lock()
            .steps
            .entry(step.execution_id.clone())
            .or_default()
            .push(step);
        Ok(())
    }

    async fn steps(&self, execution_id: &str) -> Result<Vec<StepRecord>, CheckpointerError> {
        Ok(self
            .inner
            .lock()
            .steps
            .get(execution_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<(), CheckpointerError> {
        self.inner.lock().checkpoints.remove(thread_id);
        Ok(())
    }

    async fn list_threads(&self) -> Result<Vec<String>, CheckpointerError> {
        let mut threads: Vec<String> = self.inner.lock().checkpoints.keys().cloned().collect();
        threads.sort();
        Ok(threads)
    }
}

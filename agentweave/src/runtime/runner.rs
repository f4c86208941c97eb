//! The execution runner: request handling, resume-by-thread, lifecycle
//! events, and checkpoint orchestration around the scheduler loop.

use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::agents::ProviderPool;
use crate::event_bus::{Event, EventBus, EventSink, EventStream};
use crate::executors::{NodeErrorKind, NodeFailure};
use crate::graph::CompiledGraph;
use crate::reducers::apply_barrier;
use crate::runtime::checkpoint::{Checkpoint, Checkpointer, CheckpointerError};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::execution::{ExecutionProgress, ExecutionRecord};
use crate::runtime::scheduler::{
    ExecContext, ExecutionState, Scheduler, SchedulerError, StepStatus,
};
use crate::state::{StateDelta, WorkflowState};
use crate::types::{ExecutionStatus, THREAD_ID_PROPERTY};
use crate::utils::ids;

/// One execution request.
///
/// A present `thread_id` triggers resume semantics: if the thread has a
/// checkpoint with remaining work, the new input is overlaid onto the
/// checkpointed state under per-property merge rules and execution continues
/// from the checkpointed frontier.
#[derive(Clone, Debug, Default)]
pub struct ExecutionRequest {
    pub thread_id: Option<String>,
    /// Object merged into state property-wise.
    pub input: Value,
    /// Whether the caller wants a streamed (SSE) response; the transport
    /// layer bridges [`ExecutionRunner::events`] when set.
    pub stream: bool,
    /// Wizard-style pause points: suspend instead of executing these nodes.
    pub interrupt_before: Vec<String>,
}

/// The caller-visible result of a run.
#[derive(Clone, Debug, serde::Serialize)]
pub struct ExecutionResponse {
    pub execution_id: String,
    pub thread_id: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub awaiting_input_reason: Option<String>,
}

/// Runner failures (the execution itself failing is a status, not an error).
#[derive(Debug, Error, Diagnostic)]
pub enum RunnerError {
    #[error("execution '{execution_id}' not found")]
    #[diagnostic(code(agentweave::runner::execution_not_found))]
    ExecutionNotFound { execution_id: String },

    #[error("cannot {operation} execution '{execution_id}' in status {status}")]
    #[diagnostic(code(agentweave::runner::invalid_status))]
    InvalidStatus {
        execution_id: String,
        status: ExecutionStatus,
        operation: &'static str,
    },

    #[error(transparent)]
    #[diagnostic(code(agentweave::runner::checkpointer))]
    Checkpointer(#[from] CheckpointerError),
}

/// Drives executions of one compiled graph.
///
/// Holds the live execution records; the checkpointer holds the durable
/// copies. Shared behind `Arc` across request handlers.
pub struct ExecutionRunner {
    graph: Arc<CompiledGraph>,
    providers: Arc<ProviderPool>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    config: Arc<RuntimeConfig>,
    scheduler: Scheduler,
    bus: EventBus,
    executions: Mutex<FxHashMap<String, ExecutionRecord>>,
    cancels: Mutex<FxHashMap<String, CancellationToken>>,
}

impl ExecutionRunner {
    #[must_use]
    pub fn new(graph: Arc<CompiledGraph>, providers: ProviderPool) -> Self {
        Self::with_config(graph, providers, RuntimeConfig::default())
    }

    #[must_use]
    pub fn with_config(
        graph: Arc<CompiledGraph>,
        providers: ProviderPool,
        config: RuntimeConfig,
    ) -> Self {
        let bus = EventBus::with_sinks(Vec::new(), config.event_capacity);
        bus.listen();
        Self {
            scheduler: Scheduler::new(config.fan_out_limit),
            graph,
            providers: Arc::new(providers),
            checkpointer: None,
            config: Arc::new(config),
            bus,
            executions: Mutex::new(FxHashMap::default()),
            cancels: Mutex::new(FxHashMap::default()),
        }
    }

    /// Attaches durable checkpointing.
    #[must_use]
    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// Subscribes to the live lifecycle event stream.
    #[must_use]
    pub fn events(&self) -> EventStream {
        self.bus.subscribe()
    }

    /// Adds an event sink (per-request SSE bridges, log shippers).
    pub fn add_event_sink<T: EventSink + 'static>(&self, sink: T) {
        self.bus.add_sink(sink);
    }

    /// Runs an execution to its first terminal or awaiting status.
    #[instrument(skip(self, request), err)]
    pub async fn run(&self, request: ExecutionRequest) -> Result<ExecutionResponse, RunnerError> {
        let thread_id = request
            .thread_id
            .clone()
            .unwrap_or_else(ids::thread_id);
        let execution_id = ids::execution_id();

        let (mut exec_state, resumed_step) = self.initial_state(&request, &thread_id).await?;

        let mut record =
            ExecutionRecord::new(&execution_id, &self.graph.workflow_id, &thread_id);
        record.input = request.input.clone();
        record.start();
        self.executions
            .lock()
            .insert(execution_id.clone(), record.clone());

        let cancel = CancellationToken::new();
        self.cancels.lock().insert(execution_id.clone(), cancel.clone());

        let ctx = ExecContext {
            graph: Arc::clone(&self.graph),
            providers: Arc::clone(&self.providers),
            checkpointer: self.checkpointer.clone(),
            events: self.bus.sender(),
            cancel: cancel.clone(),
            config: Arc::clone(&self.config),
            execution_id: execution_id.clone(),
            thread_id: thread_id.clone(),
            interrupt_before: request.interrupt_before.clone(),
        };

        self.emit(Event::ExecutionStart {
            execution_id: execution_id.clone(),
            thread_id: thread_id.clone(),
        });

        // Fresh threads get a step-0 checkpoint so a pause before the first
        // super-step is still resumable. A fresh run on a settled thread
        // replaces that thread's chain.
        let mut last_saved = resumed_step;
        if resumed_step.is_none() {
            if let Some(cp) = &self.checkpointer {
                if request.thread_id.is_some() && cp.load_latest(&thread_id).await?.is_some() {
                    cp.delete_thread(&thread_id).await?;
                }
                cp.save(Checkpoint::new(
                    thread_id.clone(),
                    exec_state.state.clone(),
                    exec_state.frontier.clone(),
                    exec_state.ledger.clone(),
                ))
                .await?;
                last_saved = Some(0);
            }
        }

        let deadline = self
            .config
            .execution_timeout
            .map(|t| tokio::time::Instant::now() + t);

        let final_status = loop {
            let step_result = match deadline {
                Some(deadline) => {
                    tokio::select! {
                        biased;
                        result = self.scheduler.superstep(&ctx, &mut exec_state) => result,
                        _ = tokio::time::sleep_until(deadline) => {
                            cancel.cancel();
                            break Terminal::failed(NodeFailure::new(
                                NodeErrorKind::ExecutionTimeout,
                                "execution exceeded its wall-clock budget",
                            ));
                        }
                    }
                }
                None => self.scheduler.superstep(&ctx, &mut exec_state).await,
            };

            let outcome = match step_result {
                Ok(outcome) => outcome,
                Err(SchedulerError::Checkpoint(e)) => {
                    break Terminal::failed(NodeFailure::new(
                        NodeErrorKind::Checkpoint,
                        e.to_string(),
                    ));
                }
            };

            self.set_current_node(&execution_id, outcome.ran.first().cloned());

            // Checkpoint each completed super-step; never after cancellation.
            let advanced = last_saved.map_or(outcome.step_index > 0, |s| outcome.step_index > s);
            if advanced && !matches!(outcome.status, StepStatus::Cancelled) {
                if let Some(cp) = &self.checkpointer {
                    if let Err(e) = cp
                        .save(Checkpoint::new(
                            thread_id.clone(),
                            exec_state.state.clone(),
                            exec_state.frontier.clone(),
                            exec_state.ledger.clone(),
                        ))
                        .await
                    {
                        break Terminal::failed(NodeFailure::new(
                            NodeErrorKind::Checkpoint,
                            e.to_string(),
                        ));
                    }
                    last_saved = Some(outcome.step_index);
                }
            }

            match outcome.status {
                StepStatus::Continue => continue,
                StepStatus::Completed => break Terminal::completed(),
                StepStatus::Cancelled => break Terminal::cancelled(),
                StepStatus::AwaitingInput { reason } => break Terminal::awaiting(reason),
                StepStatus::Failed { node_id, failure } => {
                    break Terminal::failed_at(node_id, failure)
                }
            }
        };

        self.cancels.lock().remove(&execution_id);
        self.finalize(&execution_id, &thread_id, &exec_state, final_status)
    }

    /// Cooperatively cancels a running execution.
    pub fn cancel(&self, execution_id: &str) -> bool {
        let Some(token) = self.cancels.lock().get(execution_id).cloned() else {
            return false;
        };
        info!(execution_id, "cancellation requested");
        token.cancel();
        true
    }

    /// Live execution record, if known to this process.
    #[must_use]
    pub fn execution(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.executions.lock().get(execution_id).cloned()
    }

    /// Step-count progress view backed by the durable history.
    pub async fn progress(&self, execution_id: &str) -> Result<ExecutionProgress, RunnerError> {
        let record = self
            .execution(execution_id)
            .ok_or_else(|| RunnerError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            })?;
        let completed_steps = match &self.checkpointer {
            Some(cp) => cp.steps(execution_id).await?.len(),
            None => 0,
        };
        Ok(ExecutionProgress {
            completed_steps,
            current_node: record.current_node,
            status: Some(record.status),
        })
    }

    /// Re-runs a cancelled or failed execution on its existing thread.
    pub async fn resume(&self, execution_id: &str) -> Result<ExecutionResponse, RunnerError> {
        let record = self.guard_status(execution_id, "resume", |s| {
            matches!(s, ExecutionStatus::Cancelled | ExecutionStatus::Failed)
        })?;
        self.run(ExecutionRequest {
            thread_id: Some(record.thread_id),
            input: record.input,
            ..ExecutionRequest::default()
        })
        .await
    }

    /// Re-runs an execution's input from scratch on a fresh thread.
    pub async fn restart(&self, execution_id: &str) -> Result<ExecutionResponse, RunnerError> {
        let record = self.guard_status(execution_id, "restart", |_| true)?;
        self.run(ExecutionRequest {
            input: record.input,
            ..ExecutionRequest::default()
        })
        .await
    }

    /// Deletes an execution record along with its thread's checkpoints.
    pub async fn delete_execution(&self, execution_id: &str) -> Result<(), RunnerError> {
        let record = self.executions.lock().remove(execution_id).ok_or_else(|| {
            RunnerError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            }
        })?;
        if let Some(cp) = &self.checkpointer {
            cp.delete_thread(&record.thread_id).await?;
        }
        Ok(())
    }

    async fn initial_state(
        &self,
        request: &ExecutionRequest,
        thread_id: &str,
    ) -> Result<(ExecutionState, Option<u64>), RunnerError> {
        if request.thread_id.is_some() {
            if let Some(cp) = &self.checkpointer {
                if let Some(checkpoint) = cp.load_latest(thread_id).await? {
                    let has_work = checkpoint.frontier.iter().any(|e| !e.node.is_end());
                    if has_work {
                        info!(
                            thread_id,
                            step = checkpoint.step_index,
                            "resuming from checkpoint"
                        );
                        let mut state = checkpoint.state;
                        if request.input.is_object() {
                            let overlay = StateDelta::from(
                                crate::utils::collections::props_from(
                                    request
                                        .input
                                        .as_object()
                                        .into_iter()
                                        .flatten()
                                        .map(|(k, v)| (k.clone(), v.clone())),
                                ),
                            );
                            apply_barrier(
                                &mut state,
                                &self.graph.schema,
                                vec![("__input__".to_string(), overlay)],
                            );
                        }
                        return Ok((
                            ExecutionState {
                                state,
                                frontier: checkpoint.frontier,
                                ledger: checkpoint.join_ledger,
                            },
                            Some(checkpoint.step_index),
                        ));
                    }
                }
            }
        }

        let mut state = WorkflowState::builder()
            .with_input(request.input.clone())
            .build();
        state.set(THREAD_ID_PROPERTY, Value::String(thread_id.to_string()));
        Ok((ExecutionState::fresh(&self.graph, state), None))
    }

    fn guard_status(
        &self,
        execution_id: &str,
        operation: &'static str,
        allowed: impl Fn(ExecutionStatus) -> bool,
    ) -> Result<ExecutionRecord, RunnerError> {
        let record = self
            .execution(execution_id)
            .ok_or_else(|| RunnerError::ExecutionNotFound {
                execution_id: execution_id.to_string(),
            })?;
        if !allowed(record.status) {
            return Err(RunnerError::InvalidStatus {
                execution_id: execution_id.to_string(),
                status: record.status,
                operation,
            });
        }
        Ok(record)
    }

    fn set_current_node(&self, execution_id: &str, node: Option<String>) {
        if let Some(record) = self.executions.lock().get_mut(execution_id) {
            record.current_node = node;
        }
    }

    fn finalize(
        &self,
        execution_id: &str,
        thread_id: &str,
        exec_state: &ExecutionState,
        terminal: Terminal,
    ) -> Result<ExecutionResponse, RunnerError> {
        let output = match terminal.status {
            ExecutionStatus::Completed => Some(self.project_output(exec_state)),
            _ => None,
        };

        match terminal.status {
            ExecutionStatus::Cancelled => self.emit(Event::ExecutionCancelled {
                execution_id: execution_id.to_string(),
            }),
            status => self.emit(Event::ExecutionComplete {
                status,
                output: output.clone(),
            }),
        }

        if let Some(record) = self.executions.lock().get_mut(execution_id) {
            record.finish(terminal.status);
            record.output = output.clone();
            record.error = terminal.error.clone();
        }

        info!(
            execution_id,
            thread_id,
            status = %terminal.status,
            "execution finished"
        );

        Ok(ExecutionResponse {
            execution_id: execution_id.to_string(),
            thread_id: thread_id.to_string(),
            status: terminal.status,
            output,
            error: terminal.error,
            awaiting_input_reason: terminal.awaiting_reason,
        })
    }

    fn project_output(&self, exec_state: &ExecutionState) -> Value {
        match &self.graph.output_key {
            Some(key) => exec_state.state.get(key).cloned().unwrap_or(Value::Null),
            None => exec_state.state.to_value(),
        }
    }

    fn emit(&self, event: Event) {
        let _ = self.bus.sender().send(event);
    }
}

struct Terminal {
    status: ExecutionStatus,
    error: Option<String>,
    awaiting_reason: Option<String>,
}

impl Terminal {
    fn completed() -> Self {
        Self {
            status: ExecutionStatus::Completed,
            error: None,
            awaiting_reason: None,
        }
    }

    fn cancelled() -> Self {
        Self {
            status: ExecutionStatus::Cancelled,
            error: None,
            awaiting_reason: None,
        }
    }

    fn awaiting(reason: String) -> Self {
        Self {
            status: ExecutionStatus::AwaitingInput,
            error: None,
            awaiting_reason: Some(reason),
        }
    }

    fn failed(failure: NodeFailure) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            error: Some(failure.to_string()),
            awaiting_reason: None,
        }
    }

    fn failed_at(node_id: String, failure: NodeFailure) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            error: Some(format!("node '{node_id}': {failure}")),
            awaiting_reason: None,
        }
    }
}

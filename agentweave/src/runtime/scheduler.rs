//! The super-step scheduler.
//!
//! One super-step: partition the frontier into ready nodes, execute them
//! concurrently under the fan-out semaphore and per-node timeout, merge
//! their deltas deterministically (lexicographic by node id), update the
//! join ledger, and compute the next frontier. The runner loops supersteps
//! and owns checkpointing; subgraph nodes recurse into this module with a
//! namespaced thread id.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use miette::Diagnostic;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::agents::ProviderPool;
use crate::event_bus::Event;
use crate::executors::{
    run_agent, run_join, run_parallel, run_router, ExecutorContext, NodeErrorKind, NodeFailure,
    NodeOutcome, NodeRun,
};
use crate::graph::{CompiledGraph, CompiledSubgraph, NodePayload};
use crate::reducers::apply_barrier;
use crate::runtime::checkpoint::{Checkpoint, Checkpointer, CheckpointerError, StepRecord};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::frontier::FrontierEntry;
use crate::runtime::ledger::{JoinEntry, JoinLedger};
use crate::state::{StateDelta, StateSnapshot, WorkflowState};
use crate::types::{NodeRef, THREAD_ID_PROPERTY};
use crate::utils::digest::value_digest;
use crate::utils::ids;

/// Scheduler-level hard errors. Node failures are statuses, not errors;
/// only durable-storage problems abort the step machinery itself.
#[derive(Debug, Error, Diagnostic)]
pub enum SchedulerError {
    #[error(transparent)]
    #[diagnostic(code(agentweave::scheduler::checkpoint))]
    Checkpoint(#[from] CheckpointerError),
}

/// Shared, read-only context for one execution.
#[derive(Clone)]
pub struct ExecContext {
    pub graph: Arc<CompiledGraph>,
    pub providers: Arc<ProviderPool>,
    pub checkpointer: Option<Arc<dyn Checkpointer>>,
    pub events: flume::Sender<Event>,
    pub cancel: CancellationToken,
    pub config: Arc<RuntimeConfig>,
    pub execution_id: String,
    pub thread_id: String,
    /// Nodes to pause before instead of executing (wizard-style
    /// confirmation points). Per-request, never checkpointed.
    pub interrupt_before: Vec<String>,
}

/// The live mutable triple the scheduler owns for a running execution.
#[derive(Clone, Debug)]
pub struct ExecutionState {
    pub state: WorkflowState,
    pub frontier: Vec<FrontierEntry>,
    pub ledger: JoinLedger,
}

impl ExecutionState {
    /// Fresh execution state entering at the graph's entry frontier.
    #[must_use]
    pub fn fresh(graph: &CompiledGraph, state: WorkflowState) -> Self {
        Self {
            state,
            frontier: graph.entry.iter().cloned().map(FrontierEntry::plain).collect(),
            ledger: JoinLedger::new(),
        }
    }

    /// `true` when no executable work remains.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.frontier.iter().all(|e| e.node.is_end())
    }
}

/// Where the execution stands after one super-step.
#[derive(Debug)]
pub enum StepStatus {
    Continue,
    Completed,
    AwaitingInput { reason: String },
    Cancelled,
    Failed { node_id: String, failure: NodeFailure },
}

/// Result of one super-step.
#[derive(Debug)]
pub struct StepOutcome {
    pub step_index: u64,
    pub ran: Vec<String>,
    pub status: StepStatus,
}

struct ExecutedNode {
    node_id: String,
    run: NodeRun,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    input_snapshot: Value,
}

/// Super-step executor.
pub struct Scheduler {
    semaphore: Option<Arc<Semaphore>>,
}

impl Scheduler {
    /// `fan_out_limit` bounds concurrent node executions per super-step;
    /// `None` leaves I/O-bound fan-out unbounded.
    #[must_use]
    pub fn new(fan_out_limit: Option<usize>) -> Self {
        Self {
            semaphore: fan_out_limit.map(|n| Arc::new(Semaphore::new(n.max(1)))),
        }
    }

    /// Executes one super-step.
    #[instrument(skip(self, ctx, exec), fields(execution_id = %ctx.execution_id, step = exec.state.step() + 1), err)]
    pub async fn superstep(
        &self,
        ctx: &ExecContext,
        exec: &mut ExecutionState,
    ) -> Result<StepOutcome, SchedulerError> {
        if ctx.cancel.is_cancelled() {
            return Ok(StepOutcome {
                step_index: exec.state.step(),
                ran: vec![],
                status: StepStatus::Cancelled,
            });
        }

        let active: Vec<FrontierEntry> = exec
            .frontier
            .iter()
            .filter(|e| !e.node.is_end())
            .cloned()
            .collect();
        if active.is_empty() {
            return Ok(StepOutcome {
                step_index: exec.state.step(),
                ran: vec![],
                status: StepStatus::Completed,
            });
        }

        // Interrupt points suspend before executing; the frontier is left
        // untouched so resuming re-enters exactly here.
        if let Some(entry) = active
            .iter()
            .find(|e| e.node_id().is_some_and(|id| ctx.interrupt_before.iter().any(|i| i == id)))
        {
            let node_id = entry.node_id().unwrap_or_default().to_string();
            return Ok(StepOutcome {
                step_index: exec.state.step(),
                ran: vec![],
                status: StepStatus::AwaitingInput {
                    reason: format!("interrupted before node '{node_id}'"),
                },
            });
        }

        // Partition: joins whose predecessors have not all settled are
        // carried into the next frontier untouched.
        let mut runnable: Vec<(FrontierEntry, Option<JoinEntry>)> = Vec::new();
        let mut deferred: Vec<FrontierEntry> = Vec::new();
        for entry in active {
            let Some(node_id) = entry.node_id() else {
                continue;
            };
            match ctx.graph.node(node_id).map(|n| &n.payload) {
                Some(NodePayload::Join(join)) => {
                    if exec.ledger.is_ready(node_id, &join.wait_for) {
                        let ledger_entry = exec.ledger.take(node_id);
                        runnable.push((entry, Some(ledger_entry)));
                    } else {
                        deferred.push(entry);
                    }
                }
                _ => runnable.push((entry, None)),
            }
        }

        if runnable.is_empty() {
            // Every remaining entry is a join waiting on predecessors that
            // can no longer arrive.
            let stuck: Vec<String> = deferred
                .iter()
                .filter_map(|e| e.node_id().map(ToString::to_string))
                .collect();
            return Ok(StepOutcome {
                step_index: exec.state.step(),
                ran: vec![],
                status: StepStatus::Failed {
                    node_id: stuck.first().cloned().unwrap_or_default(),
                    failure: NodeFailure::new(
                        NodeErrorKind::Internal,
                        format!("joins {stuck:?} are waiting on predecessors that never ran"),
                    ),
                },
            });
        }

        exec.state.advance_step();
        let step_index = exec.state.step();
        let snapshot = exec.state.snapshot();

        let futures: Vec<_> = runnable
            .into_iter()
            .map(|(entry, ledger_entry)| self.execute_entry(ctx, &snapshot, entry, ledger_entry, step_index))
            .collect();
        let mut results: Vec<ExecutedNode> = join_all(futures).await;

        let ran: Vec<String> = results.iter().map(|r| r.node_id.clone()).collect();

        // Cancellation fired while nodes were in flight: their deltas are
        // discarded and nothing further is written.
        if ctx.cancel.is_cancelled() {
            return Ok(StepOutcome {
                step_index,
                ran,
                status: StepStatus::Cancelled,
            });
        }

        // Deterministic processing order, independent of completion order.
        results.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        let mut deltas: Vec<(String, StateDelta)> = Vec::new();
        let mut next: Vec<FrontierEntry> = deferred;
        let mut terminal_failure: Option<(String, NodeFailure)> = None;
        let mut step_records: Vec<StepRecord> = Vec::new();

        for executed in results {
            let node_id = executed.node_id.clone();
            let run = executed.run;
            let compiled = ctx.graph.node(&node_id);

            match run.outcome {
                Some(NodeOutcome::StateUpdate { delta, next: node_next }) => {
                    for (join_id, predecessor, count) in &run.expectations {
                        exec.ledger.expect(join_id, predecessor, *count);
                    }
                    if let Some(join_id) = ctx.graph.feeds_join.get(&node_id) {
                        exec.ledger.record_completion(join_id, &node_id, delta.clone());
                    }

                    let delta_value = serde_json::to_value(&delta.props).unwrap_or(Value::Null);
                    let output_delta = match &run.routed_to {
                        Some(target) => json!({"routed_to": target.encode()}),
                        None => delta_value,
                    };
                    self.emit(ctx, Event::NodeComplete {
                        node_id: node_id.clone(),
                        step_index,
                        delta_digest: value_digest(&output_delta),
                    });
                    step_records.push(StepRecord {
                        execution_id: ctx.execution_id.clone(),
                        step_index,
                        node_id: node_id.clone(),
                        started_at: executed.started_at,
                        finished_at: executed.finished_at,
                        input_snapshot: executed.input_snapshot,
                        output_delta,
                        events: invocation_events(&node_id, &run.invocations),
                        error: None,
                    });

                    if !delta.is_empty() {
                        deltas.push((node_id.clone(), delta));
                    }
                    for entry in node_next {
                        if !next.contains(&entry) {
                            next.push(entry);
                        }
                    }
                }
                Some(NodeOutcome::Suspend { reason }) => {
                    // The suspended node stays in the frontier so resume
                    // re-executes it against the overlaid input.
                    let entry = FrontierEntry::plain(NodeRef::node(node_id.clone()));
                    if !next.contains(&entry) {
                        next.push(entry);
                    }
                    exec.frontier = next;
                    return Ok(StepOutcome {
                        step_index,
                        ran,
                        status: StepStatus::AwaitingInput { reason },
                    });
                }
                Some(NodeOutcome::Fail(failure)) => {
                    self.emit(ctx, Event::NodeError {
                        node_id: node_id.clone(),
                        step_index,
                        error: failure.to_string(),
                    });
                    step_records.push(StepRecord {
                        execution_id: ctx.execution_id.clone(),
                        step_index,
                        node_id: node_id.clone(),
                        started_at: executed.started_at,
                        finished_at: executed.finished_at,
                        input_snapshot: executed.input_snapshot,
                        output_delta: Value::Null,
                        events: invocation_events(&node_id, &run.invocations),
                        error: Some(failure.to_string()),
                    });

                    let catch = compiled.and_then(|n| n.catch.clone());
                    if let Some(catch_target) = catch {
                        // Failed node's delta is discarded; the catch route
                        // receives the error through a reserved property.
                        deltas.push((
                            node_id.clone(),
                            StateDelta::of(
                                "last_error",
                                json!({
                                    "node_id": node_id,
                                    "kind": failure.kind,
                                    "detail": failure.detail,
                                }),
                            ),
                        ));
                        let entry = FrontierEntry::plain(catch_target);
                        if !next.contains(&entry) {
                            next.push(entry);
                        }
                    } else if let Some(join_id) = ctx.graph.feeds_join.get(&node_id) {
                        exec.ledger.record_failure(join_id, &node_id);
                        // The failed branch produces no successor entry, so
                        // make sure its join still reaches the frontier.
                        let entry = FrontierEntry::plain(NodeRef::node(join_id.clone()));
                        if !next.contains(&entry) {
                            next.push(entry);
                        }
                    } else if terminal_failure.is_none() {
                        terminal_failure = Some((node_id.clone(), failure));
                    }
                }
                None => {
                    warn!(node_id = %node_id, "node produced no outcome");
                }
            }
        }

        let updated = apply_barrier(&mut exec.state, &ctx.graph.schema, deltas);
        debug!(step = step_index, ?updated, "barrier applied");

        if let Some(cp) = &ctx.checkpointer {
            for record in step_records {
                cp.append_step(record).await?;
            }
        }

        exec.frontier = next;

        let status = if let Some((node_id, failure)) = terminal_failure {
            StepStatus::Failed { node_id, failure }
        } else if exec.frontier.is_empty() || exec.is_settled() {
            StepStatus::Completed
        } else {
            StepStatus::Continue
        };

        Ok(StepOutcome {
            step_index,
            ran,
            status,
        })
    }

    async fn execute_entry(
        &self,
        ctx: &ExecContext,
        base_snapshot: &StateSnapshot,
        entry: FrontierEntry,
        ledger_entry: Option<JoinEntry>,
        step_index: u64,
    ) -> ExecutedNode {
        let _permit = match &self.semaphore {
            Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
            None => None,
        };

        let node_id = entry.node_id().unwrap_or_default().to_string();
        let snapshot = match &entry.overlay {
            Some(overlay) => base_snapshot.with_overlay(overlay),
            None => base_snapshot.clone(),
        };
        let input_snapshot = snapshot.to_value();
        let started_at = Utc::now();

        self.emit(ctx, Event::NodeStart {
            node_id: node_id.clone(),
            step_index,
            input_snapshot_ref: value_digest(&input_snapshot),
        });

        let exec_ctx = ExecutorContext {
            node_id: &node_id,
            step: step_index,
            snapshot,
            graph: ctx.graph.as_ref(),
            providers: ctx.providers.as_ref(),
            events: ctx.events.clone(),
            cancel: ctx.cancel.clone(),
            config: ctx.config.as_ref(),
        };

        let work = async {
            match ctx.graph.node(&node_id).map(|n| &n.payload) {
                Some(NodePayload::Agent(agent)) => run_agent(agent, &exec_ctx).await,
                Some(NodePayload::Router(router)) => run_router(router, &exec_ctx),
                Some(NodePayload::Parallel(parallel)) => run_parallel(parallel, &exec_ctx),
                Some(NodePayload::Join(join)) => {
                    run_join(join, ledger_entry.unwrap_or_default(), &exec_ctx)
                }
                Some(NodePayload::Subgraph(sub)) => {
                    self.run_subgraph(ctx, sub, &exec_ctx).await
                }
                None => NodeRun {
                    outcome: Some(NodeOutcome::Fail(NodeFailure::new(
                        NodeErrorKind::Internal,
                        format!("frontier references unknown node '{node_id}'"),
                    ))),
                    ..NodeRun::default()
                },
            }
        };

        let run = match ctx.config.node_timeout {
            Some(budget) => match tokio::time::timeout(budget, work).await {
                Ok(run) => run,
                Err(_) => NodeRun {
                    outcome: Some(NodeOutcome::Fail(NodeFailure::new(
                        NodeErrorKind::NodeTimeout,
                        format!("node exceeded its budget of {}ms", budget.as_millis()),
                    ))),
                    ..NodeRun::default()
                },
            },
            None => work.await,
        };

        ExecutedNode {
            node_id,
            run,
            started_at,
            finished_at: Utc::now(),
            input_snapshot,
        }
    }

    /// SUBGRAPH: project parent state, run the child graph to completion on
    /// a namespaced thread sharing the parent's checkpointer, and merge the
    /// child's output under the node's output key.
    async fn run_subgraph(
        &self,
        ctx: &ExecContext,
        sub: &CompiledSubgraph,
        exec_ctx: &ExecutorContext<'_>,
    ) -> NodeRun {
        let child_thread = ids::subgraph_thread_id(&ctx.thread_id, exec_ctx.node_id);

        let mut builder = WorkflowState::builder();
        if sub.mapping.is_empty() {
            for (k, v) in &exec_ctx.snapshot.props {
                builder = builder.with_property(k.clone(), v.clone());
            }
        } else {
            for (k, v) in sub.mapping.apply(&exec_ctx.snapshot) {
                builder = builder.with_property(k, v);
            }
        }
        let mut child_state = builder.build();
        child_state.set(THREAD_ID_PROPERTY, Value::String(child_thread.clone()));

        let child_ctx = ExecContext {
            graph: Arc::clone(&sub.graph),
            thread_id: child_thread.clone(),
            interrupt_before: Vec::new(),
            ..ctx.clone()
        };
        let mut child_exec = ExecutionState::fresh(&sub.graph, child_state);

        loop {
            let outcome = match Box::pin(self.superstep(&child_ctx, &mut child_exec)).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    return NodeRun {
                        outcome: Some(NodeOutcome::Fail(NodeFailure::new(
                            NodeErrorKind::Checkpoint,
                            e.to_string(),
                        ))),
                        ..NodeRun::default()
                    }
                }
            };

            if matches!(outcome.status, StepStatus::Continue | StepStatus::Completed)
                && !outcome.ran.is_empty()
            {
                if let Some(cp) = &child_ctx.checkpointer {
                    let checkpoint = Checkpoint::new(
                        child_thread.clone(),
                        child_exec.state.clone(),
                        child_exec.frontier.clone(),
                        child_exec.ledger.clone(),
                    );
                    if let Err(e) = cp.save(checkpoint).await {
                        return NodeRun {
                            outcome: Some(NodeOutcome::Fail(NodeFailure::new(
                                NodeErrorKind::Checkpoint,
                                e.to_string(),
                            ))),
                            ..NodeRun::default()
                        };
                    }
                }
            }

            match outcome.status {
                StepStatus::Continue => continue,
                StepStatus::Completed => break,
                StepStatus::Cancelled => {
                    return NodeRun {
                        outcome: Some(NodeOutcome::Fail(NodeFailure::new(
                            NodeErrorKind::Cancelled,
                            "subgraph cancelled",
                        ))),
                        ..NodeRun::default()
                    }
                }
                StepStatus::AwaitingInput { reason } => {
                    return NodeRun {
                        outcome: Some(NodeOutcome::Fail(NodeFailure::new(
                            NodeErrorKind::Internal,
                            format!("subgraph suspended ({reason}); subgraphs must run to completion"),
                        ))),
                        ..NodeRun::default()
                    }
                }
                StepStatus::Failed { node_id, failure } => {
                    return NodeRun {
                        outcome: Some(NodeOutcome::Fail(NodeFailure::new(
                            failure.kind,
                            format!("subgraph node '{node_id}' failed: {}", failure.detail),
                        ))),
                        ..NodeRun::default()
                    }
                }
            }
        }

        let output = match &sub.graph.output_key {
            Some(key) => child_exec.state.get(key).cloned().unwrap_or(Value::Null),
            None => child_exec.state.to_value(),
        };

        NodeRun {
            outcome: Some(NodeOutcome::StateUpdate {
                delta: StateDelta::of(sub.output_key.clone(), output),
                next: vec![FrontierEntry::plain(sub.next.clone())],
            }),
            ..NodeRun::default()
        }
    }

    fn emit(&self, ctx: &ExecContext, event: Event) {
        let _ = ctx.events.send(event);
    }
}

/// Rebuilds the tool-call event pairs for the durable step record.
fn invocation_events(node_id: &str, invocations: &[crate::tools::ToolInvocation]) -> Vec<Event> {
    let mut events = Vec::with_capacity(invocations.len() * 2);
    for invocation in invocations {
        events.push(Event::ToolCall {
            node_id: node_id.to_string(),
            tool_id: invocation.tool_id.clone(),
            arguments_digest: value_digest(&invocation.arguments),
        });
        events.push(Event::ToolResult {
            node_id: node_id.to_string(),
            tool_id: invocation.tool_id.clone(),
            ok: invocation.result.is_ok(),
            duration_ms: (invocation.finished_at - invocation.started_at)
                .num_milliseconds()
                .max(0) as u64,
        });
    }
    events
}

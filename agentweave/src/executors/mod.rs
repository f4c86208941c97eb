//! Node executors: the closed set of behaviours dispatched by node kind.
//!
//! Every executor is a function from `(snapshot, compiled config, context)`
//! to a [`NodeOutcome`]: a state delta plus next frontier entries, a
//! suspension, or a categorised failure. Executors never touch live state;
//! the scheduler merges their deltas at the barrier.
//!
//! SUBGRAPH execution lives in the scheduler, which recurses into the child
//! graph; the other four kinds are implemented here.

use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::agents::{ProviderPool, ToolLoop, ToolLoopConfig, ToolLoopError};
use crate::event_bus::Event;
use crate::graph::{CompiledAgent, CompiledGraph, CompiledJoin, CompiledParallel, CompiledRouter};
use crate::graph::spec::{FailurePolicy, OnBudget};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::frontier::FrontierEntry;
use crate::runtime::ledger::JoinEntry;
use crate::state::{StateDelta, StateSnapshot};
use crate::tools::ToolInvocation;
use crate::types::NodeRef;

/// Error taxonomy for node failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeErrorKind {
    NodeTimeout,
    ExecutionTimeout,
    Cancelled,
    ToolLoopBudgetExhausted,
    SchemaValidation,
    Provider,
    JoinFailed,
    Checkpoint,
    Internal,
}

impl fmt::Display for NodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NodeTimeout => "NODE_TIMEOUT",
            Self::ExecutionTimeout => "EXECUTION_TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::ToolLoopBudgetExhausted => "TOOL_LOOP_BUDGET_EXHAUSTED",
            Self::SchemaValidation => "SCHEMA_VALIDATION",
            Self::Provider => "PROVIDER",
            Self::JoinFailed => "JOIN_FAILED",
            Self::Checkpoint => "CHECKPOINT",
            Self::Internal => "INTERNAL",
        };
        f.write_str(s)
    }
}

/// A node-level failure: kind, human-readable detail, retryability.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct NodeFailure {
    pub kind: NodeErrorKind,
    pub detail: String,
    pub retryable: bool,
}

impl NodeFailure {
    #[must_use]
    pub fn new(kind: NodeErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            retryable: false,
        }
    }

    #[must_use]
    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

impl From<ToolLoopError> for NodeFailure {
    fn from(err: ToolLoopError) -> Self {
        match err {
            ToolLoopError::BudgetExhausted { iterations, .. } => NodeFailure::new(
                NodeErrorKind::ToolLoopBudgetExhausted,
                format!("tool loop exhausted its budget of {iterations} iterations"),
            ),
            ToolLoopError::SchemaValidation { detail } => {
                NodeFailure::new(NodeErrorKind::SchemaValidation, detail)
            }
            ToolLoopError::IterationTimeout { iteration } => NodeFailure::new(
                NodeErrorKind::NodeTimeout,
                format!("loop iteration {iteration} exceeded its time budget"),
            ),
            ToolLoopError::Provider(e) => {
                let retryable = e.is_retryable();
                let failure = NodeFailure::new(NodeErrorKind::Provider, e.to_string());
                if retryable {
                    failure.retryable()
                } else {
                    failure
                }
            }
            ToolLoopError::Cancelled => {
                NodeFailure::new(NodeErrorKind::Cancelled, "cancelled")
            }
        }
    }
}

/// What one node execution produced.
#[derive(Debug)]
pub enum NodeOutcome {
    /// Delta to merge at the barrier plus next frontier entries.
    StateUpdate {
        delta: StateDelta,
        next: Vec<FrontierEntry>,
    },
    /// Pause signal; the scheduler checkpoints and returns AWAITING_INPUT.
    Suspend { reason: String },
    /// Categorised failure; routing is decided by catch edges and joins.
    Fail(NodeFailure),
}

/// Executor result plus the bookkeeping the scheduler folds into the step
/// record and join ledger.
#[derive(Debug, Default)]
pub struct NodeRun {
    pub outcome: Option<NodeOutcome>,
    /// Tool invocations performed by an AGENT node, in emission order.
    pub invocations: Vec<ToolInvocation>,
    /// Routing decision recorded by a ROUTER node.
    pub routed_to: Option<NodeRef>,
    /// `(join_id, predecessor, multiplicity)` declarations from a PARALLEL
    /// dynamic fan-out.
    pub expectations: Vec<(String, String, usize)>,
}

impl NodeRun {
    fn from_outcome(outcome: NodeOutcome) -> Self {
        Self {
            outcome: Some(outcome),
            ..Self::default()
        }
    }
}

/// Everything an executor may consult.
pub struct ExecutorContext<'a> {
    pub node_id: &'a str,
    pub step: u64,
    pub snapshot: StateSnapshot,
    pub graph: &'a CompiledGraph,
    pub providers: &'a ProviderPool,
    pub events: flume::Sender<Event>,
    pub cancel: CancellationToken,
    pub config: &'a RuntimeConfig,
}

/// AGENT: materialize inputs, drive the tool loop, write the final response
/// under the node's output key, advance along the single outgoing edge.
pub async fn run_agent(agent: &CompiledAgent, ctx: &ExecutorContext<'_>) -> NodeRun {
    let bundle = if agent.mapping.is_empty() {
        let mut bundle = FxHashMap::default();
        let input = ctx
            .snapshot
            .get("input")
            .cloned()
            .unwrap_or_else(|| ctx.snapshot.to_value());
        bundle.insert("input".to_string(), input);
        bundle
    } else {
        agent.mapping.apply(&ctx.snapshot)
    };

    let provider = &agent.definition.model.provider;
    let model = match ctx.providers.model(provider) {
        Ok(model) => model,
        Err(e) => {
            return NodeRun::from_outcome(NodeOutcome::Fail(NodeFailure::new(
                NodeErrorKind::Provider,
                e.to_string(),
            )))
        }
    };

    // Held for the duration of the loop to respect provider rate limits.
    let _permit = ctx.providers.acquire(provider).await;

    let loop_config = ToolLoopConfig {
        max_iterations: agent
            .max_iterations
            .unwrap_or(crate::agents::MAX_TOOL_ITERATIONS),
        iteration_timeout: ctx.config.iteration_timeout,
        tool_timeout_cap: ctx.config.tool_timeout_cap,
    };
    let tool_loop = ToolLoop::new(
        model,
        agent.bindings.clone(),
        loop_config,
        ctx.cancel.clone(),
    )
    .with_events(ctx.node_id, ctx.events.clone());

    match tool_loop.run(&agent.definition, &bundle).await {
        Ok(result) => {
            debug!(
                node_id = %ctx.node_id,
                iterations = result.iterations,
                tokens = result.usage.total_tokens,
                "agent node complete"
            );
            NodeRun {
                outcome: Some(NodeOutcome::StateUpdate {
                    delta: StateDelta::of(agent.output_key.clone(), result.output),
                    next: vec![FrontierEntry::plain(agent.next.clone())],
                }),
                invocations: result.invocations,
                ..NodeRun::default()
            }
        }
        Err(ToolLoopError::BudgetExhausted { transcript, .. })
            if agent.on_budget == OnBudget::ReturnPartial =>
        {
            // Last assistant text stands in for the final response.
            let partial = transcript
                .iter()
                .rev()
                .find(|m| m.role == crate::agents::Role::Assistant && !m.content.is_empty())
                .map(|m| m.content.clone())
                .unwrap_or_default();
            NodeRun::from_outcome(NodeOutcome::StateUpdate {
                delta: StateDelta::of(agent.output_key.clone(), Value::String(partial)),
                next: vec![FrontierEntry::plain(agent.next.clone())],
            })
        }
        Err(err) => NodeRun::from_outcome(NodeOutcome::Fail(NodeFailure::from(err))),
    }
}

/// ROUTER: first matching route wins; the synthesized `default` guarantees a
/// match. Pure, no state delta.
pub fn run_router(router: &CompiledRouter, ctx: &ExecutorContext<'_>) -> NodeRun {
    for route in &router.routes {
        if route.predicate.eval(&ctx.snapshot) {
            debug!(
                node_id = %ctx.node_id,
                condition = %route.predicate,
                target = %route.target,
                "router matched"
            );
            return NodeRun {
                outcome: Some(NodeOutcome::StateUpdate {
                    delta: StateDelta::empty(),
                    next: vec![FrontierEntry::plain(route.target.clone())],
                }),
                routed_to: Some(route.target.clone()),
                ..NodeRun::default()
            };
        }
    }
    // Unreachable: compilation appends the default route.
    NodeRun::from_outcome(NodeOutcome::Fail(NodeFailure::new(
        NodeErrorKind::Internal,
        "router matched no route",
    )))
}

/// PARALLEL: one frontier entry per outgoing edge; with `fan_out_key`, one
/// entry per `(item, branch)` with the item layered onto the branch view.
/// Zero time, no delta.
pub fn run_parallel(parallel: &CompiledParallel, ctx: &ExecutorContext<'_>) -> NodeRun {
    let items = parallel
        .fan_out_key
        .as_deref()
        .and_then(|key| ctx.snapshot.get(key))
        .and_then(Value::as_array)
        .cloned();

    let mut next = Vec::new();
    let mut expectations = Vec::new();

    match items {
        Some(items) if !items.is_empty() => {
            for (index, item) in items.iter().enumerate() {
                for branch in &parallel.branches {
                    let mut overlay = FxHashMap::default();
                    overlay.insert("parallel_item".to_string(), item.clone());
                    overlay.insert("parallel_index".to_string(), json!(index));
                    next.push(FrontierEntry::with_overlay(branch.clone(), overlay));
                }
            }
            if let Some(join_id) = &parallel.join {
                for branch in &parallel.branches {
                    if let Some(branch_id) = branch.id() {
                        expectations.push((join_id.clone(), branch_id.to_string(), items.len()));
                    }
                }
            }
        }
        _ => {
            next.extend(parallel.branches.iter().cloned().map(FrontierEntry::plain));
        }
    }

    NodeRun {
        outcome: Some(NodeOutcome::StateUpdate {
            delta: StateDelta::empty(),
            next,
        }),
        expectations,
        ..NodeRun::default()
    }
}

/// JOIN: consult the ledger entry, apply the failure policy, aggregate the
/// recorded branch deltas, advance along the single outgoing edge.
pub fn run_join(join: &CompiledJoin, entry: JoinEntry, ctx: &ExecutorContext<'_>) -> NodeRun {
    let total = join.wait_for.len();
    let failed = entry.failed.len();

    let policy_failed = match join.failure_policy {
        FailurePolicy::Any => failed > 0,
        FailurePolicy::Majority => failed * 2 > total,
        FailurePolicy::AllRequired => failed == total && total > 0,
    };
    if policy_failed {
        let mut failed_ids: Vec<&str> = entry.failed.iter().map(String::as_str).collect();
        failed_ids.sort_unstable();
        return NodeRun::from_outcome(NodeOutcome::Fail(NodeFailure::new(
            NodeErrorKind::JoinFailed,
            format!(
                "{failed} of {total} predecessors failed ({}), policy {:?}",
                failed_ids.join(", "),
                join.failure_policy
            ),
        )));
    }

    let aggregated = join.reducer.aggregate(&entry.branches);
    debug!(
        node_id = %ctx.node_id,
        strategy = %join.strategy,
        branches = entry.branches.len(),
        "join aggregated"
    );

    NodeRun::from_outcome(NodeOutcome::StateUpdate {
        delta: StateDelta::of(join.output_key.clone(), aggregated),
        next: vec![FrontierEntry::plain(join.next.clone())],
    })
}

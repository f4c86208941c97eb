//! Graph compilation: validation passes and reference resolution.
//!
//! Compilation is expensive but amortised across every execution of the same
//! workflow version; all graph errors surface here so runtime failures are
//! purely data- or side-effect-dependent. Passes run in order:
//!
//! 1. Structural: unique ids, resolvable endpoints, per-kind shape rules.
//! 2. Reachability: everything reachable from `__start__` (warn otherwise);
//!    `__end__` reachable (fail otherwise).
//! 3. Cycle policy: cycles must be broken by a router; fully unconditional
//!    cycles fail.
//! 4. Parallel/join pairing: each parallel region has a unique post-dominator
//!    join; branches may exit to `__end__` without it.
//! 5. Router conditions: parsed to sandboxed predicates; a `default` route is
//!    synthesized when missing.
//!
//! Reference resolution (agents, tools, subgraph workflows, join reducers)
//! happens alongside, through the [`ResourceResolver`] seam and the tool
//! registry.

use async_trait::async_trait;
use miette::Diagnostic;
use petgraph::algo::{has_path_connecting, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::agents::AgentDefinition;
use crate::graph::condition::{ConditionError, Predicate};
use crate::graph::mapping::{CompiledMapping, MappingError};
use crate::graph::spec::{
    AgentNodeConfig, EdgeSpec, FailurePolicy, GraphSpec, JoinNodeConfig, NodeSpec, OnBudget,
    ParallelNodeConfig, SubgraphNodeConfig,
};
use crate::reducers::{JoinReducer, JoinReducerRegistry};
use crate::schema::{SchemaError, StateSchema};
use crate::tools::{ToolBinding, ToolFailure, ToolRegistry};
use crate::types::{NodeRef, NodeType, THREAD_ID_PROPERTY};

/// Default subgraph nesting limit.
pub const DEFAULT_MAX_SUBGRAPH_DEPTH: usize = 4;

/// Fetches agent definitions and workflow specs by identifier.
///
/// The storage layer implements this; tests use in-memory maps.
#[async_trait]
pub trait ResourceResolver: Send + Sync {
    async fn agent(&self, agent_id: &str) -> Result<AgentDefinition, ResolveError>;
    async fn workflow(&self, workflow_id: &str) -> Result<GraphSpec, ResolveError>;
}

/// Resolution failures from the storage seam.
#[derive(Debug, Error, Diagnostic)]
pub enum ResolveError {
    #[error("agent '{agent_id}' not found")]
    #[diagnostic(code(agentweave::resolve::agent_not_found))]
    AgentNotFound { agent_id: String },

    #[error("workflow '{workflow_id}' not found")]
    #[diagnostic(code(agentweave::resolve::workflow_not_found))]
    WorkflowNotFound { workflow_id: String },

    #[error("resolver backend error: {detail}")]
    #[diagnostic(code(agentweave::resolve::backend))]
    Backend { detail: String },
}

/// Compilation failures. Each validation pass produces a specific kind.
#[derive(Debug, Error, Diagnostic)]
pub enum CompileError {
    #[error("duplicate node id '{node_id}'")]
    #[diagnostic(code(agentweave::compile::duplicate_node))]
    DuplicateNode { node_id: String },

    #[error("edge {source_node} -> {target} references unknown node '{unknown}'")]
    #[diagnostic(code(agentweave::compile::unknown_endpoint))]
    UnknownEndpoint {
        source_node: String,
        target: String,
        unknown: String,
    },

    #[error("edge {source_node} -> {target} is invalid: {detail}")]
    #[diagnostic(code(agentweave::compile::invalid_edge))]
    InvalidEdge {
        source_node: String,
        target: String,
        detail: String,
    },

    #[error("graph has no entry point")]
    #[diagnostic(
        code(agentweave::compile::missing_entry),
        help("set entry_point or add an edge from __start__")
    )]
    MissingEntry,

    #[error("node '{node_id}' has invalid shape: {detail}")]
    #[diagnostic(code(agentweave::compile::node_shape))]
    NodeShape { node_id: String, detail: String },

    #[error("node '{node_id}' config is invalid: {detail}")]
    #[diagnostic(code(agentweave::compile::node_config))]
    NodeConfig { node_id: String, detail: String },

    #[error("join '{node_id}' wait_for {declared:?} does not match incoming predecessors {incoming:?}")]
    #[diagnostic(code(agentweave::compile::wait_for_mismatch))]
    WaitForMismatch {
        node_id: String,
        declared: Vec<String>,
        incoming: Vec<String>,
    },

    #[error("__end__ is not reachable from __start__")]
    #[diagnostic(code(agentweave::compile::end_unreachable))]
    EndUnreachable,

    #[error("unconditional cycle through nodes {nodes:?}")]
    #[diagnostic(
        code(agentweave::compile::unconditional_cycle),
        help("break the cycle with a router condition")
    )]
    UnconditionalCycle { nodes: Vec<String> },

    #[error("parallel '{parallel_id}' branches reach different joins: {joins:?}")]
    #[diagnostic(code(agentweave::compile::ambiguous_join))]
    AmbiguousJoin {
        parallel_id: String,
        joins: Vec<String>,
    },

    #[error("parallel '{parallel_id}' uses fan_out_key but branch '{branch}' does not feed the join directly")]
    #[diagnostic(code(agentweave::compile::fan_out_branch_shape))]
    FanOutBranchShape { parallel_id: String, branch: String },

    #[error("router '{node_id}' inside a parallel region reads undeclared property '{property}'")]
    #[diagnostic(
        code(agentweave::compile::router_reads_undeclared),
        help("declare the property in state_schema so the condition cannot depend on unjoined siblings")
    )]
    RouterReadsUndeclared { node_id: String, property: String },

    #[error("condition on edge from '{source_node}' failed to parse")]
    #[diagnostic(code(agentweave::compile::condition))]
    Condition {
        source_node: String,
        #[source]
        source: ConditionError,
    },

    #[error("input mapping on node '{node_id}' failed to parse")]
    #[diagnostic(code(agentweave::compile::mapping))]
    Mapping {
        node_id: String,
        #[source]
        source: MappingError,
    },

    #[error(transparent)]
    #[diagnostic(code(agentweave::compile::schema))]
    Schema(#[from] SchemaError),

    #[error("join '{node_id}' uses unknown aggregation strategy '{strategy}' (available: {available:?})")]
    #[diagnostic(code(agentweave::compile::unknown_strategy))]
    UnknownStrategy {
        node_id: String,
        strategy: String,
        available: Vec<String>,
    },

    #[error("tool resolution failed for node '{node_id}'")]
    #[diagnostic(code(agentweave::compile::tool))]
    Tool {
        node_id: String,
        #[source]
        source: ToolFailure,
    },

    #[error(transparent)]
    #[diagnostic(code(agentweave::compile::resolve))]
    Resolve(#[from] ResolveError),

    #[error("subgraph nesting exceeds the depth limit of {limit}")]
    #[diagnostic(code(agentweave::compile::depth_exceeded))]
    DepthExceeded { limit: usize },
}

/// A compiled, immutable workflow graph.
///
/// Shared via `Arc` across every execution of the same workflow version.
pub struct CompiledGraph {
    pub workflow_id: String,
    pub schema: StateSchema,
    /// Initial frontier: successors of `__start__`.
    pub entry: Vec<NodeRef>,
    /// State property projected as the execution output.
    pub output_key: Option<String>,
    nodes: FxHashMap<String, CompiledNode>,
    /// node id → join id whose ledger records that node's delta.
    pub feeds_join: FxHashMap<String, String>,
    /// parallel node id → region annotation.
    pub regions: FxHashMap<String, ParallelRegion>,
}

impl CompiledGraph {
    /// Looks up a compiled node.
    #[must_use]
    pub fn node(&self, node_id: &str) -> Option<&CompiledNode> {
        self.nodes.get(node_id)
    }

    /// Iterates compiled nodes.
    pub fn nodes(&self) -> impl Iterator<Item = &CompiledNode> {
        self.nodes.values()
    }
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("workflow_id", &self.workflow_id)
            .field("nodes", &self.nodes.len())
            .field("entry", &self.entry)
            .finish()
    }
}

/// One compiled node: kind-specific payload plus the error catch route.
pub struct CompiledNode {
    pub node_id: String,
    pub node_type: NodeType,
    /// Target of the `on_error` catch edge, when declared.
    pub catch: Option<NodeRef>,
    pub payload: NodePayload,
}

/// Kind-specific compiled payloads; a closed set dispatched exhaustively.
pub enum NodePayload {
    Agent(CompiledAgent),
    Router(CompiledRouter),
    Parallel(CompiledParallel),
    Join(CompiledJoin),
    Subgraph(CompiledSubgraph),
}

pub struct CompiledAgent {
    pub definition: Arc<AgentDefinition>,
    pub bindings: Vec<ToolBinding>,
    pub mapping: CompiledMapping,
    pub output_key: String,
    pub on_budget: OnBudget,
    pub max_iterations: Option<usize>,
    pub next: NodeRef,
}

#[derive(Clone)]
pub struct CompiledRoute {
    pub predicate: Predicate,
    pub target: NodeRef,
}

pub struct CompiledRouter {
    /// Ordered routes; the final entry is always the `default` fallback.
    pub routes: Vec<CompiledRoute>,
}

pub struct CompiledParallel {
    pub branches: Vec<NodeRef>,
    pub fan_out_key: Option<String>,
    pub join: Option<String>,
}

pub struct CompiledJoin {
    pub wait_for: Vec<String>,
    pub reducer: Arc<dyn JoinReducer>,
    pub strategy: String,
    pub output_key: String,
    pub failure_policy: FailurePolicy,
    pub next: NodeRef,
}

pub struct CompiledSubgraph {
    pub graph: Arc<CompiledGraph>,
    pub mapping: CompiledMapping,
    pub output_key: String,
    pub next: NodeRef,
}

/// A parallel region annotation: branches and their post-dominator join.
#[derive(Clone, Debug)]
pub struct ParallelRegion {
    pub parallel_id: String,
    pub branches: Vec<NodeRef>,
    /// `None` when every branch exits to `__end__`.
    pub join: Option<String>,
}

/// The graph compiler.
///
/// Holds the resolver seam, the tool registry to bind against, and the join
/// reducer registry for strategy resolution.
pub struct Compiler {
    resolver: Arc<dyn ResourceResolver>,
    tools: Option<Arc<ToolRegistry>>,
    reducers: JoinReducerRegistry,
    max_depth: usize,
}

impl Compiler {
    #[must_use]
    pub fn new(resolver: Arc<dyn ResourceResolver>) -> Self {
        Self {
            resolver,
            tools: None,
            reducers: JoinReducerRegistry::default(),
            max_depth: DEFAULT_MAX_SUBGRAPH_DEPTH,
        }
    }

    /// Binds tools against an explicit registry instead of the process-wide
    /// one.
    #[must_use]
    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Replaces the join reducer registry (user-named reducers).
    #[must_use]
    pub fn with_reducers(mut self, reducers: JoinReducerRegistry) -> Self {
        self.reducers = reducers;
        self
    }

    /// Overrides the subgraph nesting limit.
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Compiles a graph description into an executable graph.
    pub async fn compile(&self, spec: &GraphSpec) -> Result<CompiledGraph, CompileError> {
        self.compile_at_depth(spec, 0).await
    }

    fn resolve_tool(&self, node_id: &str, reference: &str) -> Result<ToolBinding, CompileError> {
        let registry = match self.tools.as_deref() {
            Some(registry) => Some(registry),
            None => ToolRegistry::global(),
        };
        let registry = registry
            .ok_or_else(|| CompileError::Tool {
                node_id: node_id.to_string(),
                source: ToolFailure::ToolUnavailable {
                    reference: reference.to_string(),
                    detail: "no tool registry installed".to_string(),
                },
            })?;
        registry.resolve(reference).map_err(|source| CompileError::Tool {
            node_id: node_id.to_string(),
            source,
        })
    }

    async fn compile_at_depth(
        &self,
        spec: &GraphSpec,
        depth: usize,
    ) -> Result<CompiledGraph, CompileError> {
        if depth > self.max_depth {
            return Err(CompileError::DepthExceeded {
                limit: self.max_depth,
            });
        }

        let schema = StateSchema::parse(&spec.state_schema)?;
        let topology = Topology::build(spec)?;

        topology.check_shapes()?;
        topology.check_reachability()?;
        topology.check_cycles()?;
        let regions = topology.pair_parallel_regions()?;
        let routers = topology.compile_routers()?;
        topology.check_parallel_routers(&routers, &regions, &schema)?;

        // Reference resolution and payload assembly.
        let mut nodes: FxHashMap<String, CompiledNode> = FxHashMap::default();
        let mut feeds_join: FxHashMap<String, String> = FxHashMap::default();

        for node_spec in &spec.nodes {
            let node_id = &node_spec.node_id;
            let catch = topology.catch_target(node_id);
            let payload = match node_spec.node_type {
                NodeType::Agent => self.compile_agent(node_spec, &topology).await?,
                NodeType::Router => NodePayload::Router(
                    routers
                        .get(node_id)
                        .map(|routes| CompiledRouter {
                            routes: routes.clone(),
                        })
                        .expect("router compiled in earlier pass"),
                ),
                NodeType::Parallel => {
                    let config = parse_config::<ParallelNodeConfig>(node_spec)?;
                    let region = &regions[node_id];
                    NodePayload::Parallel(CompiledParallel {
                        branches: region.branches.clone(),
                        fan_out_key: config.fan_out_key,
                        join: region.join.clone(),
                    })
                }
                NodeType::Join => self.compile_join(node_spec, &topology, &mut feeds_join)?,
                NodeType::Subgraph => self.compile_subgraph(node_spec, &topology, depth).await?,
            };
            nodes.insert(
                node_id.clone(),
                CompiledNode {
                    node_id: node_id.clone(),
                    node_type: node_spec.node_type,
                    catch,
                    payload,
                },
            );
        }

        Ok(CompiledGraph {
            workflow_id: spec.workflow_id.clone(),
            schema,
            entry: topology.entry.clone(),
            output_key: spec.output_key.clone(),
            nodes,
            feeds_join,
            regions,
        })
    }

    async fn compile_agent(
        &self,
        node_spec: &NodeSpec,
        topology: &Topology<'_>,
    ) -> Result<NodePayload, CompileError> {
        let node_id = &node_spec.node_id;
        let config = parse_config::<AgentNodeConfig>(node_spec)?;
        let definition = self.resolver.agent(&config.agent_id).await?;

        let mut bindings = Vec::with_capacity(definition.tools.len());
        for reference in &definition.tools {
            bindings.push(self.resolve_tool(node_id, reference)?);
        }

        let mapping = CompiledMapping::compile(config.input_mapping.iter()).map_err(|source| {
            CompileError::Mapping {
                node_id: node_id.clone(),
                source,
            }
        })?;

        Ok(NodePayload::Agent(CompiledAgent {
            definition: Arc::new(definition),
            bindings,
            mapping,
            output_key: config.output_key.unwrap_or_else(|| node_id.clone()),
            on_budget: config.on_budget,
            max_iterations: config.max_iterations,
            next: topology.single_successor(node_id),
        }))
    }

    fn compile_join(
        &self,
        node_spec: &NodeSpec,
        topology: &Topology<'_>,
        feeds_join: &mut FxHashMap<String, String>,
    ) -> Result<NodePayload, CompileError> {
        let node_id = &node_spec.node_id;
        let config = parse_config::<JoinNodeConfig>(node_spec)?;

        let mut declared: Vec<String> = config.wait_for.clone();
        declared.sort();
        let mut incoming: Vec<String> = topology.incoming_ids(node_id);
        incoming.sort();
        if declared != incoming {
            return Err(CompileError::WaitForMismatch {
                node_id: node_id.clone(),
                declared,
                incoming,
            });
        }

        let reducer = self
            .reducers
            .resolve(&config.aggregation_strategy)
            .ok_or_else(|| CompileError::UnknownStrategy {
                node_id: node_id.clone(),
                strategy: config.aggregation_strategy.clone(),
                available: self.reducers.names().iter().map(ToString::to_string).collect(),
            })?;

        for predecessor in &config.wait_for {
            feeds_join.insert(predecessor.clone(), node_id.clone());
        }

        Ok(NodePayload::Join(CompiledJoin {
            wait_for: config.wait_for,
            reducer,
            strategy: config.aggregation_strategy,
            output_key: config.output_key,
            failure_policy: config.failure_policy,
            next: topology.single_successor(node_id),
        }))
    }

    async fn compile_subgraph(
        &self,
        node_spec: &NodeSpec,
        topology: &Topology<'_>,
        depth: usize,
    ) -> Result<NodePayload, CompileError> {
        let node_id = &node_spec.node_id;
        let config = parse_config::<SubgraphNodeConfig>(node_spec)?;
        let child_spec = self.resolver.workflow(&config.workflow_id).await?;
        let child = Box::pin(self.compile_at_depth(&child_spec, depth + 1)).await?;

        let mapping = CompiledMapping::compile(config.input_mapping.iter()).map_err(|source| {
            CompileError::Mapping {
                node_id: node_id.clone(),
                source,
            }
        })?;

        Ok(NodePayload::Subgraph(CompiledSubgraph {
            graph: Arc::new(child),
            mapping,
            output_key: config.output_key.unwrap_or_else(|| node_id.clone()),
            next: topology.single_successor(node_id),
        }))
    }
}

fn parse_config<T: serde::de::DeserializeOwned>(node_spec: &NodeSpec) -> Result<T, CompileError> {
    let value = if node_spec.config.is_null() {
        serde_json::json!({})
    } else {
        node_spec.config.clone()
    };
    serde_json::from_value(value).map_err(|e| CompileError::NodeConfig {
        node_id: node_spec.node_id.clone(),
        detail: e.to_string(),
    })
}

/// Pre-resolution topology index over the raw spec.
struct Topology<'a> {
    spec: &'a GraphSpec,
    by_id: FxHashMap<&'a str, &'a NodeSpec>,
    /// Normal (non-catch) outgoing edges per source, in declaration order.
    outgoing: FxHashMap<NodeRef, Vec<&'a EdgeSpec>>,
    /// Catch edges per source node id.
    catches: FxHashMap<&'a str, Vec<&'a EdgeSpec>>,
    /// Normal incoming edges per target.
    incoming: FxHashMap<NodeRef, Vec<&'a EdgeSpec>>,
    entry: Vec<NodeRef>,
}

impl<'a> Topology<'a> {
    fn build(spec: &'a GraphSpec) -> Result<Self, CompileError> {
        let mut by_id: FxHashMap<&str, &NodeSpec> = FxHashMap::default();
        for node in &spec.nodes {
            if by_id.insert(node.node_id.as_str(), node).is_some() {
                return Err(CompileError::DuplicateNode {
                    node_id: node.node_id.clone(),
                });
            }
        }

        let known = |name: &str| -> bool {
            name == crate::types::START_SENTINEL
                || name == crate::types::END_SENTINEL
                || by_id.contains_key(name)
        };

        let mut outgoing: FxHashMap<NodeRef, Vec<&EdgeSpec>> = FxHashMap::default();
        let mut catches: FxHashMap<&str, Vec<&EdgeSpec>> = FxHashMap::default();
        let mut incoming: FxHashMap<NodeRef, Vec<&EdgeSpec>> = FxHashMap::default();

        for edge in &spec.edges {
            for endpoint in [&edge.source, &edge.target] {
                if !known(endpoint) {
                    return Err(CompileError::UnknownEndpoint {
                        source_node: edge.source.clone(),
                        target: edge.target.clone(),
                        unknown: endpoint.clone(),
                    });
                }
            }
            let source = NodeRef::decode(&edge.source);
            let target = NodeRef::decode(&edge.target);
            if source.is_end() {
                return Err(CompileError::InvalidEdge {
                    source_node: edge.source.clone(),
                    target: edge.target.clone(),
                    detail: "__end__ cannot be an edge source".to_string(),
                });
            }
            if target.is_start() {
                return Err(CompileError::InvalidEdge {
                    source_node: edge.source.clone(),
                    target: edge.target.clone(),
                    detail: "__start__ cannot be an edge target".to_string(),
                });
            }
            if edge.on_error {
                let NodeRef::Node(source_id) = &source else {
                    return Err(CompileError::InvalidEdge {
                        source_node: edge.source.clone(),
                        target: edge.target.clone(),
                        detail: "on_error is only valid on node-sourced edges".to_string(),
                    });
                };
                let source_id: &str = by_id
                    .get(source_id.as_str())
                    .map(|n| n.node_id.as_str())
                    .expect("endpoint checked above");
                catches.entry(source_id).or_default().push(edge);
                continue;
            }
            outgoing.entry(source).or_default().push(edge);
            incoming.entry(target).or_default().push(edge);
        }

        // Entry: explicit entry_point plus __start__ successors.
        let mut entry: Vec<NodeRef> = Vec::new();
        if let Some(entry_point) = &spec.entry_point {
            if !known(entry_point) {
                return Err(CompileError::UnknownEndpoint {
                    source_node: crate::types::START_SENTINEL.to_string(),
                    target: entry_point.clone(),
                    unknown: entry_point.clone(),
                });
            }
            entry.push(NodeRef::decode(entry_point));
        }
        if let Some(start_edges) = outgoing.get(&NodeRef::Start) {
            for edge in start_edges {
                if edge.condition.is_some() {
                    return Err(CompileError::InvalidEdge {
                        source_node: edge.source.clone(),
                        target: edge.target.clone(),
                        detail: "__start__ edges cannot carry conditions".to_string(),
                    });
                }
                let target = NodeRef::decode(&edge.target);
                if !entry.contains(&target) {
                    entry.push(target);
                }
            }
        }
        if entry.is_empty() {
            return Err(CompileError::MissingEntry);
        }

        Ok(Self {
            spec,
            by_id,
            outgoing,
            catches,
            incoming,
            entry,
        })
    }

    fn node_type(&self, node_id: &str) -> Option<NodeType> {
        self.by_id.get(node_id).map(|n| n.node_type)
    }

    fn normal_outgoing(&self, node_id: &str) -> &[&'a EdgeSpec] {
        self.outgoing
            .get(&NodeRef::node(node_id))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn incoming_ids(&self, node_id: &str) -> Vec<String> {
        self.incoming
            .get(&NodeRef::node(node_id))
            .map(|edges| {
                edges
                    .iter()
                    .filter(|e| e.source != crate::types::START_SENTINEL)
                    .map(|e| e.source.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn catch_target(&self, node_id: &str) -> Option<NodeRef> {
        self.catches
            .get(node_id)
            .and_then(|edges| edges.first())
            .map(|e| NodeRef::decode(&e.target))
    }

    /// The single non-error successor of a validated single-exit node.
    fn single_successor(&self, node_id: &str) -> NodeRef {
        self.normal_outgoing(node_id)
            .first()
            .map(|e| NodeRef::decode(&e.target))
            .unwrap_or(NodeRef::End)
    }

    fn check_shapes(&self) -> Result<(), CompileError> {
        for node in &self.spec.nodes {
            let node_id = &node.node_id;
            let out = self.normal_outgoing(node_id);
            let in_count = self.incoming_ids(node_id).len();

            // Conditions are router-owned.
            if node.node_type != NodeType::Router {
                if let Some(edge) = out.iter().find(|e| e.condition.is_some()) {
                    return Err(CompileError::InvalidEdge {
                        source_node: edge.source.clone(),
                        target: edge.target.clone(),
                        detail: format!(
                            "conditions are only valid on ROUTER edges, source is {}",
                            node.node_type
                        ),
                    });
                }
            }

            if let Some(catch_edges) = self.catches.get(node_id.as_str()) {
                if catch_edges.len() > 1 {
                    return Err(CompileError::NodeShape {
                        node_id: node_id.clone(),
                        detail: "at most one on_error edge is allowed".to_string(),
                    });
                }
            }

            match node.node_type {
                NodeType::Agent | NodeType::Subgraph => {
                    if out.len() != 1 {
                        return Err(CompileError::NodeShape {
                            node_id: node_id.clone(),
                            detail: format!(
                                "{} nodes need exactly one outgoing edge, found {}",
                                node.node_type,
                                out.len()
                            ),
                        });
                    }
                }
                NodeType::Router => {
                    if out.is_empty() {
                        return Err(CompileError::NodeShape {
                            node_id: node_id.clone(),
                            detail: "routers need at least one outgoing edge".to_string(),
                        });
                    }
                }
                NodeType::Parallel => {
                    if out.len() < 2 {
                        return Err(CompileError::NodeShape {
                            node_id: node_id.clone(),
                            detail: format!(
                                "parallel nodes need at least two outgoing edges, found {}",
                                out.len()
                            ),
                        });
                    }
                }
                NodeType::Join => {
                    if in_count < 2 {
                        return Err(CompileError::NodeShape {
                            node_id: node_id.clone(),
                            detail: format!(
                                "joins need at least two incoming edges, found {in_count}"
                            ),
                        });
                    }
                    if out.len() != 1 {
                        return Err(CompileError::NodeShape {
                            node_id: node_id.clone(),
                            detail: format!(
                                "joins need exactly one outgoing edge, found {}",
                                out.len()
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Petgraph view over every node and edge (catch edges included).
    fn petgraph(&self, include_router_edges: bool) -> (DiGraph<NodeRef, ()>, FxHashMap<NodeRef, NodeIndex>) {
        let mut graph = DiGraph::new();
        let mut index: FxHashMap<NodeRef, NodeIndex> = FxHashMap::default();
        let mut index_of = |graph: &mut DiGraph<NodeRef, ()>, node: NodeRef| -> NodeIndex {
            if let Some(ix) = index.get(&node) {
                return *ix;
            }
            let ix = graph.add_node(node.clone());
            index.insert(node, ix);
            ix
        };

        index_of(&mut graph, NodeRef::Start);
        index_of(&mut graph, NodeRef::End);
        for node in &self.spec.nodes {
            index_of(&mut graph, NodeRef::node(&node.node_id));
        }

        // Entry wiring (covers entry_point without an explicit start edge).
        for target in &self.entry {
            let s = index_of(&mut graph, NodeRef::Start);
            let t = index_of(&mut graph, target.clone());
            graph.update_edge(s, t, ());
        }

        for edge in &self.spec.edges {
            let source = NodeRef::decode(&edge.source);
            if !include_router_edges {
                if edge.on_error {
                    continue;
                }
                if let NodeRef::Node(id) = &source {
                    if self.node_type(id) == Some(NodeType::Router) {
                        continue;
                    }
                }
            }
            let s = index_of(&mut graph, source);
            let t = index_of(&mut graph, NodeRef::decode(&edge.target));
            graph.update_edge(s, t, ());
        }

        (graph, index)
    }

    fn check_reachability(&self) -> Result<(), CompileError> {
        let (graph, index) = self.petgraph(true);
        let start = index[&NodeRef::Start];

        if !has_path_connecting(&graph, start, index[&NodeRef::End], None) {
            return Err(CompileError::EndUnreachable);
        }

        for node in &self.spec.nodes {
            let ix = index[&NodeRef::node(&node.node_id)];
            if !has_path_connecting(&graph, start, ix, None) {
                warn!(node_id = %node.node_id, "node is unreachable from __start__");
            }
        }
        Ok(())
    }

    fn check_cycles(&self) -> Result<(), CompileError> {
        // Only unconditional edges participate: router-sourced and catch
        // edges can break a loop at runtime.
        let (graph, _) = self.petgraph(false);
        for scc in tarjan_scc(&graph) {
            let cyclic = scc.len() > 1
                || (scc.len() == 1 && graph.find_edge(scc[0], scc[0]).is_some());
            if cyclic {
                let mut nodes: Vec<String> = scc
                    .iter()
                    .map(|ix| graph[*ix].encode())
                    .collect();
                nodes.sort();
                return Err(CompileError::UnconditionalCycle { nodes });
            }
        }
        Ok(())
    }

    /// Finds each parallel region's unique post-dominator join.
    fn pair_parallel_regions(&self) -> Result<FxHashMap<String, ParallelRegion>, CompileError> {
        let mut regions = FxHashMap::default();
        for node in &self.spec.nodes {
            if node.node_type != NodeType::Parallel {
                continue;
            }
            let branches: Vec<NodeRef> = self
                .normal_outgoing(&node.node_id)
                .iter()
                .map(|e| NodeRef::decode(&e.target))
                .collect();

            let mut joins: FxHashSet<String> = FxHashSet::default();
            let mut any_end = false;
            for branch in &branches {
                match self.first_join_from(branch) {
                    Some(join) => {
                        joins.insert(join);
                    }
                    None => any_end = true,
                }
            }

            if joins.len() > 1 {
                let mut joins: Vec<String> = joins.into_iter().collect();
                joins.sort();
                return Err(CompileError::AmbiguousJoin {
                    parallel_id: node.node_id.clone(),
                    joins,
                });
            }
            let join = joins.into_iter().next();
            if join.is_some() && any_end {
                // A branch that exits to __end__ without the join is legal;
                // it is simply excluded from the join's wait_for set.
                warn!(
                    parallel_id = %node.node_id,
                    "parallel branch exits to __end__ without passing the join"
                );
            }

            // Dynamic fan-out requires branches that feed the join directly,
            // so dispatch multiplicity stays statically known.
            let config = parse_config::<ParallelNodeConfig>(node)?;
            if config.fan_out_key.is_some() {
                if let Some(join_id) = &join {
                    for branch in &branches {
                        let feeds_directly = branch.id().is_some_and(|id| {
                            self.normal_outgoing(id)
                                .iter()
                                .any(|e| e.target == *join_id)
                        });
                        if !feeds_directly {
                            return Err(CompileError::FanOutBranchShape {
                                parallel_id: node.node_id.clone(),
                                branch: branch.encode(),
                            });
                        }
                    }
                }
            }

            regions.insert(
                node.node_id.clone(),
                ParallelRegion {
                    parallel_id: node.node_id.clone(),
                    branches,
                    join,
                },
            );
        }
        Ok(regions)
    }

    /// BFS along normal edges from `start` until the first JOIN node.
    fn first_join_from(&self, start: &NodeRef) -> Option<String> {
        let mut queue: VecDeque<NodeRef> = VecDeque::new();
        let mut seen: FxHashSet<NodeRef> = FxHashSet::default();
        queue.push_back(start.clone());
        while let Some(node) = queue.pop_front() {
            if !seen.insert(node.clone()) {
                continue;
            }
            let NodeRef::Node(id) = &node else { continue };
            if self.node_type(id) == Some(NodeType::Join) {
                return Some(id.clone());
            }
            for edge in self.normal_outgoing(id) {
                queue.push_back(NodeRef::decode(&edge.target));
            }
        }
        None
    }

    /// Compiles each router's ordered route table, synthesizing the default.
    fn compile_routers(&self) -> Result<FxHashMap<String, Vec<CompiledRoute>>, CompileError> {
        let mut routers = FxHashMap::default();
        for node in &self.spec.nodes {
            if node.node_type != NodeType::Router {
                continue;
            }
            let node_id = &node.node_id;
            let mut routes: Vec<CompiledRoute> = Vec::new();
            let mut default: Option<NodeRef> = None;

            for edge in self.normal_outgoing(node_id) {
                let target = NodeRef::decode(&edge.target);
                match &edge.condition {
                    Some(condition) => {
                        let predicate =
                            Predicate::parse(condition).map_err(|source| CompileError::Condition {
                                source_node: node_id.clone(),
                                source,
                            })?;
                        if predicate.is_default() {
                            if default.replace(target).is_some() {
                                return Err(CompileError::NodeShape {
                                    node_id: node_id.clone(),
                                    detail: "router has multiple default edges".to_string(),
                                });
                            }
                        } else {
                            routes.push(CompiledRoute { predicate, target });
                        }
                    }
                    None => {
                        if default.replace(target).is_some() {
                            return Err(CompileError::NodeShape {
                                node_id: node_id.clone(),
                                detail: "router has multiple unconditional edges".to_string(),
                            });
                        }
                    }
                }
            }

            // Synthesize the fallback when the description omitted it.
            let default = default.unwrap_or(NodeRef::End);
            routes.push(CompiledRoute {
                predicate: Predicate::default_route(),
                target: default,
            });
            routers.insert(node_id.clone(), routes);
        }
        Ok(routers)
    }

    /// Routers executing inside a parallel region may only read
    /// schema-declared properties, so their conditions cannot depend on
    /// sibling branches that have not joined yet.
    fn check_parallel_routers(
        &self,
        routers: &FxHashMap<String, Vec<CompiledRoute>>,
        regions: &FxHashMap<String, ParallelRegion>,
        schema: &StateSchema,
    ) -> Result<(), CompileError> {
        for region in regions.values() {
            let members = self.region_members(region);
            for member in members {
                let Some(routes) = routers.get(&member) else {
                    continue;
                };
                for route in routes {
                    for property in route.predicate.references() {
                        if !schema.declares(&property) && property != THREAD_ID_PROPERTY {
                            return Err(CompileError::RouterReadsUndeclared {
                                node_id: member.clone(),
                                property,
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Node ids between a parallel's branches and its join (exclusive).
    fn region_members(&self, region: &ParallelRegion) -> Vec<String> {
        let mut members = Vec::new();
        let mut queue: VecDeque<NodeRef> = region.branches.iter().cloned().collect();
        let mut seen: FxHashSet<NodeRef> = FxHashSet::default();
        while let Some(node) = queue.pop_front() {
            if !seen.insert(node.clone()) {
                continue;
            }
            let NodeRef::Node(id) = &node else { continue };
            if Some(id.as_str()) == region.join.as_deref() {
                continue;
            }
            members.push(id.clone());
            for edge in self.normal_outgoing(id) {
                queue.push_back(NodeRef::decode(&edge.target));
            }
        }
        members
    }
}

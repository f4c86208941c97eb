//! Declarative graph description value objects.
//!
//! These types are the compiler's input: plain serde data with no resolved
//! references. Node configs are carried as raw JSON in [`NodeSpec::config`]
//! and parsed into the typed `*NodeConfig` structs during compilation, so a
//! graph description can round-trip through storage untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::NodeType;

/// A declarative workflow graph: the unit a workflow version stores.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GraphSpec {
    /// Workflow identifier (informational; used in errors and events).
    #[serde(default)]
    pub workflow_id: String,
    /// Node declarations. Ids must be unique.
    pub nodes: Vec<NodeSpec>,
    /// Ordered edges. Order is significant for router condition evaluation.
    pub edges: Vec<EdgeSpec>,
    /// Entry node id. `__start__` edges may also declare entry successors.
    #[serde(default)]
    pub entry_point: Option<String>,
    /// JSON-Schema-shaped state declaration with per-property merge rules.
    #[serde(default)]
    pub state_schema: Value,
    /// State property projected as the execution output. When unset the
    /// whole final state object is returned.
    #[serde(default)]
    pub output_key: Option<String>,
}

/// One node declaration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSpec {
    pub node_id: String,
    pub node_type: NodeType,
    /// Kind-specific configuration, parsed during compilation.
    #[serde(default)]
    pub config: Value,
}

/// One edge declaration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeSpec {
    /// Source node id, or `__start__`.
    pub source: String,
    /// Target node id, or `__end__`.
    pub target: String,
    /// Router condition in the sandboxed predicate language. Only legal on
    /// edges whose source is a ROUTER node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Marks this edge as the source node's error catch route.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub on_error: bool,
}

impl EdgeSpec {
    /// Plain edge between two nodes.
    #[must_use]
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            condition: None,
            on_error: false,
        }
    }

    /// Edge guarded by a router condition.
    #[must_use]
    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Marks the edge as an error catch route.
    #[must_use]
    pub fn catch(mut self) -> Self {
        self.on_error = true;
        self
    }
}

/// AGENT node configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentNodeConfig {
    /// Agent definition to resolve and bind.
    pub agent_id: String,
    /// Prompt argument name → `$.`-rooted selector over state.
    #[serde(default)]
    pub input_mapping: std::collections::BTreeMap<String, String>,
    /// State property receiving the loop's final output. Defaults to the
    /// node id.
    #[serde(default)]
    pub output_key: Option<String>,
    /// Behaviour when the tool loop exhausts its iteration budget.
    #[serde(default)]
    pub on_budget: OnBudget,
    /// Per-node override of the loop iteration cap.
    #[serde(default)]
    pub max_iterations: Option<usize>,
}

/// Budget-exhaustion policy for an AGENT node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnBudget {
    /// Surface `ToolLoopBudgetExhausted` as a node error.
    #[default]
    Fail,
    /// Store the last assistant text as the node output and continue.
    ReturnPartial,
}

/// PARALLEL node configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ParallelNodeConfig {
    /// Optional state property holding an array; when set, each outgoing
    /// branch is dispatched once per element with `parallel_item` /
    /// `parallel_index` layered onto the branch's state view.
    #[serde(default)]
    pub fan_out_key: Option<String>,
}

/// JOIN node configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinNodeConfig {
    /// Predecessor node ids the join waits for. Must match the join's
    /// incoming edges.
    pub wait_for: Vec<String>,
    /// Aggregation strategy name, resolved against the join reducer registry
    /// at compile time.
    #[serde(default = "JoinNodeConfig::default_strategy")]
    pub aggregation_strategy: String,
    /// State property receiving the aggregated value.
    #[serde(default = "JoinNodeConfig::default_output_key")]
    pub output_key: String,
    /// Policy consulted when predecessors failed.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl JoinNodeConfig {
    fn default_strategy() -> String {
        "merge_object".to_string()
    }

    fn default_output_key() -> String {
        "parallel_results".to_string()
    }
}

/// How a JOIN reacts to failed predecessors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Fail as soon as any predecessor failed.
    #[default]
    Any,
    /// Fail when more than half of the predecessors failed.
    Majority,
    /// Fail only when every predecessor failed.
    AllRequired,
}

/// SUBGRAPH node configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubgraphNodeConfig {
    /// Workflow to compile and run as the child graph.
    pub workflow_id: String,
    /// Parent-state projection handed to the child as its initial state.
    #[serde(default)]
    pub input_mapping: std::collections::BTreeMap<String, String>,
    /// Parent property receiving the child's final state. Defaults to the
    /// node id.
    #[serde(default)]
    pub output_key: Option<String>,
}

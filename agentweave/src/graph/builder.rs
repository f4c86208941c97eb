//! Fluent construction of [`GraphSpec`] values.
//!
//! Workflow storage normally supplies graph descriptions as data; the
//! builder exists for tests, demos, and programmatic workflow assembly.
//!
//! ```rust
//! use agentweave::graph::GraphBuilder;
//! use serde_json::json;
//!
//! let spec = GraphBuilder::new("triage")
//!     .state_schema(json!({"properties": {"items": {"type": "array"}}}))
//!     .agent_node("classify", "agent-classifier", "category")
//!     .router_node("route")
//!     .edge("__start__", "classify")
//!     .edge("classify", "route")
//!     .conditional_edge("route", "classify", "state.get(\"retry\", false)")
//!     .edge("route", "__end__")
//!     .build();
//!
//! assert_eq!(spec.nodes.len(), 2);
//! ```

use serde_json::{json, Value};

use crate::graph::spec::{EdgeSpec, GraphSpec, JoinNodeConfig, NodeSpec};
use crate::types::NodeType;

/// Builder for declarative graph descriptions.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    spec: GraphSpec,
}

impl GraphBuilder {
    #[must_use]
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            spec: GraphSpec {
                workflow_id: workflow_id.into(),
                ..GraphSpec::default()
            },
        }
    }

    /// Sets the state schema (JSON-Schema-shaped, with merge annotations).
    #[must_use]
    pub fn state_schema(mut self, schema: Value) -> Self {
        self.spec.state_schema = schema;
        self
    }

    /// Sets the property projected as the execution output.
    #[must_use]
    pub fn output_key(mut self, key: impl Into<String>) -> Self {
        self.spec.output_key = Some(key.into());
        self
    }

    /// Sets the entry node.
    #[must_use]
    pub fn entry(mut self, node_id: impl Into<String>) -> Self {
        self.spec.entry_point = Some(node_id.into());
        self
    }

    /// Adds a node with an explicit config payload.
    #[must_use]
    pub fn node(mut self, node_id: impl Into<String>, node_type: NodeType, config: Value) -> Self {
        self.spec.nodes.push(NodeSpec {
            node_id: node_id.into(),
            node_type,
            config,
        });
        self
    }

    /// Adds an AGENT node with the common config shape.
    #[must_use]
    pub fn agent_node(
        self,
        node_id: impl Into<String>,
        agent_id: impl Into<String>,
        output_key: impl Into<String>,
    ) -> Self {
        let config = json!({
            "agent_id": agent_id.into(),
            "output_key": output_key.into(),
        });
        self.node(node_id, NodeType::Agent, config)
    }

    /// Adds a ROUTER node (conditions live on its outgoing edges).
    #[must_use]
    pub fn router_node(self, node_id: impl Into<String>) -> Self {
        self.node(node_id, NodeType::Router, Value::Null)
    }

    /// Adds a PARALLEL node.
    #[must_use]
    pub fn parallel_node(self, node_id: impl Into<String>) -> Self {
        self.node(node_id, NodeType::Parallel, Value::Null)
    }

    /// Adds a JOIN node.
    #[must_use]
    pub fn join_node(self, node_id: impl Into<String>, config: JoinNodeConfig) -> Self {
        let config = serde_json::to_value(config).unwrap_or(Value::Null);
        self.node(node_id, NodeType::Join, config)
    }

    /// Adds a SUBGRAPH node.
    #[must_use]
    pub fn subgraph_node(
        self,
        node_id: impl Into<String>,
        workflow_id: impl Into<String>,
        output_key: impl Into<String>,
    ) -> Self {
        let config = json!({
            "workflow_id": workflow_id.into(),
            "output_key": output_key.into(),
        });
        self.node(node_id, NodeType::Subgraph, config)
    }

    /// Adds an unconditional edge.
    #[must_use]
    pub fn edge(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.spec.edges.push(EdgeSpec::new(source, target));
        self
    }

    /// Adds a router edge guarded by a condition.
    #[must_use]
    pub fn conditional_edge(
        mut self,
        source: impl Into<String>,
        target: impl Into<String>,
        condition: impl Into<String>,
    ) -> Self {
        self.spec.edges.push(EdgeSpec::new(source, target).when(condition));
        self
    }

    /// Adds an error catch edge.
    #[must_use]
    pub fn catch_edge(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.spec.edges.push(EdgeSpec::new(source, target).catch());
        self
    }

    /// Finishes the description.
    #[must_use]
    pub fn build(self) -> GraphSpec {
        self.spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_assembles_spec() {
        let spec = GraphBuilder::new("wf")
            .agent_node("a", "agent-1", "x")
            .router_node("r")
            .edge("__start__", "a")
            .edge("a", "r")
            .conditional_edge("r", "a", "state.get('again', false)")
            .edge("r", "__end__")
            .catch_edge("a", "r")
            .build();

        assert_eq!(spec.workflow_id, "wf");
        assert_eq!(spec.nodes.len(), 2);
        assert_eq!(spec.edges.len(), 5);
        assert!(spec.edges[4].on_error);
    }
}

//! Core identifier types for the agentweave engine.
//!
//! This module defines the fundamental vocabulary used throughout the system:
//! node references (including the `__start__`/`__end__` sentinels), the closed
//! set of executable node kinds, and execution lifecycle statuses.
//!
//! # Key Types
//!
//! - [`NodeRef`]: A reference to a node in a workflow graph, including the
//!   virtual start/end sentinels.
//! - [`NodeType`]: The closed set of executable node kinds.
//! - [`ExecutionStatus`]: Lifecycle status of a workflow execution.
//!
//! # Examples
//!
//! ```rust
//! use agentweave::types::{NodeRef, NodeType};
//!
//! let start = NodeRef::Start;
//! let planner = NodeRef::node("planner");
//!
//! // Sentinels round-trip through the wire encoding used in graph specs.
//! assert_eq!(start.encode(), "__start__");
//! assert_eq!(NodeRef::decode("__end__"), NodeRef::End);
//! assert_eq!(NodeRef::decode("planner"), planner);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire form of the start sentinel in graph descriptions.
pub const START_SENTINEL: &str = "__start__";
/// Wire form of the end sentinel in graph descriptions.
pub const END_SENTINEL: &str = "__end__";

/// Reserved state property maintained by the runtime: monotonic super-step.
pub const STEP_PROPERTY: &str = "__step__";
/// Reserved state property carrying the thread identifier.
pub const THREAD_ID_PROPERTY: &str = "thread_id";

/// A reference to a node within a workflow graph.
///
/// `NodeRef` identifies edge endpoints and frontier entries. The virtual
/// [`Start`](Self::Start) and [`End`](Self::End) sentinels mark entry and exit;
/// they are never executed and never appear in the node registry.
///
/// # Persistence
///
/// `NodeRef` serializes for checkpointing both through serde and through the
/// [`encode`](Self::encode)/[`decode`](Self::decode) string form, which matches
/// the `__start__`/`__end__` sentinels used in declarative graph descriptions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRef {
    /// Entry sentinel. Has no executor; the initial frontier is its successors.
    Start,
    /// Exit sentinel. Reaching it (or an empty frontier) completes execution.
    End,
    /// A regular node identified by its unique `node_id`.
    Node(String),
}

impl NodeRef {
    /// Convenience constructor for a regular node reference.
    #[must_use]
    pub fn node(id: impl Into<String>) -> Self {
        NodeRef::Node(id.into())
    }

    /// Encode into the persisted/wire string form.
    ///
    /// ```rust
    /// # use agentweave::types::NodeRef;
    /// assert_eq!(NodeRef::Start.encode(), "__start__");
    /// assert_eq!(NodeRef::node("router").encode(), "router");
    /// ```
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            NodeRef::Start => START_SENTINEL.to_string(),
            NodeRef::End => END_SENTINEL.to_string(),
            NodeRef::Node(id) => id.clone(),
        }
    }

    /// Decode a persisted/wire string back into a `NodeRef`.
    pub fn decode(s: &str) -> Self {
        match s {
            START_SENTINEL => NodeRef::Start,
            END_SENTINEL => NodeRef::End,
            other => NodeRef::Node(other.to_string()),
        }
    }

    /// Returns `true` if this is the start sentinel.
    #[must_use]
    pub fn is_start(&self) -> bool {
        matches!(self, Self::Start)
    }

    /// Returns `true` if this is the end sentinel.
    #[must_use]
    pub fn is_end(&self) -> bool {
        matches!(self, Self::End)
    }

    /// Returns the node id for regular nodes, `None` for sentinels.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        match self {
            NodeRef::Node(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl From<&str> for NodeRef {
    fn from(s: &str) -> Self {
        NodeRef::decode(s)
    }
}

/// The closed set of executable node kinds.
///
/// Extensions come through new tool implementations, never through new node
/// kinds; the scheduler dispatches on this enum exhaustively.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    /// Drives an LLM agent through the bounded tool loop.
    Agent,
    /// Evaluates edge conditions and selects exactly one outgoing edge.
    Router,
    /// Fans out one frontier entry per outgoing edge.
    Parallel,
    /// Waits for declared predecessors and aggregates their deltas.
    Join,
    /// Runs a nested compiled graph over a projected state subset.
    Subgraph,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent => write!(f, "AGENT"),
            Self::Router => write!(f, "ROUTER"),
            Self::Parallel => write!(f, "PARALLEL"),
            Self::Join => write!(f, "JOIN"),
            Self::Subgraph => write!(f, "SUBGRAPH"),
        }
    }
}

/// Lifecycle status of a workflow execution.
///
/// An execution reaches exactly one terminal status; `AwaitingInput` is a
/// resumable pause, distinguished from failure so callers can continue the
/// thread with new input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    AwaitingInput,
}

impl ExecutionStatus {
    /// Returns `true` for statuses that permit no further transition.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::AwaitingInput => "AWAITING_INPUT",
        };
        f.write_str(s)
    }
}

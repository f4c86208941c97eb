//! Frontier entries: the unit of scheduling.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::NodeRef;

/// One entry in the frontier: a node eligible to execute in the next
/// super-step, plus the state overlay a dynamic parallel fan-out gave it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrontierEntry {
    pub node: NodeRef,
    /// Branch-local view layered over the shared snapshot
    /// (`parallel_item` / `parallel_index` for dynamic fan-out).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay: Option<FxHashMap<String, Value>>,
}

impl FrontierEntry {
    /// Entry without an overlay.
    #[must_use]
    pub fn plain(node: NodeRef) -> Self {
        Self {
            node,
            overlay: None,
        }
    }

    /// Entry with a branch-local overlay.
    #[must_use]
    pub fn with_overlay(node: NodeRef, overlay: FxHashMap<String, Value>) -> Self {
        Self {
            node,
            overlay: Some(overlay),
        }
    }

    /// Node id for regular nodes.
    #[must_use]
    pub fn node_id(&self) -> Option<&str> {
        self.node.id()
    }
}

impl From<NodeRef> for FrontierEntry {
    fn from(node: NodeRef) -> Self {
        Self::plain(node)
    }
}

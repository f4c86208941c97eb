//! The join ledger: which predecessors have reported, and the deltas
//! awaiting aggregation.
//!
//! Part of the checkpoint triple — a resumed execution must remember which
//! branches already completed so joins neither fire early nor deadlock.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::reducers::BranchOutput;
use crate::state::StateDelta;

/// Per-join bookkeeping.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinEntry {
    /// Dispatch multiplicity per predecessor; absent means 1. Dynamic
    /// fan-out raises this to the item count.
    #[serde(default)]
    pub expected: FxHashMap<String, usize>,
    /// Completions recorded per predecessor.
    #[serde(default)]
    pub completed: FxHashMap<String, usize>,
    /// Predecessors that failed (any dispatched copy).
    #[serde(default)]
    pub failed: FxHashSet<String>,
    /// Recorded branch deltas, in completion order.
    #[serde(default)]
    pub branches: Vec<BranchOutput>,
}

impl JoinEntry {
    fn expected_for(&self, node_id: &str) -> usize {
        self.expected.get(node_id).copied().unwrap_or(1)
    }

    fn settled(&self, node_id: &str) -> bool {
        self.failed.contains(node_id)
            || self.completed.get(node_id).copied().unwrap_or(0) >= self.expected_for(node_id)
    }
}

/// Ledger over every join in a running execution.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinLedger {
    entries: FxHashMap<String, JoinEntry>,
}

impl JoinLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares dispatch multiplicity for a predecessor (dynamic fan-out).
    pub fn expect(&mut self, join_id: &str, node_id: &str, count: usize) {
        self.entries
            .entry(join_id.to_string())
            .or_default()
            .expected
            .insert(node_id.to_string(), count.max(1));
    }

    /// Records a completed predecessor delta.
    pub fn record_completion(&mut self, join_id: &str, node_id: &str, delta: StateDelta) {
        let entry = self.entries.entry(join_id.to_string()).or_default();
        *entry.completed.entry(node_id.to_string()).or_insert(0) += 1;
        entry.branches.push(BranchOutput {
            node_id: node_id.to_string(),
            delta,
        });
    }

    /// Records a failed predecessor.
    pub fn record_failure(&mut self, join_id: &str, node_id: &str) {
        self.entries
            .entry(join_id.to_string())
            .or_default()
            .failed
            .insert(node_id.to_string());
    }

    /// `true` once every declared predecessor has completed (at its expected
    /// multiplicity) or failed.
    #[must_use]
    pub fn is_ready(&self, join_id: &str, wait_for: &[String]) -> bool {
        let Some(entry) = self.entries.get(join_id) else {
            return wait_for.is_empty();
        };
        wait_for.iter().all(|node_id| entry.settled(node_id))
    }

    /// Removes and returns the join's bookkeeping for firing. Branches come
    /// back sorted by node id for deterministic aggregation.
    pub fn take(&mut self, join_id: &str) -> JoinEntry {
        let mut entry = self.entries.remove(join_id).unwrap_or_default();
        entry.branches.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        entry
    }

    /// Read access for inspection.
    #[must_use]
    pub fn entry(&self, join_id: &str) -> Option<&JoinEntry> {
        self.entries.get(join_id)
    }
}

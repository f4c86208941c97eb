//! Join aggregation strategies.
//!
//! When a JOIN node fires, the deltas recorded from its parallel branches are
//! aggregated into a single value stored under the join's `output_key`.
//! Built-in strategies cover object merging, list collection, string
//! concatenation, and first-non-empty selection; workflows may register their
//! own named reducers, resolved at compile time.

use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;

use crate::state::StateDelta;

/// A branch's contribution awaiting aggregation in the join ledger.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BranchOutput {
    /// Node id of the branch that produced the delta.
    pub node_id: String,
    /// The delta the branch returned.
    pub delta: StateDelta,
}

/// Aggregates the recorded branch outputs of a join into one value.
///
/// Implementations must be pure: same branches in, same value out. Branches
/// arrive sorted lexicographically by node id.
pub trait JoinReducer: Send + Sync {
    fn aggregate(&self, branches: &[BranchOutput]) -> Value;
}

/// Shallow key-wise merge of every branch's delta object.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeObjectJoin;

impl JoinReducer for MergeObjectJoin {
    fn aggregate(&self, branches: &[BranchOutput]) -> Value {
        let mut out = serde_json::Map::new();
        for branch in branches {
            let mut entries: Vec<_> = branch.delta.props.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            for (k, v) in entries {
                out.insert(k.clone(), v.clone());
            }
        }
        Value::Object(out)
    }
}

/// Concatenates branch values per property into arrays.
///
/// Array values extend the accumulator; scalars are pushed.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppendListJoin;

impl JoinReducer for AppendListJoin {
    fn aggregate(&self, branches: &[BranchOutput]) -> Value {
        let mut out: serde_json::Map<String, Value> = serde_json::Map::new();
        for branch in branches {
            let mut entries: Vec<_> = branch.delta.props.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            for (k, v) in entries {
                let slot = out.entry(k.clone()).or_insert_with(|| Value::Array(vec![]));
                if let Value::Array(acc) = slot {
                    match v {
                        Value::Array(items) => acc.extend(items.iter().cloned()),
                        scalar => acc.push(scalar.clone()),
                    }
                }
            }
        }
        Value::Object(out)
    }
}

/// Newline-joined string rendering of every branch value.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConcatJoin;

impl JoinReducer for ConcatJoin {
    fn aggregate(&self, branches: &[BranchOutput]) -> Value {
        let mut parts: Vec<String> = Vec::new();
        for branch in branches {
            let mut entries: Vec<_> = branch.delta.props.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            for (_, v) in entries {
                match v {
                    Value::Null => {}
                    Value::String(s) => parts.push(s.clone()),
                    other => parts.push(other.to_string()),
                }
            }
        }
        Value::String(parts.join("\n"))
    }
}

/// First non-empty branch delta, rendered as an object.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstJoin;

impl JoinReducer for FirstJoin {
    fn aggregate(&self, branches: &[BranchOutput]) -> Value {
        for branch in branches {
            if !branch.delta.is_empty() {
                let mut out = serde_json::Map::new();
                let mut entries: Vec<_> = branch.delta.props.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                for (k, v) in entries {
                    out.insert(k.clone(), v.clone());
                }
                return Value::Object(out);
            }
        }
        Value::Null
    }
}

/// Registry of named join reducers.
///
/// The built-in strategies are pre-registered; user reducers added before
/// compilation are resolved by name in JOIN node configs.
#[derive(Clone)]
pub struct JoinReducerRegistry {
    reducers: FxHashMap<String, Arc<dyn JoinReducer>>,
}

impl Default for JoinReducerRegistry {
    fn default() -> Self {
        let mut registry = Self {
            reducers: FxHashMap::default(),
        };
        registry.register("merge_object", Arc::new(MergeObjectJoin));
        registry.register("append_list", Arc::new(AppendListJoin));
        registry.register("concat", Arc::new(ConcatJoin));
        registry.register("first", Arc::new(FirstJoin));
        registry
    }
}

impl JoinReducerRegistry {
    /// Registers a reducer under a strategy name.
    pub fn register(&mut self, name: impl Into<String>, reducer: Arc<dyn JoinReducer>) -> &mut Self {
        self.reducers.insert(name.into(), reducer);
        self
    }

    /// Builder-style registration.
    #[must_use]
    pub fn with_reducer(mut self, name: impl Into<String>, reducer: Arc<dyn JoinReducer>) -> Self {
        self.register(name, reducer);
        self
    }

    /// Resolves a strategy name.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn JoinReducer>> {
        self.reducers.get(name).cloned()
    }

    /// Registered strategy names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.reducers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

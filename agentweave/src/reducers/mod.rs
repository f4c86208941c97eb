//! State reduction: per-property merge rules and the super-step barrier.
//!
//! Concurrent nodes return [`StateDelta`](crate::state::StateDelta)s; at the
//! barrier the scheduler merges them into the live state in deterministic
//! order (lexicographic by node id) under each property's declared
//! [`MergeRule`](crate::schema::MergeRule). Join aggregation strategies live
//! in [`join`].

mod join;

pub use join::{
    AppendListJoin, BranchOutput, ConcatJoin, FirstJoin, JoinReducer, JoinReducerRegistry,
    MergeObjectJoin,
};

use serde_json::Value;

use crate::schema::{MergeRule, StateSchema};
use crate::state::{StateDelta, WorkflowState};

/// Merges one incoming value into an existing slot under a rule.
///
/// Pure function of its inputs; the barrier applies it property by property.
#[must_use]
pub fn merge_value(rule: MergeRule, existing: Option<&Value>, incoming: Value) -> Value {
    match rule {
        MergeRule::Replace => incoming,
        MergeRule::AppendList => append_list(existing, incoming),
        MergeRule::MergeObject => merge_object(existing, incoming),
        MergeRule::MergeMap => merge_map(existing, incoming),
    }
}

fn append_list(existing: Option<&Value>, incoming: Value) -> Value {
    match (existing, incoming) {
        (Some(Value::Array(old)), Value::Array(new)) => {
            let mut out = old.clone();
            out.extend(new);
            Value::Array(out)
        }
        (Some(Value::Array(old)), scalar) => {
            let mut out = old.clone();
            out.push(scalar);
            Value::Array(out)
        }
        (_, incoming) => incoming,
    }
}

/// Shallow key-wise merge; nested objects under the same key merge one more
/// level, with the incoming side winning leaf conflicts.
fn merge_object(existing: Option<&Value>, incoming: Value) -> Value {
    match (existing, incoming) {
        (Some(Value::Object(old)), Value::Object(new)) => {
            let mut out = old.clone();
            for (k, v) in new {
                match (out.get(&k), &v) {
                    (Some(Value::Object(old_inner)), Value::Object(new_inner)) => {
                        let mut inner = old_inner.clone();
                        for (ik, iv) in new_inner {
                            inner.insert(ik.clone(), iv.clone());
                        }
                        out.insert(k, Value::Object(inner));
                    }
                    _ => {
                        out.insert(k, v);
                    }
                }
            }
            Value::Object(out)
        }
        (_, incoming) => incoming,
    }
}

/// Per-key replace across maps: the incoming value for a key always replaces
/// the existing one wholesale.
fn merge_map(existing: Option<&Value>, incoming: Value) -> Value {
    match (existing, incoming) {
        (Some(Value::Object(old)), Value::Object(new)) => {
            let mut out = old.clone();
            for (k, v) in new {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        (_, incoming) => incoming,
    }
}

/// Applies a super-step's deltas to the live state.
///
/// Deltas are sorted lexicographically by originating node id before
/// application, so the merged result is independent of task completion order.
/// Returns the names of the properties that changed.
pub fn apply_barrier(
    state: &mut WorkflowState,
    schema: &StateSchema,
    deltas: Vec<(String, StateDelta)>,
) -> Vec<String> {
    let mut deltas = deltas;
    deltas.sort_by(|a, b| a.0.cmp(&b.0));

    let mut updated: Vec<String> = Vec::new();
    for (_, delta) in deltas {
        // Property order within one delta must be stable too.
        let mut entries: Vec<(String, Value)> = delta.props.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, incoming) in entries {
            let rule = schema.rule_for(&key);
            let merged = merge_value(rule, state.get(&key), incoming);
            let changed = state.get(&key) != Some(&merged);
            state.props_mut().insert(key.clone(), merged);
            if changed && !updated.contains(&key) {
                updated.push(key);
            }
        }
    }
    updated
}

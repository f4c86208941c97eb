//! Workflow state: an opaque property map merged under schema-declared rules.
//!
//! The engine treats state as a mapping from property name to JSON value.
//! Apart from the reserved properties (`__step__`, `thread_id`) and the merge
//! rules declared in the workflow's state schema, the engine never interprets
//! property values.
//!
//! # Core Types
//!
//! - [`WorkflowState`]: The live state owned by the scheduler for a running
//!   execution.
//! - [`StateSnapshot`]: Immutable point-in-time view handed to node executors.
//! - [`StateDelta`]: A partial update returned by a node, merged at the
//!   super-step barrier.
//!
//! # Examples
//!
//! ```rust
//! use agentweave::state::{StateDelta, WorkflowState};
//! use serde_json::json;
//!
//! let mut state = WorkflowState::builder()
//!     .with_property("plan_confirmed", json!(false))
//!     .with_property("items", json!([]))
//!     .build();
//!
//! let snapshot = state.snapshot();
//! assert_eq!(snapshot.get("plan_confirmed"), Some(&json!(false)));
//!
//! // Snapshots are independent of later mutation.
//! state.set("plan_confirmed", json!(true));
//! assert_eq!(snapshot.get("plan_confirmed"), Some(&json!(false)));
//! ```

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::types::STEP_PROPERTY;

/// The live state of a running execution.
///
/// Owned by the scheduler; nodes never see it directly. Executors receive a
/// [`StateSnapshot`] and return a [`StateDelta`], which the barrier merges
/// back under the per-property rules of the workflow's state schema.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkflowState {
    props: FxHashMap<String, Value>,
    step: u64,
}

impl WorkflowState {
    /// Creates an empty state at step zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a state from an initial property map.
    #[must_use]
    pub fn from_props(props: FxHashMap<String, Value>) -> Self {
        Self { props, step: 0 }
    }

    /// Creates a builder for fluent construction.
    #[must_use]
    pub fn builder() -> WorkflowStateBuilder {
        WorkflowStateBuilder::default()
    }

    /// Current super-step ordinal (the reserved `__step__` property).
    #[must_use]
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Advances the super-step ordinal. Called once per barrier by the runtime.
    pub fn advance_step(&mut self) {
        self.step += 1;
    }

    /// Restores the step ordinal when resuming from a checkpoint.
    pub fn set_step(&mut self, step: u64) {
        self.step = step;
    }

    /// Reads a property.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }

    /// Writes a property directly, bypassing merge rules.
    ///
    /// Reserved for runtime bookkeeping (thread id, input overlay); node
    /// updates always flow through the barrier instead.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.props.insert(key.into(), value);
    }

    /// Borrow the underlying property map.
    #[must_use]
    pub fn props(&self) -> &FxHashMap<String, Value> {
        &self.props
    }

    /// Mutable access for the barrier merge.
    pub(crate) fn props_mut(&mut self) -> &mut FxHashMap<String, Value> {
        &mut self.props
    }

    /// Creates an immutable snapshot of the current state.
    ///
    /// Clones all property values; snapshots are safe to hand to concurrently
    /// running nodes while the live state continues to evolve.
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            props: self.props.clone(),
            step: self.step,
        }
    }

    /// Renders the state as a JSON object, including the reserved `__step__`.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::with_capacity(self.props.len() + 1);
        for (k, v) in &self.props {
            map.insert(k.clone(), v.clone());
        }
        map.insert(STEP_PROPERTY.to_string(), Value::from(self.step));
        Value::Object(map)
    }
}

/// Immutable view of workflow state at a specific super-step.
///
/// Handed to node executors; also the evaluation context for router
/// conditions and input mappings.
#[derive(Clone, Debug, Default)]
pub struct StateSnapshot {
    /// Property values at snapshot time.
    pub props: FxHashMap<String, Value>,
    /// Super-step ordinal at snapshot time.
    pub step: u64,
}

impl StateSnapshot {
    /// Reads a property.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }

    /// Returns a copy of this snapshot with extra properties layered on top.
    ///
    /// Used by dynamic parallel fan-out to give each dispatched branch its
    /// `parallel_item` / `parallel_index` view without touching shared state.
    #[must_use]
    pub fn with_overlay(&self, overlay: &FxHashMap<String, Value>) -> Self {
        let mut props = self.props.clone();
        for (k, v) in overlay {
            props.insert(k.clone(), v.clone());
        }
        Self {
            props,
            step: self.step,
        }
    }

    /// Renders the snapshot as a JSON object (without `__step__`).
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::with_capacity(self.props.len());
        for (k, v) in &self.props {
            map.insert(k.clone(), v.clone());
        }
        Value::Object(map)
    }
}

/// A partial state update produced by one node execution.
///
/// Only the properties a node wants to change appear in the delta; the
/// barrier merges deltas from concurrent nodes deterministically
/// (lexicographic by node id) under each property's declared merge rule.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StateDelta {
    /// Property updates keyed by property name.
    #[serde(default)]
    pub props: FxHashMap<String, Value>,
}

impl StateDelta {
    /// An empty delta (no state change).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// A delta with a single property.
    ///
    /// ```rust
    /// # use agentweave::state::StateDelta;
    /// # use serde_json::json;
    /// let delta = StateDelta::of("x", json!(2));
    /// assert_eq!(delta.props.get("x"), Some(&json!(2)));
    /// ```
    #[must_use]
    pub fn of(key: impl Into<String>, value: Value) -> Self {
        let mut props = FxHashMap::default();
        props.insert(key.into(), value);
        Self { props }
    }

    /// Adds a property, chaining.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.props.insert(key.into(), value);
        self
    }

    /// `true` when the delta carries no updates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }
}

impl From<FxHashMap<String, Value>> for StateDelta {
    fn from(props: FxHashMap<String, Value>) -> Self {
        Self { props }
    }
}

/// Fluent builder for [`WorkflowState`].
#[derive(Debug, Default)]
pub struct WorkflowStateBuilder {
    props: FxHashMap<String, Value>,
}

impl WorkflowStateBuilder {
    /// Adds an initial property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.props.insert(key.into(), value);
        self
    }

    /// Merges every field of a JSON object as an initial property.
    ///
    /// Non-object inputs are stored under the `"input"` property, matching
    /// how raw execution-request payloads enter state.
    #[must_use]
    pub fn with_input(mut self, input: Value) -> Self {
        match input {
            Value::Object(map) => {
                for (k, v) in map {
                    self.props.insert(k, v);
                }
            }
            Value::Null => {}
            other => {
                self.props.insert("input".to_string(), other);
            }
        }
        self
    }

    /// Builds the state at step zero.
    #[must_use]
    pub fn build(self) -> WorkflowState {
        WorkflowState {
            props: self.props,
            step: 0,
        }
    }
}

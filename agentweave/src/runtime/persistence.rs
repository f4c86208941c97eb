/*!
Persistence primitives for serializing runtime state and checkpoints
(used by the SQLite checkpointer and any future persistent backends).

Design goals:
- Explicit serde-friendly structs decoupled from in-memory representations.
- Conversion logic localized here so checkpointer code stays lean.
- RFC3339 strings for timestamps, keeping `chrono::DateTime` out of the
  serialized shape.

This module performs no I/O; it is pure data transformation.
*/

use chrono::Utc;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::runtime::checkpoint::Checkpoint;
use crate::runtime::frontier::FrontierEntry;
use crate::runtime::ledger::JoinLedger;
use crate::state::WorkflowState;

/// Serde-friendly form of [`WorkflowState`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedState {
    #[serde(default)]
    pub props: FxHashMap<String, Value>,
    #[serde(default)]
    pub step: u64,
}

/// Serde-friendly form of [`Checkpoint`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedCheckpoint {
    pub thread_id: String,
    pub step_index: u64,
    pub state: PersistedState,
    #[serde(default)]
    pub frontier: Vec<FrontierEntry>,
    #[serde(default)]
    pub join_ledger: JoinLedger,
    /// RFC3339 creation time.
    pub created_at: String,
}

/// Conversion and (de)serialization errors for persistence models.
#[derive(Debug, Error, Diagnostic)]
pub enum PersistenceError {
    #[error("JSON serialization/deserialization failed: {source}")]
    #[diagnostic(
        code(agentweave::persistence::serde),
        help("ensure the JSON structure matches the Persisted* types")
    )]
    Serde {
        #[source]
        source: serde_json::Error,
    },

    #[error("missing persisted field: {0}")]
    #[diagnostic(code(agentweave::persistence::missing_field))]
    MissingField(&'static str),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Serializes a persistence model to a JSON string.
pub fn to_json_string<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|source| PersistenceError::Serde { source })
}

/// Deserializes a persistence model from a JSON string.
pub fn from_json_str<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T> {
    serde_json::from_str(s).map_err(|source| PersistenceError::Serde { source })
}

/* ---------- WorkflowState <-> PersistedState ---------- */

impl From<&WorkflowState> for PersistedState {
    fn from(state: &WorkflowState) -> Self {
        Self {
            props: state.props().clone(),
            step: state.step(),
        }
    }
}

impl From<PersistedState> for WorkflowState {
    fn from(persisted: PersistedState) -> Self {
        let mut state = WorkflowState::from_props(persisted.props);
        state.set_step(persisted.step);
        state
    }
}

/* ---------- Checkpoint <-> PersistedCheckpoint ---------- */

impl From<&Checkpoint> for PersistedCheckpoint {
    fn from(cp: &Checkpoint) -> Self {
        Self {
            thread_id: cp.thread_id.clone(),
            step_index: cp.step_index,
            state: PersistedState::from(&cp.state),
            frontier: cp.frontier.clone(),
            join_ledger: cp.join_ledger.clone(),
            created_at: cp.created_at.to_rfc3339(),
        }
    }
}

impl From<PersistedCheckpoint> for Checkpoint {
    fn from(persisted: PersistedCheckpoint) -> Self {
        let created_at = chrono::DateTime::parse_from_rfc3339(&persisted.created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        Checkpoint {
            thread_id: persisted.thread_id,
            step_index: persisted.step_index,
            state: WorkflowState::from(persisted.state),
            frontier: persisted.frontier,
            join_ledger: persisted.join_ledger,
            created_at,
        }
    }
}

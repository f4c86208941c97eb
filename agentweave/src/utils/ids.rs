//! Identifier generation for executions and threads.

use uuid::Uuid;

/// New execution id, `exec_` followed by twelve hex characters.
#[must_use]
pub fn execution_id() -> String {
    format!("exec_{}", &Uuid::new_v4().simple().to_string()[..12])
}

/// New thread id for requests that did not supply one.
#[must_use]
pub fn thread_id() -> String {
    format!("thread_{}", &Uuid::new_v4().simple().to_string()[..12])
}

/// Namespaced thread id for a subgraph run sharing the parent checkpointer.
#[must_use]
pub fn subgraph_thread_id(parent: &str, node_id: &str) -> String {
    format!("{parent}:{node_id}")
}

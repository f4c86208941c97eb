//! Runtime configuration.
//!
//! Timeouts nest strictly: whole-execution > per-node > per-loop-iteration >
//! per-tool-call. A tighter inner timeout firing never cancels the outer
//! layer; the outer firing cancels all nested work.

use std::time::Duration;

/// Knobs for the scheduler and runner.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Wall-clock budget for a whole execution.
    pub execution_timeout: Option<Duration>,
    /// Budget for one node execution.
    pub node_timeout: Option<Duration>,
    /// Budget for one tool-loop iteration (model call plus its tools).
    pub iteration_timeout: Option<Duration>,
    /// Cap applied on top of each tool's declared per-call timeout.
    pub tool_timeout_cap: Option<Duration>,
    /// Concurrent node executions per super-step. `None` leaves the
    /// I/O-bound fan-out unbounded; provider semaphores still apply.
    pub fan_out_limit: Option<usize>,
    /// Live event-stream buffer capacity.
    pub event_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            execution_timeout: None,
            node_timeout: None,
            iteration_timeout: None,
            tool_timeout_cap: None,
            fan_out_limit: None,
            event_capacity: crate::event_bus::bus::DEFAULT_CAPACITY,
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_iteration_timeout(mut self, timeout: Duration) -> Self {
        self.iteration_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_fan_out_limit(mut self, limit: usize) -> Self {
        self.fan_out_limit = Some(limit.max(1));
        self
    }
}

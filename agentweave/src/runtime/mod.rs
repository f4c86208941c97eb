//! Execution runtime: scheduler, runner, checkpointing, and persistence.
//!
//! The scheduler drives super-steps over a compiled graph; the runner wraps
//! it with execution records, resume-by-thread semantics, and lifecycle
//! events; checkpointers persist the `(state, frontier, join ledger)` triple
//! that is the entire resume context.

pub mod checkpoint;
#[cfg(feature = "sqlite")]
pub mod checkpoint_sqlite;
pub mod config;
pub mod execution;
pub mod frontier;
pub mod ledger;
pub mod persistence;
pub mod runner;
pub mod scheduler;

pub use checkpoint::{
    Checkpoint, Checkpointer, CheckpointerError, InMemoryCheckpointer, StepRecord,
};
#[cfg(feature = "sqlite")]
pub use checkpoint_sqlite::SqliteCheckpointer;
pub use config::RuntimeConfig;
pub use execution::{ExecutionProgress, ExecutionRecord};
pub use frontier::FrontierEntry;
pub use ledger::{JoinEntry, JoinLedger};
pub use runner::{ExecutionRequest, ExecutionResponse, ExecutionRunner, RunnerError};
pub use scheduler::{ExecContext, ExecutionState, Scheduler, SchedulerError, StepOutcome, StepStatus};

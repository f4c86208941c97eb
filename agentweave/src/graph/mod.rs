//! Graph description, validation, and compilation.
//!
//! A workflow arrives as a declarative [`GraphSpec`] (nodes, ordered edges,
//! entry point, state schema). The [`Compiler`] validates it, resolves agent
//! and tool references through a [`ResourceResolver`], and produces an
//! immutable [`CompiledGraph`] shared across executions of the same workflow
//! version.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use agentweave::graph::{Compiler, GraphBuilder};
//! use serde_json::json;
//!
//! # async fn example(resolver: impl agentweave::graph::ResourceResolver + 'static) -> Result<(), Box<dyn std::error::Error>> {
//! let spec = GraphBuilder::new("summarize")
//!     .agent_node("summarizer", "agent-1", "summary")
//!     .entry("summarizer")
//!     .edge("summarizer", "__end__")
//!     .build();
//!
//! let compiler = Compiler::new(std::sync::Arc::new(resolver));
//! let graph = compiler.compile(&spec).await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod compile;
pub mod condition;
pub mod mapping;
pub mod spec;

pub use builder::GraphBuilder;
pub use compile::{
    CompileError, CompiledAgent, CompiledGraph, CompiledJoin, CompiledNode, CompiledParallel,
    CompiledRoute, CompiledRouter, CompiledSubgraph, Compiler, NodePayload, ParallelRegion,
    ResolveError, ResourceResolver,
};
pub use condition::{ConditionError, Predicate};
pub use mapping::{CompiledMapping, MappingError, Selector};
pub use spec::{
    AgentNodeConfig, EdgeSpec, FailurePolicy, GraphSpec, JoinNodeConfig, NodeSpec, OnBudget,
    ParallelNodeConfig, SubgraphNodeConfig,
};

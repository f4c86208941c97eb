//! End-to-end harness: compiled graph + scripted providers + runner.

use std::sync::Arc;
use std::time::Duration;

use agentweave::agents::{AgentDefinition, ChatModel, ProviderPool};
use agentweave::event_bus::{Event, MemorySink};
use agentweave::graph::{Compiler, GraphSpec};
use agentweave::runtime::{ExecutionRunner, InMemoryCheckpointer, RuntimeConfig};
use agentweave::tools::ToolRegistry;

use super::agents::{MapResolver, ScriptedModel};

pub struct Harness {
    pub runner: Arc<ExecutionRunner>,
    pub sink: MemorySink,
    pub checkpointer: Arc<InMemoryCheckpointer>,
}

/// Compiles `spec` against the given agents and tools, wiring each agent's
/// provider to its scripted model, and returns a runner with an in-memory
/// checkpointer plus a memory sink capturing lifecycle events.
pub async fn harness(
    spec: GraphSpec,
    agents: Vec<(AgentDefinition, Arc<ScriptedModel>)>,
    registry: ToolRegistry,
) -> Harness {
    harness_with_config(spec, agents, registry, RuntimeConfig::default()).await
}

pub async fn harness_with_config(
    spec: GraphSpec,
    agents: Vec<(AgentDefinition, Arc<ScriptedModel>)>,
    registry: ToolRegistry,
    config: RuntimeConfig,
) -> Harness {
    let mut resolver = MapResolver::new();
    for (definition, _) in &agents {
        resolver = resolver.with_agent(definition.clone());
    }

    let compiler = Compiler::new(Arc::new(resolver)).with_tools(Arc::new(registry));
    let graph = compiler.compile(&spec).await.expect("graph should compile");

    let mut pool = ProviderPool::new();
    for (definition, model) in agents {
        let model: Arc<dyn ChatModel> = model;
        pool = pool.with_model(definition.model.provider.clone(), model, None);
    }

    let checkpointer = Arc::new(InMemoryCheckpointer::new());
    let runner = ExecutionRunner::with_config(Arc::new(graph), pool, config)
        .with_checkpointer(checkpointer.clone());
    let sink = MemorySink::new();
    runner.add_event_sink(sink.clone());

    Harness {
        runner: Arc::new(runner),
        sink,
        checkpointer,
    }
}

/// Polls the sink until a terminal event shows up, then returns everything
/// captured so far.
pub async fn wait_for_terminal(sink: &MemorySink) -> Vec<Event> {
    for _ in 0..200 {
        let events = sink.snapshot();
        if events.iter().any(Event::is_terminal) {
            return events;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no terminal event observed: {:?}", sink.snapshot());
}

/// Names of the captured events, in order.
pub fn event_names(events: &[Event]) -> Vec<&'static str> {
    events.iter().map(Event::name).collect()
}

//! Execution lifecycle events, the bus that fans them out, and SSE encoding.

pub mod bus;
pub mod event;
pub mod sink;
pub mod sse;

pub use bus::{EventBus, EventStream};
pub use event::Event;
pub use sink::{ChannelSink, EventSink, MemorySink, StdOutSink};
pub use sse::{format_sse, SseMessage};

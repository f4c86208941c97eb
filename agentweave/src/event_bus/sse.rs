//! Server-Sent Events wire encoding.
//!
//! One event per line group: `event: <name>` followed by `data: <JSON>`,
//! terminated by a blank line. Multi-line data payloads are split across
//! `data:` lines per the SSE specification; optional `id:` and `retry:`
//! fields are supported for clients that resume.

use super::event::Event;

/// A single SSE message ready for encoding.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SseMessage {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

impl SseMessage {
    /// Message with event name and data payload.
    #[must_use]
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
            id: None,
            retry: None,
        }
    }

    /// Sets the `id:` field.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the `retry:` field (milliseconds).
    #[must_use]
    pub fn with_retry(mut self, retry_ms: u64) -> Self {
        self.retry = Some(retry_ms);
        self
    }

    /// Encodes as an HTTP-streamable string.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut lines = Vec::new();
        if let Some(id) = &self.id {
            lines.push(format!("id: {id}"));
        }
        if let Some(retry) = self.retry {
            lines.push(format!("retry: {retry}"));
        }
        lines.push(format!("event: {}", self.event));
        for line in self.data.split('\n') {
            lines.push(format!("data: {line}"));
        }
        lines.join("\n") + "\n\n"
    }
}

impl From<&Event> for SseMessage {
    fn from(event: &Event) -> Self {
        SseMessage::new(event.name(), event.payload().to_string())
    }
}

/// Encodes a lifecycle event directly.
#[must_use]
pub fn format_sse(event: &Event) -> String {
    SseMessage::from(event).encode()
}

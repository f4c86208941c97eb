//! The event bus: producers send over a flume channel, a background listener
//! broadcasts to sinks, and live subscribers read a bounded broadcast stream.
//!
//! The live stream has bounded backpressure: a subscriber that falls more
//! than `capacity` events behind loses the overflow (counted, logged) rather
//! than stalling the producer. Durable history is unaffected because step
//! records are written by the runtime, not by subscribers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, oneshot};
use tokio::task;

use super::event::Event;
use super::sink::EventSink;

/// Default live-subscriber buffer capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Receives events from workflow nodes and fans them out to sinks and live
/// subscribers.
pub struct EventBus {
    sinks: Arc<Mutex<Vec<Box<dyn EventSink>>>>,
    channel: (flume::Sender<Event>, flume::Receiver<Event>),
    broadcast: broadcast::Sender<Event>,
    dropped: Arc<AtomicUsize>,
    listener: Mutex<Option<ListenerState>>,
}

struct ListenerState {
    shutdown_tx: oneshot::Sender<()>,
    handle: task::JoinHandle<()>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_sinks(Vec::new(), DEFAULT_CAPACITY)
    }
}

impl EventBus {
    /// Bus with a single sink and default capacity.
    pub fn with_sink<T: EventSink + 'static>(sink: T) -> Self {
        Self::with_sinks(vec![Box::new(sink)], DEFAULT_CAPACITY)
    }

    /// Bus with explicit sinks and live-buffer capacity.
    pub fn with_sinks(sinks: Vec<Box<dyn EventSink>>, capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            sinks: Arc::new(Mutex::new(sinks)),
            channel: flume::unbounded(),
            broadcast: broadcast_tx,
            dropped: Arc::new(AtomicUsize::new(0)),
            listener: Mutex::new(None),
        }
    }

    /// Adds a sink (e.g. a per-request channel bridge).
    pub fn add_sink<T: EventSink + 'static>(&self, sink: T) {
        self.sinks.lock().unwrap().push(Box::new(sink));
    }

    /// Clone of the producer side for node contexts.
    #[must_use]
    pub fn sender(&self) -> flume::Sender<Event> {
        self.channel.0.clone()
    }

    /// Subscribes a live consumer. Events published before subscription are
    /// not replayed.
    #[must_use]
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            receiver: self.broadcast.subscribe(),
            dropped: Arc::clone(&self.dropped),
        }
    }

    /// Total events dropped across lagged subscribers.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Spawns the background listener. Idempotent.
    pub fn listen(&self) {
        let mut guard = self.listener.lock().expect("listener poisoned");
        if guard.is_some() {
            return;
        }

        let receiver = self.channel.1.clone();
        let sinks = Arc::clone(&self.sinks);
        let broadcast_tx = self.broadcast.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let handle = task::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    recv = receiver.recv_async() => match recv {
                        Err(_) => break,
                        Ok(event) => {
                            // A send error only means no live subscriber exists.
                            let _ = broadcast_tx.send(event.clone());
                            let mut sinks = sinks.lock().unwrap();
                            for sink in sinks.iter_mut() {
                                if let Err(e) = sink.handle(&event) {
                                    tracing::warn!(error = %e, "event sink failed");
                                }
                            }
                        }
                    }
                }
            }
        });

        *guard = Some(ListenerState {
            shutdown_tx,
            handle,
        });
    }

    /// Stops the background listener after draining queued events.
    pub async fn shutdown(&self) {
        let state = {
            let mut guard = self.listener.lock().expect("listener poisoned");
            guard.take()
        };
        if let Some(state) = state {
            // Drain whatever is already queued before signalling shutdown.
            while !self.channel.1.is_empty() {
                tokio::task::yield_now().await;
            }
            let _ = state.shutdown_tx.send(());
            let _ = state.handle.await;
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.listener.lock() {
            if let Some(state) = guard.take() {
                let _ = state.shutdown_tx.send(());
                state.handle.abort();
            }
        }
    }
}

/// Live event subscription with bounded backpressure.
pub struct EventStream {
    receiver: broadcast::Receiver<Event>,
    dropped: Arc<AtomicUsize>,
}

impl EventStream {
    /// Receives the next event, skipping over (and counting) any lag gaps.
    /// Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.dropped.fetch_add(missed as usize, Ordering::Relaxed);
                    tracing::warn!(missed, "live event stream lagged; dropped events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive for tests.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    self.dropped.fetch_add(missed as usize, Ordering::Relaxed);
                    continue;
                }
                Err(_) => return None,
            }
        }
    }
}

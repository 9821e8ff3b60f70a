//! The single persistent event stream of a session.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
};

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use shared::protocol::{ClientCommand, ServerEvent};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

pub type EventHandler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

type Registry = Mutex<Vec<(u64, EventHandler)>>;

/// Handle returned by [`EventChannel::subscribe`]. Dropping it keeps the
/// handler registered; call [`Subscription::unsubscribe`] to remove it.
#[must_use = "dropping a Subscription does not unsubscribe; keep it to call unsubscribe()"]
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(id, _)| *id != self.id);
    }
}

struct Connection {
    generation: u64,
    outbound: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

pub struct EventChannel {
    subscribers: Arc<Registry>,
    next_subscriber: AtomicU64,
    next_generation: AtomicU64,
    connection: Mutex<Option<Connection>>,
}

impl Default for EventChannel {
    fn default() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_subscriber: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
            connection: Mutex::new(None),
        }
    }
}

impl EventChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(&self, handler: impl Fn(&ServerEvent) + Send + Sync + 'static) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let handler: EventHandler = Arc::new(handler);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));
        Subscription {
            id,
            registry: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|connection| !connection.outbound.is_closed())
    }

    /// Best effort. Dropped with a debug log when no connection is open.
    pub fn send(&self, command: &ClientCommand) {
        let payload = match serde_json::to_string(command) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(command = command.name(), error = %err, "channel: failed to encode command");
                return;
            }
        };
        let guard = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(connection) = guard.as_ref() else {
            debug!(command = command.name(), "channel: not connected, command dropped");
            return;
        };
        if connection.outbound.send(payload).is_err() {
            debug!(command = command.name(), "channel: connection closed, command dropped");
            return;
        }
        debug!(command = command.name(), "channel: command queued");
    }

    /// Opens the event stream, replacing any existing connection.
    pub async fn connect(self: &Arc<Self>, url: &str) -> Result<()> {
        let (ws_stream, _) = connect_async(url)
            .await
            .with_context(|| format!("failed to connect websocket: {}", redact_token(url)))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            while let Some(payload) = outbound_rx.recv().await {
                if let Err(err) = ws_writer.send(Message::Text(payload)).await {
                    warn!(error = %err, "channel: websocket send failed");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let channel = Arc::downgrade(self);
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                let Some(channel) = channel.upgrade() else {
                    break;
                };
                match frame {
                    Ok(Message::Text(text)) => channel.dispatch_text(&text),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "channel: websocket receive failed");
                        break;
                    }
                }
            }
            if let Some(channel) = channel.upgrade() {
                channel.release(generation);
            }
        });

        let previous = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Connection {
                generation,
                outbound,
                reader,
                writer,
            });
        if let Some(previous) = previous {
            previous.reader.abort();
            previous.writer.abort();
        }
        info!(generation, "channel: connected");
        Ok(())
    }

    /// Tears down the connection. Subscribers stay registered.
    pub fn disconnect(&self) {
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(connection) = connection {
            connection.reader.abort();
            // Dropping the sender lets the writer flush and close the socket.
            drop(connection.outbound);
            info!(generation = connection.generation, "channel: disconnected");
        }
    }

    /// Decodes one inbound frame and delivers it to every subscriber in
    /// registration order. Malformed frames are dropped.
    pub fn dispatch_text(&self, text: &str) {
        match ServerEvent::decode(text) {
            Ok(event) => self.dispatch(&event),
            Err(err) => {
                warn!(error = %err, "channel: dropping malformed event");
            }
        }
    }

    pub fn dispatch(&self, event: &ServerEvent) {
        let handlers: Vec<(u64, EventHandler)> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for (id, handler) in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!(subscriber = id, event = event.name(), "channel: subscriber panicked");
            }
        }
    }

    fn release(&self, generation: u64) {
        let mut guard = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        if guard
            .as_ref()
            .is_some_and(|connection| connection.generation == generation)
        {
            guard.take();
            info!(generation, "channel: connection closed by peer");
        }
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        if let Some(connection) = self
            .connection
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            connection.reader.abort();
            connection.writer.abort();
        }
    }
}

fn redact_token(url: &str) -> String {
    match url.split_once("token=") {
        Some((head, _)) => format!("{head}token=***"),
        None => url.to_string(),
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;

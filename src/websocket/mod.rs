//! WebSocket session registry.
//!
//! Every upgraded connection becomes a [Session] that is subscribed to the
//! backend's events and kept in the registry until it closes. Broadcasts go
//! to every registered session; a session whose queue is full is closed
//! rather than buffered for.

pub mod session;

pub use session::{SendError, Session};

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::events::{self, EventCallback, Unsubscribe};
use crate::models::{CommandMessage, EventMessage, ServerInfo};
use crate::server::CommandError;
use session::{Registry, SEND_QUEUE_CAPACITY, WRITE_WAIT};

/// What sessions need from the server core. Called concurrently.
pub trait CommandHandler: Send + Sync + 'static {
    fn handle_command(&self, cmd: &CommandMessage) -> Result<Value, CommandError>;
    fn subscribe(&self, callback: EventCallback) -> Unsubscribe;
    fn server_info(&self) -> ServerInfo;
}

#[derive(Clone)]
pub struct Handler {
    backend: Arc<dyn CommandHandler>,
    connections: Arc<Registry>,
    root: CancellationToken,
}

impl Handler {
    pub fn new(backend: Arc<dyn CommandHandler>) -> Self {
        Self {
            backend,
            connections: Arc::new(RwLock::new(HashMap::new())),
            root: CancellationToken::new(),
        }
    }

    /// Create, subscribe and register a session. The caller owns the
    /// receiving end of its outbound queue.
    pub fn open_session(&self, capacity: usize) -> (Arc<Session>, mpsc::Receiver<String>) {
        let (session, rx) = Session::new(&self.connections, &self.root, capacity);

        let weak = Arc::downgrade(&session);
        let forward = events::callback(move |event, data| {
            let weak = weak.clone();
            async move {
                if let Some(session) = weak.upgrade() {
                    session.forward_event(EventMessage { event, data }).await;
                }
            }
        });
        session.set_unsubscribe(self.backend.subscribe(forward));

        self.connections
            .write()
            .insert(session.id().to_owned(), session.clone());
        if self.root.is_cancelled() {
            session.close();
        }
        (session, rx)
    }

    /// Serve one upgraded socket until it closes.
    pub async fn accept(&self, socket: WebSocket) {
        let (session, rx) = self.open_session(SEND_QUEUE_CAPACITY);
        log::info!("websocket connection {} established", session.id());
        let (mut sink, stream) = socket.split();

        let info = match serde_json::to_string(&self.backend.server_info()) {
            Ok(info) => info,
            Err(e) => {
                log::error!("failed to encode server info: {}", e);
                session.close();
                return;
            }
        };
        match tokio::time::timeout(WRITE_WAIT, sink.send(Message::Text(info.into()))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::error!("[{}] failed to send server info: {}", session.id(), e);
                session.close();
                return;
            }
            Err(_) => {
                log::error!("[{}] timed out sending server info", session.id());
                session.close();
                return;
            }
        }

        let writer = tokio::spawn(session.clone().write_loop(sink, rx));
        session.read_loop(self.backend.clone(), stream).await;
        if tokio::time::timeout(WRITE_WAIT, writer).await.is_err() {
            log::warn!("websocket writer did not stop in time");
        }
    }

    /// Encode once and queue on every session; close the ones that are full.
    pub fn broadcast(&self, event: &EventMessage) {
        let data = match serde_json::to_string(event) {
            Ok(data) => data,
            Err(e) => {
                log::error!("failed to encode event {}: {}", event.event, e);
                return;
            }
        };
        let stalled: Vec<Arc<Session>> = self
            .connections
            .read()
            .values()
            .filter(|s| matches!(s.try_enqueue(data.clone()), Err(SendError::Full)))
            .cloned()
            .collect();
        for session in stalled {
            log::warn!("closing unresponsive websocket connection {}", session.id());
            session.close();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Close every session. Sessions opened afterwards close immediately.
    pub fn shutdown_all(&self) {
        self.root.cancel();
        let sessions = std::mem::take(&mut *self.connections.write());
        for session in sessions.into_values() {
            session.close();
        }
        log::info!("websocket handler shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::models::EventType;
    use crate::server::Dispatcher;
    use crate::storage::{JsonStorage, Storage};
    use serde_json::json;
    use std::time::Duration;

    fn handler(dir: &tempfile::TempDir) -> (Handler, Arc<Dispatcher>) {
        let storage = JsonStorage::new(dir.path());
        storage.start().unwrap();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(storage),
            EventBus::new(),
            ServerInfo::new(1),
        ));
        (Handler::new(dispatcher.clone()), dispatcher)
    }

    fn event(n: usize) -> EventMessage {
        EventMessage {
            event: EventType::NodeEvent,
            data: json!(n),
        }
    }

    #[tokio::test]
    async fn open_registers_and_subscribes() {
        let dir = tempfile::tempdir().unwrap();
        let (h, d) = handler(&dir);
        let (s, _rx) = h.open_session(8);
        assert_eq!(h.connection_count(), 1);
        assert_eq!(d.events().subscriber_count(), 1);

        s.close();
        s.close();
        assert_eq!(h.connection_count(), 0);
        assert_eq!(d.events().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn broadcast_disconnects_slow_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let (h, _d) = handler(&dir);
        let (slow, _slow_rx) = h.open_session(2);
        let (fast, mut fast_rx) = h.open_session(SEND_QUEUE_CAPACITY);

        const N: usize = 10;
        for i in 0..N {
            h.broadcast(&event(i));
        }

        assert!(slow.is_closed());
        assert!(!fast.is_closed());
        assert_eq!(h.connection_count(), 1);
        for i in 0..N {
            let frame = fast_rx.recv().await.unwrap();
            let msg: EventMessage = serde_json::from_str(&frame).unwrap();
            assert_eq!(msg.data, json!(i));
        }
    }

    #[tokio::test]
    async fn published_burst_disconnects_slow_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let (h, d) = handler(&dir);
        let (slow, _slow_rx) = h.open_session(2);
        let (_fast, mut fast_rx) = h.open_session(SEND_QUEUE_CAPACITY);

        const N: usize = 6;
        for i in 0..N {
            d.events().publish(EventType::NodeEvent, json!(i));
        }

        let mut received = Vec::new();
        for _ in 0..N {
            let frame = tokio::time::timeout(Duration::from_secs(5), fast_rx.recv())
                .await
                .unwrap()
                .unwrap();
            let msg: EventMessage = serde_json::from_str(&frame).unwrap();
            received.push(msg.data.as_u64().unwrap());
        }
        received.sort_unstable();
        assert_eq!(received, (0..N as u64).collect::<Vec<_>>());

        d.events().close(Duration::from_secs(5)).await;
        assert!(slow.is_closed());
        assert_eq!(h.connection_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_all_closes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let (h, d) = handler(&dir);
        h.shutdown_all();
        assert_eq!(h.connection_count(), 0);

        let dir2 = tempfile::tempdir().unwrap();
        let (h2, d2) = handler(&dir2);
        let sessions: Vec<_> = (0..3).map(|_| h2.open_session(4)).collect();
        h2.shutdown_all();
        h2.shutdown_all();
        assert_eq!(h2.connection_count(), 0);
        assert!(sessions.iter().all(|(s, _)| s.is_closed()));
        assert_eq!(d2.events().subscriber_count(), 0);

        let (late, _rx) = h2.open_session(4);
        assert!(late.is_closed());
        assert_eq!(h2.connection_count(), 0);
        assert_eq!(d.events().subscriber_count(), 0);
    }
}

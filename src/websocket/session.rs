//! One client connection: a bounded outbound queue drained by a writer
//! task, a reader task dispatching commands, and a single-fire close.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitStream;
use futures::{Sink, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use super::CommandHandler;
use crate::events::Unsubscribe;
use crate::models::{generate_message_id, CommandMessage, EventMessage, ResultMessage};

pub const SEND_QUEUE_CAPACITY: usize = 256;
pub const SEND_TIMEOUT: Duration = Duration::from_secs(1);
pub const WRITE_WAIT: Duration = Duration::from_secs(10);
pub const PONG_WAIT: Duration = Duration::from_secs(60);
/// 90% of [PONG_WAIT].
pub const PING_PERIOD: Duration = Duration::from_secs(54);
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

pub(crate) type Registry = RwLock<HashMap<String, Arc<Session>>>;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,
    #[error("send timeout")]
    Timeout,
    #[error("send queue full")]
    Full,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct Session {
    id: String,
    tx: Mutex<Option<mpsc::Sender<String>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    unsubscribe: Mutex<Option<Unsubscribe>>,
    registry: Weak<Registry>,
}

impl Session {
    pub(crate) fn new(
        registry: &Arc<Registry>,
        parent: &CancellationToken,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        let session = Arc::new(Self {
            id: generate_message_id(),
            tx: Mutex::new(Some(tx)),
            cancel: parent.child_token(),
            closed: AtomicBool::new(false),
            unsubscribe: Mutex::new(None),
            registry: Arc::downgrade(registry),
        });
        (session, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Store the event subscription. Released right away if already closed.
    pub(crate) fn set_unsubscribe(&self, handle: Unsubscribe) {
        *self.unsubscribe.lock() = Some(handle);
        if self.is_closed() {
            if let Some(handle) = self.unsubscribe.lock().take() {
                handle.unsubscribe();
            }
        }
    }

    /// Tear the session down. Later calls are no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        if let Some(handle) = self.unsubscribe.lock().take() {
            handle.unsubscribe();
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.write().remove(&self.id);
        }
        self.tx.lock().take();
        log::info!("websocket connection {} closed", self.id);
    }

    fn sender(&self) -> Result<mpsc::Sender<String>, SendError> {
        self.tx.lock().clone().ok_or(SendError::Closed)
    }

    /// Queue an already encoded frame without waiting.
    pub fn try_enqueue(&self, data: String) -> Result<(), SendError> {
        match self.sender()?.try_send(data) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SendError::Full),
            Err(TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Queue a message, waiting at most [SEND_TIMEOUT] for room.
    pub async fn send<T: Serialize>(&self, msg: &T) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }
        let data = serde_json::to_string(msg)?;
        let tx = self.sender()?;
        tokio::select! {
            r = tx.send_timeout(data, SEND_TIMEOUT) => match r {
                Ok(()) => Ok(()),
                Err(SendTimeoutError::Timeout(_)) => Err(SendError::Timeout),
                Err(SendTimeoutError::Closed(_)) => Err(SendError::Closed),
            },
            _ = self.cancel.cancelled() => Err(SendError::Closed),
        }
    }

    pub(crate) async fn send_error(&self, message_id: String, code: i64, details: String) {
        let msg = ResultMessage::Error {
            message_id,
            error_code: code,
            details: Some(details),
        };
        if let Err(e) = self.send(&msg).await {
            self.send_failed("error message", e);
        }
    }

    /// Log a failed send. A send that timed out closes the session.
    fn send_failed(&self, what: &str, e: SendError) {
        if matches!(e, SendError::Closed) {
            return;
        }
        log::error!("[{}] failed to send {}: {}", self.id, what, e);
        if matches!(e, SendError::Timeout) {
            self.close();
        }
    }

    /// Forward a bus event. A session that stays full for [SEND_TIMEOUT]
    /// is closed.
    pub(crate) async fn forward_event(&self, event: EventMessage) {
        if let Err(e) = self.send(&event).await {
            self.send_failed(&format!("event {}", event.event), e);
        }
    }

    async fn run_command(&self, backend: Arc<dyn CommandHandler>, cmd: CommandMessage) {
        log::debug!("[{}] command {} ({})", self.id, cmd.command, cmd.message_id);
        let reply = match backend.handle_command(&cmd) {
            Ok(result) => ResultMessage::Success {
                message_id: cmd.message_id,
                result,
            },
            Err(e) => {
                log::warn!("[{}] command {} failed: {}", self.id, cmd.command, e);
                ResultMessage::Error {
                    message_id: cmd.message_id,
                    error_code: e.code(),
                    details: Some(e.to_string()),
                }
            }
        };
        if let Err(e) = self.send(&reply).await {
            self.send_failed("command response", e);
        }
    }

    fn handle_frame(
        self: &Arc<Self>,
        backend: &Arc<dyn CommandHandler>,
        commands: &mut JoinSet<()>,
        data: &[u8],
    ) {
        let session = self.clone();
        match serde_json::from_slice::<CommandMessage>(data) {
            Ok(cmd) => {
                let backend = backend.clone();
                commands.spawn(async move { session.run_command(backend, cmd).await });
            }
            Err(e) => {
                log::warn!("[{}] failed to decode command: {}", self.id, e);
                commands.spawn(async move {
                    session
                        .send_error(generate_message_id(), 400, "Invalid message format".into())
                        .await
                });
            }
        }
    }

    /// Read frames until the peer goes away, the read deadline passes or
    /// the session is cancelled. In-flight commands are aborted on exit.
    pub(crate) async fn read_loop(
        self: Arc<Self>,
        backend: Arc<dyn CommandHandler>,
        mut stream: SplitStream<WebSocket>,
    ) {
        let mut commands = JoinSet::new();
        let mut deadline = Instant::now() + PONG_WAIT;
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(_) = commands.join_next(), if !commands.is_empty() => continue,
                frame = tokio::time::timeout_at(deadline, stream.next()) => frame,
            };
            let msg = match frame {
                Err(_) => {
                    log::info!("[{}] read deadline exceeded", self.id);
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    log::debug!("[{}] websocket read error: {}", self.id, e);
                    break;
                }
                Ok(Some(Ok(msg))) => msg,
            };
            deadline = Instant::now() + PONG_WAIT;
            match msg {
                Message::Text(text) => self.handle_frame(&backend, &mut commands, text.as_str().as_bytes()),
                Message::Binary(data) => self.handle_frame(&backend, &mut commands, &data),
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
        commands.abort_all();
        self.close();
    }

    /// Drain the queue into the socket. Frames queued while a write is
    /// prepared are joined with newlines into one text frame. Pings go out
    /// every [PING_PERIOD] regardless of other writes.
    pub(crate) async fn write_loop<S>(self: Arc<Self>, mut sink: S, mut rx: mpsc::Receiver<String>)
    where
        S: Sink<Message> + Unpin,
        S::Error: std::fmt::Display,
    {
        let mut ping = tokio::time::interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = rx.recv() => {
                    let Some(mut batch) = msg else {
                        let _ = timeout(WRITE_WAIT, sink.send(Message::Close(None))).await;
                        break;
                    };
                    for _ in 0..rx.len() {
                        match rx.try_recv() {
                            Ok(next) => {
                                batch.push('\n');
                                batch.push_str(&next);
                            }
                            Err(_) => break,
                        }
                    }
                    match timeout(WRITE_WAIT, sink.send(Message::Text(batch.into()))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            log::debug!("[{}] websocket write error: {}", self.id, e);
                            break;
                        }
                        Err(_) => {
                            log::warn!("[{}] write deadline exceeded", self.id);
                            break;
                        }
                    }
                }
                _ = ping.tick() => {
                    if !matches!(timeout(WRITE_WAIT, sink.send(Message::Ping(Bytes::new()))).await, Ok(Ok(()))) {
                        log::debug!("[{}] keepalive failed", self.id);
                        break;
                    }
                }
            }
        }
        self.close();
        let _ = timeout(WRITE_WAIT, sink.close()).await;
    }
}

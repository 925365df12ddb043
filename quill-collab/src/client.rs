//! WebSocket client for connecting an editor to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle with the `token`/`document` handshake
//! - Update send/receive with typed attribution
//! - Presence (join/leave) events
//! - Offline queue for edits made while disconnected

use std::collections::VecDeque;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{Frame, FrameKind, PresenceEvent, ProtocolError};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Initial full state received
    StateSynced(Vec<u8>),
    /// A remote member's update, merged by the server
    RemoteUpdate { user_id: Uuid, update: Vec<u8> },
    /// The server rejected our update (insufficient permission)
    UpdateRejected(String),
    /// A member joined or left
    Presence(PresenceEvent),
    /// The server closed the connection with a reason
    Closed { code: u16, reason: String },
}

/// Queue for updates made while disconnected, replayed on reconnect.
pub struct OfflineQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update for later replay. Returns `false` when full.
    pub fn enqueue(&mut self, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(payload);
        true
    }

    /// Drain all queued updates for replay.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|p| p.len()).sum()
    }
}

/// The collaboration client.
pub struct CollabClient {
    server_url: String,
    access_token: String,
    doc_id: Uuid,
    user_id: Uuid,
    state: Arc<RwLock<ConnectionState>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl CollabClient {
    /// Create a client for one document.
    ///
    /// `user_id` is advisory for frame construction; the server attributes
    /// updates from the verified token regardless.
    pub fn new(
        server_url: impl Into<String>,
        access_token: impl Into<String>,
        doc_id: Uuid,
        user_id: Uuid,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            access_token: access_token.into(),
            doc_id,
            user_id,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and authenticate.
    ///
    /// Spawns background tasks for the WebSocket read/write halves and
    /// replays any offline-queued updates.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = format!(
            "{}/?token={}&document={}",
            self.server_url, self.access_token, self.doc_id
        );

        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the WebSocket.
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx.clone());
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_writer.send(msg).await.is_err() {
                    break;
                }
            }
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Replay offline queue
        {
            let mut queue = self.offline_queue.lock().await;
            let queued = queue.drain();
            if !queued.is_empty() {
                log::info!("Replaying {} queued updates", queued.len());
                for payload in queued {
                    let frame = Frame::update(self.user_id, self.doc_id, payload);
                    if let Ok(encoded) = frame.encode() {
                        let _ = out_tx.send(Message::Binary(encoded.into())).await;
                    }
                }
            }
        }

        // Reader task: decode incoming frames into events.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let pong_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        if let Ok(frame) = Frame::decode(&bytes) {
                            let event = match frame.kind {
                                FrameKind::StateSync => Some(SyncEvent::StateSynced(frame.payload)),
                                FrameKind::Update => Some(SyncEvent::RemoteUpdate {
                                    user_id: frame.user_id,
                                    update: frame.payload,
                                }),
                                FrameKind::UpdateRejected => Some(SyncEvent::UpdateRejected(
                                    frame.rejection_reason().unwrap_or_default(),
                                )),
                                FrameKind::Presence => {
                                    frame.presence_event().ok().map(SyncEvent::Presence)
                                }
                                FrameKind::Ping => {
                                    if let Ok(pong) = Frame::pong(Uuid::nil()).encode() {
                                        let _ = pong_tx.send(Message::Binary(pong.into())).await;
                                    }
                                    None
                                }
                                _ => None,
                            };
                            if let Some(event) = event {
                                let _ = event_tx.send(event).await;
                            }
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        let _ = pong_tx.send(Message::Pong(data)).await;
                    }
                    Ok(Message::Close(frame)) => {
                        if let Some(frame) = frame {
                            let _ = event_tx
                                .send(SyncEvent::Closed {
                                    code: frame.code.into(),
                                    reason: frame.reason.to_string(),
                                })
                                .await;
                        }
                        break;
                    }
                    Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Send a CRDT update, queueing it when disconnected.
    pub async fn send_update(&self, update: Vec<u8>) -> Result<(), ProtocolError> {
        let state = *self.state.read().await;
        if state != ConnectionState::Connected {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(update) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }

        let frame = Frame::update(self.user_id, self.doc_id, update);
        let encoded = frame.encode()?;
        if let Some(tx) = &self.outgoing_tx {
            tx.send(Message::Binary(encoded.into()))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        Ok(())
    }

    /// Close the connection with a normal closure.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Send an application-level heartbeat ping.
    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let encoded = Frame::ping(self.user_id).encode()?;
        if let Some(tx) = &self.outgoing_tx {
            tx.send(Message::Binary(encoded.into()))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        Ok(())
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}

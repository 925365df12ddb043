//! Binary wire protocol for document synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┐
//! │ kind     │ user_id   │ doc_id   │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ variable │
//! └──────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! Every frame carries an explicit `user_id` so update attribution never
//! depends on runtime inspection of transport metadata. Frames travel as
//! binary WebSocket messages in both directions.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Frame types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    /// Full encoded document state, sent once to a connection on join.
    StateSync = 1,
    /// Incremental CRDT update (client→server, then fanned out).
    Update = 2,
    /// Server rejected an update for insufficient permission level.
    UpdateRejected = 3,
    /// A member joined or left the room.
    Presence = 4,
    /// Application-level heartbeat ping.
    Ping = 5,
    /// Application-level heartbeat pong.
    Pong = 6,
}

/// Presence change kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceKind {
    Joined,
    Left,
}

/// Payload of a [`FrameKind::Presence`] frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub kind: PresenceKind,
    pub user_id: Uuid,
    /// Display name resolved at admission time.
    pub name: String,
}

/// Top-level protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub kind: FrameKind,
    /// Originating user; `Uuid::nil()` for server-originated frames.
    pub user_id: Uuid,
    pub doc_id: Uuid,
    /// Frame payload (varies by kind).
    pub payload: Vec<u8>,
}

impl Frame {
    /// Full state sync, sent by the server on admission.
    pub fn state_sync(doc_id: Uuid, state: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::StateSync,
            user_id: Uuid::nil(),
            doc_id,
            payload: state,
        }
    }

    /// An incremental update attributed to `user_id`.
    pub fn update(user_id: Uuid, doc_id: Uuid, update: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Update,
            user_id,
            doc_id,
            payload: update,
        }
    }

    /// Explicit rejection of an update from an under-privileged member.
    ///
    /// The connection stays open read-only; silently dropping the update
    /// would leave the client believing its edit was accepted.
    pub fn update_rejected(doc_id: Uuid, reason: &str) -> Self {
        Self {
            kind: FrameKind::UpdateRejected,
            user_id: Uuid::nil(),
            doc_id,
            payload: reason.as_bytes().to_vec(),
        }
    }

    /// A presence (join/leave) notification.
    pub fn presence(doc_id: Uuid, event: &PresenceEvent) -> Self {
        let payload = bincode::serde::encode_to_vec(event, bincode::config::standard())
            .unwrap_or_default();
        Self {
            kind: FrameKind::Presence,
            user_id: event.user_id,
            doc_id,
            payload,
        }
    }

    /// Heartbeat ping.
    pub fn ping(user_id: Uuid) -> Self {
        Self {
            kind: FrameKind::Ping,
            user_id,
            doc_id: Uuid::nil(),
            payload: Vec::new(),
        }
    }

    /// Heartbeat pong.
    pub fn pong(user_id: Uuid) -> Self {
        Self {
            kind: FrameKind::Pong,
            user_id,
            doc_id: Uuid::nil(),
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }

    /// Parse the presence payload.
    pub fn presence_event(&self) -> Result<PresenceEvent, ProtocolError> {
        if self.kind != FrameKind::Presence {
            return Err(ProtocolError::InvalidKind);
        }
        let (event, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(event)
    }

    /// Rejection reason for an [`FrameKind::UpdateRejected`] frame.
    pub fn rejection_reason(&self) -> Result<String, ProtocolError> {
        if self.kind != FrameKind::UpdateRejected {
            return Err(ProtocolError::InvalidKind);
        }
        String::from_utf8(self.payload.clone())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Reasons a connection is closed by the server.
///
/// Tenant mismatch and nonexistent documents share [`CloseReason::AccessDenied`]
/// so that a rejected caller cannot distinguish the two cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// No `token` query parameter supplied.
    NoToken,
    /// Token failed signature or expiry verification.
    InvalidToken,
    /// No `document` query parameter supplied.
    MissingDocumentId,
    /// Unknown document or one outside the caller's tenant.
    AccessDenied,
    /// The room is at its configured member capacity.
    RoomFull,
    /// No pong received within the grace window.
    HeartbeatTimeout,
    /// Manager-wide shutdown in progress.
    ServerShutdown,
    /// Orderly closure.
    Normal,
}

impl CloseReason {
    /// WebSocket close code (RFC 6455): 1008 policy violation for
    /// handshake rejections, 1001 going away, 1000 normal closure.
    pub fn close_code(&self) -> u16 {
        match self {
            CloseReason::NoToken
            | CloseReason::InvalidToken
            | CloseReason::MissingDocumentId
            | CloseReason::AccessDenied
            | CloseReason::RoomFull => 1008,
            CloseReason::HeartbeatTimeout | CloseReason::ServerShutdown => 1001,
            CloseReason::Normal => 1000,
        }
    }

    /// Stable human-readable reason sent in the close frame.
    pub fn reason(&self) -> &'static str {
        match self {
            CloseReason::NoToken => "no access token provided",
            CloseReason::InvalidToken => "invalid or expired access token",
            CloseReason::MissingDocumentId => "missing document id",
            CloseReason::AccessDenied => "document not found or access denied",
            CloseReason::RoomFull => "room is at capacity",
            CloseReason::HeartbeatTimeout => "heartbeat timed out",
            CloseReason::ServerShutdown => "server shutting down",
            CloseReason::Normal => "normal closure",
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    InvalidKind,
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidKind => write!(f, "Invalid frame kind"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

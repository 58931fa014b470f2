//! Signaling messages exchanged between clients and the broker.
//!
//! Pure data layer: every message is a
//! JSON text frame discriminated by a `type` string field. Offer, answer and
//! candidate bodies are carried as opaque [`serde_json::Value`]s: the broker
//! rewrites the envelope (`target_peer_id` → `from_peer_id`) and never looks
//! inside.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ── Roles ─────────────────────────────────────────────────────────────────────

/// The role a peer declares when entering a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    Sender,
    Receiver,
}

impl PeerRole {
    /// The role the other peer in a room must hold.
    pub fn opposite(self) -> Self {
        match self {
            PeerRole::Sender => PeerRole::Receiver,
            PeerRole::Receiver => PeerRole::Sender,
        }
    }
}

// ── Error codes ───────────────────────────────────────────────────────────────

/// Error codes carried in `error` messages. The serialized form is the
/// external wire value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RoomFull,
    InvalidCode,
    PeerDisconnected,
    LockExpired,
    LockNotFound,
    RateLimited,
}

impl ErrorCode {
    /// Default human-readable message for this code.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::RoomFull => "room already has two peers",
            ErrorCode::InvalidCode => "code is unknown or expired",
            ErrorCode::PeerDisconnected => "the other peer disconnected",
            ErrorCode::LockExpired => "connection lock has expired",
            ErrorCode::LockNotFound => "connection lock does not exist",
            ErrorCode::RateLimited => "too many attempts, slow down",
        }
    }
}

// ── Client → broker ───────────────────────────────────────────────────────────

/// Messages a client sends to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Register this connection as the room's receiver and mint a code.
    GenerateCode,
    /// Join the room behind `code` with the declared role. Runs the abuse
    /// gate before the code is even looked at.
    JoinRoom { code: String, role: PeerRole },
    /// Opaque SDP offer for `target_peer_id`.
    WebrtcOffer {
        target_peer_id: Uuid,
        payload: Value,
    },
    /// Opaque SDP answer for `target_peer_id`.
    WebrtcAnswer {
        target_peer_id: Uuid,
        payload: Value,
    },
    /// Opaque ICE candidate for `target_peer_id`.
    IceCandidate {
        target_peer_id: Uuid,
        payload: Value,
    },
    /// Mint a single-use reconnection lock for `peer_id`.
    LockConnection { peer_id: Uuid },
    /// Inherit a previous peer's identity using an unexpired lock.
    ReconnectWithLock { lock_id: String },
    /// Progress report, relayed to the other peer as `peer_status`.
    TransferStatus {
        status: String,
        progress: f64,
        speed: f64,
    },
}

// ── Broker → client ───────────────────────────────────────────────────────────

/// Messages the broker sends to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerMessage {
    /// Reply to `generate_code`. `peer_id` is the receiver's own connection
    /// id (needed later for `lock_connection`); `timestamp` is unix millis.
    CodeGenerated {
        code: String,
        room_id: String,
        peer_id: Uuid,
        timestamp: u64,
    },
    /// A peer entered the room (broadcast to every peer, joiner included, so
    /// each side learns its own id from its own echo).
    PeerJoined { peer_id: Uuid, role: PeerRole },
    /// A peer's connection closed.
    PeerLeft { peer_id: Uuid },
    /// Reply to `lock_connection`. `expires_at` is unix millis.
    ConnectionLocked { lock_id: String, expires_at: u64 },
    /// Relayed `transfer_status` from the other peer.
    PeerStatus {
        from_peer_id: Uuid,
        status: String,
        progress: f64,
        speed: f64,
    },
    /// Relayed offer, envelope rewritten.
    WebrtcOffer { from_peer_id: Uuid, payload: Value },
    /// Relayed answer, envelope rewritten.
    WebrtcAnswer { from_peer_id: Uuid, payload: Value },
    /// Relayed ICE candidate, envelope rewritten.
    IceCandidate { from_peer_id: Uuid, payload: Value },
    /// Terminal or advisory error.
    Error { code: ErrorCode, message: String },
}

impl BrokerMessage {
    /// Build an `error` message with the code's default text.
    pub fn error(code: ErrorCode) -> Self {
        BrokerMessage::Error {
            code,
            message: code.message().to_string(),
        }
    }
}

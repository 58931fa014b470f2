//! The transfer engine: sender/receiver lifecycle over broker signaling and
//! a reliable datagram channel.
//!
//! [`session::TransferSession`] is the state machine; this module holds the
//! data types crossing its boundary (configuration, status, app-facing
//! events) and small helpers shared by both roles.

pub mod session;
pub mod signaling;

use crate::core::config::{CODE_LENGTH, DEFAULT_CHUNK_SIZE};
use crate::core::protocol::control::TransferMetadata;
use crate::core::protocol::signaling::PeerRole;
use rand::Rng;
use uuid::Uuid;

pub use session::{SessionHandle, TransferSession};

// ── Configuration ─────────────────────────────────────────────────────────────

/// Options recognized by the transfer engine.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Whether the sender may compress (still subject to the size window).
    pub enable_compression: bool,
    /// Carried for forward compatibility; the core pipeline does not
    /// encrypt.
    pub enable_encryption: bool,
    /// Bytes per chunk before compression.
    pub chunk_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            enable_compression: true,
            enable_encryption: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

// ── Status ────────────────────────────────────────────────────────────────────

/// Lifecycle of a transfer session. Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Idle,
    Connecting,
    Waiting,
    Transferring,
    Completed,
    Error,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Error | TransferStatus::Cancelled
        )
    }

    /// Wire form used in `transfer_status` reports.
    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Idle => "idle",
            TransferStatus::Connecting => "connecting",
            TransferStatus::Waiting => "waiting",
            TransferStatus::Transferring => "transferring",
            TransferStatus::Completed => "completed",
            TransferStatus::Error => "error",
            TransferStatus::Cancelled => "cancelled",
        }
    }
}

// ── App-facing events ─────────────────────────────────────────────────────────

/// Events delivered from a session to the application.
#[derive(Debug)]
pub enum EngineEvent {
    StatusChanged(TransferStatus),
    /// The rendezvous code is registered and ready to hand to the sender.
    CodeReady { code: String },
    /// The other peer entered the room.
    PeerJoined { peer_id: Uuid, role: PeerRole },
    /// The other peer's relayed progress report.
    PeerStatus {
        from_peer_id: Uuid,
        status: String,
        progress: f64,
        speed: f64,
    },
    /// Own progress, in logical bytes.
    Progress {
        bytes_transferred: u64,
        total_bytes: u64,
    },
    /// A file arrived whole.
    FileReceived {
        metadata: TransferMetadata,
        bytes: Vec<u8>,
    },
    /// Non-fatal protocol hiccups and fatal failures alike; pair with
    /// [`EngineEvent::StatusChanged`] to tell them apart.
    Error(String),
}

// ── Outgoing files ────────────────────────────────────────────────────────────

/// A file queued for sending.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub mime: String,
    pub data: Vec<u8>,
}

impl OutgoingFile {
    pub fn new(name: impl Into<String>, mime: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime: mime.into(),
            data,
        }
    }
}

/// Mint a rendezvous code locally (the receiver's default path: the code is
/// also the room id it connects to).
pub fn mint_code() -> String {
    let space = 10u32.pow(CODE_LENGTH as u32);
    let x = rand::thread_rng().gen_range(0..space);
    format!("{:0width$}", x, width = CODE_LENGTH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minted_code_format() {
        for _ in 0..100 {
            let code = mint_code();
            assert_eq!(code.len(), CODE_LENGTH);
            assert!(code.bytes().all(|b| b.is_ascii_digit()));
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(TransferStatus::Completed.is_terminal());
        assert!(TransferStatus::Error.is_terminal());
        assert!(TransferStatus::Cancelled.is_terminal());
        assert!(!TransferStatus::Transferring.is_terminal());
        assert!(!TransferStatus::Waiting.is_terminal());
    }

    #[test]
    fn test_default_config() {
        let config = TransferConfig::default();
        assert!(config.enable_compression);
        assert!(config.enable_encryption);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
    }
}

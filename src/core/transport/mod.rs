//! Reliable-datagram transport contract.
//!
//! The transfer engine does not care how bytes move between peers, only
//! that the channel is ordered, reliable and message-oriented. This module
//! pins that contract down; `webrtc.rs` implements it over a WebRTC data
//! channel and the test harness implements it in-process.

pub mod webrtc;

#[cfg(test)]
pub mod memory;

use crate::core::config::MAX_DATAGRAM_SIZE;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;

// ── Signaling payloads ────────────────────────────────────────────────────────

/// Session-negotiation payloads emitted by and fed into an endpoint. These
/// travel opaquely through the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: Value },
}

// ── Events ────────────────────────────────────────────────────────────────────

/// Events an endpoint delivers to its owner.
#[derive(Debug)]
pub enum TransportEvent {
    /// A local signaling payload that must reach the remote peer.
    Signal(SignalPayload),
    /// The data channel is open (not merely the connection up).
    Connected,
    /// The data channel closed.
    Disconnected,
    /// Channel or connection failure.
    Error(String),
    /// An inbound datagram.
    Message(Bytes),
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why a send was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("data channel not open")]
    NotConnected,
    #[error("datagram of {0} bytes exceeds the {MAX_DATAGRAM_SIZE}-byte limit")]
    TooLarge(usize),
    #[error("transport failure: {0}")]
    Transport(String),
}

// ── Configuration ─────────────────────────────────────────────────────────────

/// Endpoint configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Emit each ICE candidate as discovered. When off, the local
    /// description is withheld until gathering completes.
    pub trickle: bool,
    /// STUN/TURN server URLs.
    pub ice_servers: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            trickle: true,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

// ── Contract ──────────────────────────────────────────────────────────────────

/// An ordered, reliable, message-oriented channel to one remote peer.
#[async_trait]
pub trait ReliableDatagram: Send + Sync {
    /// Feed a remote description or candidate. Candidates arriving before
    /// the remote description are queued and replayed once it lands.
    async fn signal(&self, payload: SignalPayload) -> anyhow::Result<()>;

    /// Send one datagram. Fails [`SendError::NotConnected`] before the
    /// channel opens and [`SendError::TooLarge`] above the size limit.
    async fn send(&self, data: Bytes) -> Result<(), SendError>;

    /// Bytes queued in the send buffer (back-pressure signal).
    async fn buffered_amount(&self) -> usize;

    /// Tear the endpoint down.
    async fn close(&self);
}

pub type TransportHandle = Arc<dyn ReliableDatagram>;
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// How the engine builds an endpoint when pairing happens: `initiator`
/// decides which side opens the labelled data channel.
pub type TransportFactory = Arc<
    dyn Fn(bool) -> Pin<Box<dyn Future<Output = anyhow::Result<(TransportHandle, TransportEvents)>> + Send>>
        + Send
        + Sync,
>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_payload_wire_shape() {
        let offer = SignalPayload::Offer {
            sdp: "v=0\r\n".into(),
        };
        let value = serde_json::to_value(&offer).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["sdp"], "v=0\r\n");

        let candidate: SignalPayload = serde_json::from_value(serde_json::json!({
            "type": "candidate",
            "candidate": {"candidate": "candidate:1 1 udp 2130706431 192.0.2.1 54321 typ host"}
        }))
        .unwrap();
        assert!(matches!(candidate, SignalPayload::Candidate { .. }));
    }

    #[test]
    fn test_send_error_display() {
        assert_eq!(SendError::NotConnected.to_string(), "data channel not open");
        assert!(SendError::TooLarge(20_000_000).to_string().contains("20000000"));
    }
}

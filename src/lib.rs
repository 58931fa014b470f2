//! fluxdrop: peer-to-peer file transfer.
//!
//! Two halves share this crate: the room-based signaling broker
//! ([`core::broker`]) and the client transfer engine ([`core::engine`])
//! that negotiates a WebRTC data channel through the broker and streams
//! framed, optionally compressed chunks over it.

pub mod core;
pub mod utils;
pub mod workers;

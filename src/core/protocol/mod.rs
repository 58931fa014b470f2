//! Wire protocol: signaling messages (client ↔ broker) and data-channel
//! control messages (peer ↔ peer).

pub mod control;
pub mod signaling;

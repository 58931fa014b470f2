//! The signaling broker: room-based rendezvous with short-lived codes.
//!
//! The broker ties together:
//! - the code registry (mint/validate short numeric codes)
//! - abuse control (rate limit + lockout gate in front of `join_room`)
//! - rooms (pairing state, connection locks)
//! - message routing (peer-directed relays with envelope rewrite)
//!
//! All state is process-wide, owned by [`Broker`] and threaded into each
//! per-connection task as an `Arc` handle. Offer/answer/candidate bodies are
//! never inspected: the broker attaches `from_peer_id` and forwards.

pub mod abuse;
pub mod codes;
pub mod room;
pub mod server;

use crate::core::config::LOCK_TTL;
use crate::core::protocol::signaling::{BrokerMessage, ClientMessage, ErrorCode, PeerRole};
use abuse::AbuseControl;
use codes::CodeRegistry;
use room::{LockFailure, Peer, RegisterError, Room, RoomManager};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-connection context threaded through every handler. `room_id` follows
/// the connection when a join resolves its code to a different room.
#[derive(Debug)]
pub struct ConnectionCtx {
    pub conn_id: Uuid,
    pub room_id: String,
    /// Client-identifying key for abuse control (source IP in production).
    pub client_key: String,
    pub tx: tokio::sync::mpsc::UnboundedSender<BrokerMessage>,
}

impl ConnectionCtx {
    fn reply(&self, msg: BrokerMessage) {
        let _ = self.tx.send(msg);
    }

    fn reply_error(&self, code: ErrorCode) {
        self.reply(BrokerMessage::error(code));
    }
}

/// Process-wide broker state. Tables are independent and never locked
/// across one another, so lock order cannot deadlock.
#[derive(Debug, Default)]
pub struct Broker {
    codes: Mutex<CodeRegistry>,
    abuse: Mutex<AbuseControl>,
    rooms: Mutex<RoomManager>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Connection lifecycle ─────────────────────────────────────────────

    /// Attach a fresh transport connection to its room. `Err(RoomFull)`
    /// means the caller must refuse and close the connection.
    pub async fn accept(&self, ctx: &ConnectionCtx) -> Result<(), ErrorCode> {
        let mut rooms = self.rooms.lock().await;
        let room = rooms.room_entry(&ctx.room_id);
        if !room.attach(ctx.conn_id) {
            warn!(
                event = "room_full",
                room_id = %ctx.room_id,
                conn_id = %ctx.conn_id,
                "Refusing third connection to room"
            );
            return Err(ErrorCode::RoomFull);
        }
        debug!(
            event = "connection_attached",
            room_id = %ctx.room_id,
            conn_id = %ctx.conn_id,
            "Connection attached to room"
        );
        Ok(())
    }

    /// Tear down a closed connection: drop its peer, tell survivors, and
    /// destroy the room (expiring its codes) once nothing keeps it alive.
    pub async fn disconnect(&self, ctx: &ConnectionCtx) {
        let mut rooms = self.rooms.lock().await;
        let Some(room) = rooms.room_mut(&ctx.room_id) else {
            return;
        };

        let departed = room.detach(ctx.conn_id);
        if let Some(peer) = &departed {
            info!(
                event = "peer_disconnected",
                room_id = %ctx.room_id,
                peer_id = %peer.peer_id,
                "Peer left room"
            );
            for other in room.other_peers(ctx.conn_id) {
                let _ = other.tx.send(BrokerMessage::PeerLeft {
                    peer_id: peer.peer_id,
                });
                let _ = other
                    .tx
                    .send(BrokerMessage::error(ErrorCode::PeerDisconnected));
            }
        }

        if room.is_idle() && !room.has_live_locks() {
            rooms.remove(&ctx.room_id);
            self.codes.lock().await.expire_room(&ctx.room_id);
            debug!(event = "room_destroyed", room_id = %ctx.room_id, "Room destroyed");
        }
    }

    // ── Message dispatch ─────────────────────────────────────────────────

    pub async fn handle_message(&self, ctx: &mut ConnectionCtx, msg: ClientMessage) {
        match msg {
            ClientMessage::GenerateCode => self.handle_generate_code(ctx).await,
            ClientMessage::JoinRoom { code, role } => self.handle_join_room(ctx, &code, role).await,
            ClientMessage::WebrtcOffer {
                target_peer_id,
                payload,
            } => {
                self.relay(ctx, target_peer_id, |from_peer_id| BrokerMessage::WebrtcOffer {
                    from_peer_id,
                    payload,
                })
                .await
            }
            ClientMessage::WebrtcAnswer {
                target_peer_id,
                payload,
            } => {
                self.relay(ctx, target_peer_id, |from_peer_id| BrokerMessage::WebrtcAnswer {
                    from_peer_id,
                    payload,
                })
                .await
            }
            ClientMessage::IceCandidate {
                target_peer_id,
                payload,
            } => {
                self.relay(ctx, target_peer_id, |from_peer_id| BrokerMessage::IceCandidate {
                    from_peer_id,
                    payload,
                })
                .await
            }
            ClientMessage::LockConnection { peer_id } => {
                self.handle_lock_connection(ctx, peer_id).await
            }
            ClientMessage::ReconnectWithLock { lock_id } => {
                self.handle_reconnect_with_lock(ctx, &lock_id).await
            }
            ClientMessage::TransferStatus {
                status,
                progress,
                speed,
            } => self.handle_transfer_status(ctx, status, progress, speed).await,
        }
    }

    // ── generate_code ────────────────────────────────────────────────────

    async fn handle_generate_code(&self, ctx: &ConnectionCtx) {
        // The room id doubles as the code when it already has rendezvous
        // shape (the path our clients use); otherwise mint one and map it.
        let code = {
            let mut codes = self.codes.lock().await;
            let code = if CodeRegistry::is_valid_format(&ctx.room_id) {
                ctx.room_id.clone()
            } else {
                match codes.generate_unused() {
                    Ok(code) => code,
                    Err(e) => {
                        warn!(event = "code_generation_failed", error = %e, "Could not mint a code");
                        ctx.reply_error(ErrorCode::InvalidCode);
                        return;
                    }
                }
            };
            codes.register(&code, &ctx.room_id, ctx.conn_id);
            code
        };

        {
            let mut rooms = self.rooms.lock().await;
            let room = rooms.room_entry(&ctx.room_id);
            let registered = room.register_peer(Peer {
                peer_id: ctx.conn_id,
                role: PeerRole::Receiver,
                tx: ctx.tx.clone(),
            });
            if let Err(e) = registered {
                self.reply_register_error(ctx, e);
                return;
            }
        }

        info!(
            event = "code_generated",
            room_id = %ctx.room_id,
            peer_id = %ctx.conn_id,
            code,
            "Receiver registered, code minted"
        );
        ctx.reply(BrokerMessage::CodeGenerated {
            code,
            room_id: ctx.room_id.clone(),
            peer_id: ctx.conn_id,
            timestamp: now_unix_millis(),
        });
    }

    // ── join_room ────────────────────────────────────────────────────────

    async fn handle_join_room(&self, ctx: &mut ConnectionCtx, code: &str, role: PeerRole) {
        // Abuse gate: lockout, then rate, then count the attempt. A refusal
        // here never touches the failure streak.
        {
            let mut abuse = self.abuse.lock().await;
            if abuse.is_locked(&ctx.client_key) {
                debug!(event = "join_refused_lockout", key = %ctx.client_key, "Join refused: locked out");
                ctx.reply_error(ErrorCode::RateLimited);
                return;
            }
            if !abuse.check_rate(&ctx.client_key) {
                debug!(event = "join_refused_rate", key = %ctx.client_key, "Join refused: rate limited");
                ctx.reply_error(ErrorCode::RateLimited);
                return;
            }
            abuse.record_attempt(&ctx.client_key);
        }

        // Code validation advances or clears the failure streak.
        let target_room = {
            let mut codes = self.codes.lock().await;
            if !codes.validate(code) {
                self.abuse.lock().await.record_failure(&ctx.client_key);
                debug!(event = "join_invalid_code", code, "Join refused: invalid code");
                ctx.reply_error(ErrorCode::InvalidCode);
                return;
            }
            let room_id = codes
                .room_of(code)
                .expect("validated code has a room")
                .to_string();
            self.abuse.lock().await.record_success(&ctx.client_key);
            room_id
        };

        let mut rooms = self.rooms.lock().await;

        // The code may resolve to a different room than the connection's
        // path; follow the code.
        if target_room != ctx.room_id {
            if let Some(old) = rooms.room_mut(&ctx.room_id) {
                old.detach(ctx.conn_id);
            }
            let room = rooms.room_entry(&target_room);
            if !room.attach(ctx.conn_id) {
                ctx.reply_error(ErrorCode::RoomFull);
                return;
            }
            ctx.room_id = target_room.clone();
        }

        let room = rooms.room_entry(&target_room);
        let registered = room.register_peer(Peer {
            peer_id: ctx.conn_id,
            role,
            tx: ctx.tx.clone(),
        });
        if let Err(e) = registered {
            self.reply_register_error(ctx, e);
            return;
        }

        info!(
            event = "peer_joined",
            room_id = %target_room,
            peer_id = %ctx.conn_id,
            role = ?role,
            "Peer joined room"
        );
        broadcast(
            room,
            BrokerMessage::PeerJoined {
                peer_id: ctx.conn_id,
                role,
            },
        );
    }

    // ── Relays ───────────────────────────────────────────────────────────

    /// Forward a peer-directed message, rewriting the envelope only. A
    /// missing target is silently dropped: these payloads are best-effort
    /// and ICE-level retries cover the gap.
    async fn relay(
        &self,
        ctx: &ConnectionCtx,
        target_peer_id: Uuid,
        build: impl FnOnce(Uuid) -> BrokerMessage,
    ) {
        let mut rooms = self.rooms.lock().await;
        let Some(room) = rooms.room_mut(&ctx.room_id) else {
            return;
        };
        match room.peer(target_peer_id) {
            Some(target) => {
                let _ = target.tx.send(build(ctx.conn_id));
            }
            None => {
                debug!(
                    event = "relay_target_missing",
                    room_id = %ctx.room_id,
                    target = %target_peer_id,
                    "Dropping relay to absent peer"
                );
            }
        }
    }

    async fn handle_transfer_status(
        &self,
        ctx: &ConnectionCtx,
        status: String,
        progress: f64,
        speed: f64,
    ) {
        let mut rooms = self.rooms.lock().await;
        let Some(room) = rooms.room_mut(&ctx.room_id) else {
            return;
        };
        for other in room.other_peers(ctx.conn_id) {
            let _ = other.tx.send(BrokerMessage::PeerStatus {
                from_peer_id: ctx.conn_id,
                status: status.clone(),
                progress,
                speed,
            });
        }
    }

    // ── Connection locks ─────────────────────────────────────────────────

    async fn handle_lock_connection(&self, ctx: &ConnectionCtx, peer_id: Uuid) {
        let mut rooms = self.rooms.lock().await;
        let Some(room) = rooms.room_mut(&ctx.room_id) else {
            ctx.reply_error(ErrorCode::LockNotFound);
            return;
        };
        match room.mint_lock(peer_id) {
            Some(lock) => {
                info!(
                    event = "connection_locked",
                    room_id = %ctx.room_id,
                    peer_id = %peer_id,
                    "Connection lock minted"
                );
                ctx.reply(BrokerMessage::ConnectionLocked {
                    lock_id: lock.lock_id,
                    expires_at: now_unix_millis() + LOCK_TTL.as_millis() as u64,
                });
            }
            None => {
                debug!(event = "lock_unknown_peer", peer_id = %peer_id, "Lock requested for unknown peer");
                ctx.reply_error(ErrorCode::LockNotFound);
            }
        }
    }

    async fn handle_reconnect_with_lock(&self, ctx: &ConnectionCtx, lock_id: &str) {
        let mut rooms = self.rooms.lock().await;
        let Some(room) = rooms.room_mut(&ctx.room_id) else {
            ctx.reply_error(ErrorCode::LockNotFound);
            return;
        };
        let lock = match room.consume_lock(lock_id) {
            Ok(lock) => lock,
            Err(LockFailure::NotFound) => {
                ctx.reply_error(ErrorCode::LockNotFound);
                return;
            }
            Err(LockFailure::Expired) => {
                debug!(event = "lock_expired", lock_id, "Reconnect with expired lock");
                ctx.reply_error(ErrorCode::LockExpired);
                return;
            }
        };

        let registered = room.register_peer(Peer {
            peer_id: ctx.conn_id,
            role: lock.role,
            tx: ctx.tx.clone(),
        });
        if let Err(e) = registered {
            self.reply_register_error(ctx, e);
            return;
        }

        info!(
            event = "peer_reconnected",
            room_id = %ctx.room_id,
            old_peer_id = %lock.peer_id,
            new_peer_id = %ctx.conn_id,
            role = ?lock.role,
            "Peer identity transplanted via lock"
        );
        broadcast(
            room,
            BrokerMessage::PeerJoined {
                peer_id: ctx.conn_id,
                role: lock.role,
            },
        );
    }

    fn reply_register_error(&self, ctx: &ConnectionCtx, err: RegisterError) {
        match err {
            RegisterError::Full => ctx.reply_error(ErrorCode::RoomFull),
            // No dedicated wire code for a role clash; the catch-all covers it.
            RegisterError::RoleTaken(role) => {
                warn!(event = "role_taken", role = ?role, "Role already claimed in room");
                ctx.reply_error(ErrorCode::InvalidCode);
            }
        }
    }
}

/// Broadcast to every registered peer in the room, the originator included.
fn broadcast(room: &Room, msg: BrokerMessage) {
    for peer in room.peers() {
        let _ = peer.tx.send(msg.clone());
    }
}

/// Decide how to answer a frame that did not parse as a [`ClientMessage`]:
/// valid JSON with a `type` gets the catch-all error, anything else is
/// dropped.
pub fn classify_parse_failure(text: &str) -> Option<ErrorCode> {
    match serde_json::from_str::<Value>(text) {
        Ok(value) if value.get("type").is_some() => Some(ErrorCode::InvalidCode),
        _ => None,
    }
}

/// Current unix time in milliseconds.
pub(crate) fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RATE_MAX_ATTEMPTS;
    use tokio::sync::mpsc;

    fn conn(room_id: &str) -> (ConnectionCtx, mpsc::UnboundedReceiver<BrokerMessage>) {
        conn_with_key(room_id, "1.2.3.4")
    }

    fn conn_with_key(
        room_id: &str,
        key: &str,
    ) -> (ConnectionCtx, mpsc::UnboundedReceiver<BrokerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ConnectionCtx {
                conn_id: Uuid::new_v4(),
                room_id: room_id.to_string(),
                client_key: key.to_string(),
                tx,
            },
            rx,
        )
    }

    fn recv(rx: &mut mpsc::UnboundedReceiver<BrokerMessage>) -> BrokerMessage {
        rx.try_recv().expect("expected a broker message")
    }

    /// Receiver generates a code; sender joins; both see `peer_joined`.
    #[tokio::test]
    async fn test_generate_and_join() {
        let broker = Broker::new();
        let (mut receiver, mut recv_rx) = conn("000042");
        let (mut sender, mut send_rx) = conn_with_key("000042", "5.6.7.8");

        broker.accept(&receiver).await.unwrap();
        broker
            .handle_message(&mut receiver, ClientMessage::GenerateCode)
            .await;
        let BrokerMessage::CodeGenerated { code, room_id, peer_id, .. } = recv(&mut recv_rx)
        else {
            panic!("expected code_generated");
        };
        assert_eq!(code, "000042");
        assert_eq!(room_id, "000042");
        assert_eq!(peer_id, receiver.conn_id);

        broker.accept(&sender).await.unwrap();
        broker
            .handle_message(
                &mut sender,
                ClientMessage::JoinRoom {
                    code: "000042".into(),
                    role: PeerRole::Sender,
                },
            )
            .await;

        // Broadcast reaches both peers, joiner included.
        let BrokerMessage::PeerJoined { peer_id, role } = recv(&mut recv_rx) else {
            panic!("expected peer_joined at receiver");
        };
        assert_eq!(peer_id, sender.conn_id);
        assert_eq!(role, PeerRole::Sender);
        assert!(matches!(recv(&mut send_rx), BrokerMessage::PeerJoined { .. }));
    }

    #[tokio::test]
    async fn test_join_with_unknown_code_fails() {
        let broker = Broker::new();
        let (mut sender, mut rx) = conn("999999");
        broker.accept(&sender).await.unwrap();
        broker
            .handle_message(
                &mut sender,
                ClientMessage::JoinRoom {
                    code: "999999".into(),
                    role: PeerRole::Sender,
                },
            )
            .await;
        assert!(matches!(
            recv(&mut rx),
            BrokerMessage::Error { code: ErrorCode::InvalidCode, .. }
        ));
    }

    /// Ten attempts pass the gate, the eleventh bounces.
    #[tokio::test]
    async fn test_rate_limit_eleventh_attempt() {
        let broker = Broker::new();
        let (mut sender, mut rx) = conn("999999");
        broker.accept(&sender).await.unwrap();

        for _ in 0..RATE_MAX_ATTEMPTS {
            broker
                .handle_message(
                    &mut sender,
                    ClientMessage::JoinRoom {
                        code: "999999".into(),
                        role: PeerRole::Sender,
                    },
                )
                .await;
            assert!(matches!(
                recv(&mut rx),
                BrokerMessage::Error { code: ErrorCode::InvalidCode, .. }
            ));
        }
        broker
            .handle_message(
                &mut sender,
                ClientMessage::JoinRoom {
                    code: "999999".into(),
                    role: PeerRole::Sender,
                },
            )
            .await;
        assert!(matches!(
            recv(&mut rx),
            BrokerMessage::Error { code: ErrorCode::RateLimited, .. }
        ));
    }

    /// Three invalid-code failures lock the key; a valid code then still
    /// answers RATE_LIMITED.
    #[tokio::test]
    async fn test_lockout_blocks_valid_code() {
        let broker = Broker::new();
        let (mut receiver, _recv_rx) = conn_with_key("000042", "9.9.9.9");
        broker.accept(&receiver).await.unwrap();
        broker
            .handle_message(&mut receiver, ClientMessage::GenerateCode)
            .await;

        let (mut sender, mut rx) = conn("000042");
        broker.accept(&sender).await.unwrap();
        for _ in 0..3 {
            broker
                .handle_message(
                    &mut sender,
                    ClientMessage::JoinRoom {
                        code: "123123".into(),
                        role: PeerRole::Sender,
                    },
                )
                .await;
            assert!(matches!(
                recv(&mut rx),
                BrokerMessage::Error { code: ErrorCode::InvalidCode, .. }
            ));
        }
        broker
            .handle_message(
                &mut sender,
                ClientMessage::JoinRoom {
                    code: "000042".into(),
                    role: PeerRole::Sender,
                },
            )
            .await;
        assert!(matches!(
            recv(&mut rx),
            BrokerMessage::Error { code: ErrorCode::RateLimited, .. }
        ));
    }

    #[tokio::test]
    async fn test_third_connection_refused() {
        let broker = Broker::new();
        let (a, _arx) = conn("123456");
        let (b, _brx) = conn("123456");
        let (c, _crx) = conn("123456");
        broker.accept(&a).await.unwrap();
        broker.accept(&b).await.unwrap();
        assert_eq!(broker.accept(&c).await, Err(ErrorCode::RoomFull));
    }

    #[tokio::test]
    async fn test_relay_rewrites_envelope_only() {
        let broker = Broker::new();
        let (mut receiver, mut recv_rx) = conn("000042");
        let (mut sender, mut send_rx) = conn_with_key("000042", "5.6.7.8");
        broker.accept(&receiver).await.unwrap();
        broker
            .handle_message(&mut receiver, ClientMessage::GenerateCode)
            .await;
        recv(&mut recv_rx);
        broker.accept(&sender).await.unwrap();
        broker
            .handle_message(
                &mut sender,
                ClientMessage::JoinRoom {
                    code: "000042".into(),
                    role: PeerRole::Sender,
                },
            )
            .await;
        recv(&mut recv_rx);
        recv(&mut send_rx);

        let body = serde_json::json!({"type": "offer", "sdp": "v=0\r\nopaque"});
        broker
            .handle_message(
                &mut receiver,
                ClientMessage::WebrtcOffer {
                    target_peer_id: sender.conn_id,
                    payload: body.clone(),
                },
            )
            .await;
        let BrokerMessage::WebrtcOffer { from_peer_id, payload } = recv(&mut send_rx) else {
            panic!("expected relayed offer");
        };
        assert_eq!(from_peer_id, receiver.conn_id);
        assert_eq!(payload, body);
    }

    #[tokio::test]
    async fn test_relay_to_absent_peer_is_dropped() {
        let broker = Broker::new();
        let (mut receiver, mut rx) = conn("000042");
        broker.accept(&receiver).await.unwrap();
        broker
            .handle_message(&mut receiver, ClientMessage::GenerateCode)
            .await;
        recv(&mut rx);

        broker
            .handle_message(
                &mut receiver,
                ClientMessage::IceCandidate {
                    target_peer_id: Uuid::new_v4(),
                    payload: serde_json::json!({"candidate": "x"}),
                },
            )
            .await;
        // No reply, no error.
        assert!(rx.try_recv().is_err());
    }

    /// Lock, reconnect with a new connection id, inherit the
    /// role; the lock is single-use.
    #[tokio::test]
    async fn test_reconnect_with_lock() {
        let broker = Broker::new();
        let (mut receiver, mut rx) = conn("000042");
        broker.accept(&receiver).await.unwrap();
        broker
            .handle_message(&mut receiver, ClientMessage::GenerateCode)
            .await;
        recv(&mut rx);

        let receiver_conn_id = receiver.conn_id;
        broker
            .handle_message(
                &mut receiver,
                ClientMessage::LockConnection {
                    peer_id: receiver_conn_id,
                },
            )
            .await;
        let BrokerMessage::ConnectionLocked { lock_id, expires_at } = recv(&mut rx) else {
            panic!("expected connection_locked");
        };
        assert!(expires_at > now_unix_millis());

        // Old transport goes away; the room must survive on the lock.
        broker.disconnect(&receiver).await;

        let (mut revenant, mut new_rx) = conn("000042");
        broker.accept(&revenant).await.unwrap();
        broker
            .handle_message(
                &mut revenant,
                ClientMessage::ReconnectWithLock {
                    lock_id: lock_id.clone(),
                },
            )
            .await;
        let BrokerMessage::PeerJoined { peer_id, role } = recv(&mut new_rx) else {
            panic!("expected peer_joined echo");
        };
        assert_eq!(peer_id, revenant.conn_id);
        assert_eq!(role, PeerRole::Receiver);

        // Single use.
        let (mut third, mut third_rx) = conn("000042");
        broker.accept(&third).await.unwrap();
        broker
            .handle_message(&mut third, ClientMessage::ReconnectWithLock { lock_id })
            .await;
        assert!(matches!(
            recv(&mut third_rx),
            BrokerMessage::Error { code: ErrorCode::LockNotFound, .. }
        ));
    }

    #[tokio::test]
    async fn test_disconnect_notifies_and_expires_code() {
        let broker = Broker::new();
        let (mut receiver, mut recv_rx) = conn("000042");
        let (mut sender, mut send_rx) = conn_with_key("000042", "5.6.7.8");
        broker.accept(&receiver).await.unwrap();
        broker
            .handle_message(&mut receiver, ClientMessage::GenerateCode)
            .await;
        recv(&mut recv_rx);
        broker.accept(&sender).await.unwrap();
        broker
            .handle_message(
                &mut sender,
                ClientMessage::JoinRoom {
                    code: "000042".into(),
                    role: PeerRole::Sender,
                },
            )
            .await;
        recv(&mut recv_rx);
        recv(&mut send_rx);

        broker.disconnect(&sender).await;
        assert!(matches!(
            recv(&mut recv_rx),
            BrokerMessage::PeerLeft { peer_id } if peer_id == sender.conn_id
        ));
        assert!(matches!(
            recv(&mut recv_rx),
            BrokerMessage::Error { code: ErrorCode::PeerDisconnected, .. }
        ));

        // Last peer out destroys the room and its code.
        broker.disconnect(&receiver).await;
        assert!(broker.rooms.lock().await.is_empty());
        assert!(!broker.codes.lock().await.validate("000042"));
    }

    #[tokio::test]
    async fn test_transfer_status_relayed() {
        let broker = Broker::new();
        let (mut receiver, mut recv_rx) = conn("000042");
        let (mut sender, mut send_rx) = conn_with_key("000042", "5.6.7.8");
        broker.accept(&receiver).await.unwrap();
        broker
            .handle_message(&mut receiver, ClientMessage::GenerateCode)
            .await;
        recv(&mut recv_rx);
        broker.accept(&sender).await.unwrap();
        broker
            .handle_message(
                &mut sender,
                ClientMessage::JoinRoom {
                    code: "000042".into(),
                    role: PeerRole::Sender,
                },
            )
            .await;
        recv(&mut recv_rx);
        recv(&mut send_rx);

        broker
            .handle_message(
                &mut sender,
                ClientMessage::TransferStatus {
                    status: "transferring".into(),
                    progress: 0.5,
                    speed: 1024.0,
                },
            )
            .await;
        let BrokerMessage::PeerStatus { from_peer_id, status, progress, .. } =
            recv(&mut recv_rx)
        else {
            panic!("expected peer_status");
        };
        assert_eq!(from_peer_id, sender.conn_id);
        assert_eq!(status, "transferring");
        assert!((progress - 0.5).abs() < f64::EPSILON);
        // Not echoed back to the originator.
        assert!(send_rx.try_recv().is_err());
    }

    #[test]
    fn test_classify_parse_failure() {
        assert_eq!(
            classify_parse_failure(r#"{"type":"make_coffee"}"#),
            Some(ErrorCode::InvalidCode)
        );
        assert_eq!(classify_parse_failure("not json at all"), None);
        assert_eq!(classify_parse_failure(r#"{"no_type": 1}"#), None);
    }
}

//! Rooms, peers, and connection locks.
//!
//! A room is the broker-side pairing context for one transfer: at most two
//! peers whose roles must differ, plus any outstanding connection locks.
//! Rooms are created implicitly by the first connection and removed when
//! the last peer leaves, unless an unexpired lock is still waiting to be
//! consumed, in which case the room survives until the lock is used or runs
//! out.

use crate::core::config::{LOCK_TTL, ROOM_CAPACITY};
use crate::core::protocol::signaling::{BrokerMessage, PeerRole};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// One registered end of a transfer pairing. The outbound channel is the
/// connection's writer task; the room holds it only to address messages.
#[derive(Debug, Clone)]
pub struct Peer {
    pub peer_id: Uuid,
    pub role: PeerRole,
    pub tx: mpsc::UnboundedSender<BrokerMessage>,
}

/// Single-use token letting a fresh connection inherit `peer_id`'s place in
/// the room. Holds the role by value: the original peer is usually gone by
/// the time the lock is consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionLock {
    pub lock_id: String,
    pub peer_id: Uuid,
    pub role: PeerRole,
    pub expires_at: Instant,
}

/// Outcome of trying to consume a lock.
#[derive(Debug, PartialEq, Eq)]
pub enum LockFailure {
    NotFound,
    Expired,
}

/// Broker-side state for one room.
#[derive(Debug)]
pub struct Room {
    pub room_id: String,
    peers: HashMap<Uuid, Peer>,
    locks: HashMap<String, ConnectionLock>,
    /// Transport connections currently attached, registered as peers or not.
    connections: HashSet<Uuid>,
}

impl Room {
    pub fn new(room_id: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            peers: HashMap::new(),
            locks: HashMap::new(),
            connections: HashSet::new(),
        }
    }

    // ── Connections ──────────────────────────────────────────────────────

    /// Attach a transport connection. `false` means the room is full and
    /// the connection must be refused.
    pub fn attach(&mut self, conn_id: Uuid) -> bool {
        if self.connections.len() >= ROOM_CAPACITY && !self.connections.contains(&conn_id) {
            return false;
        }
        self.connections.insert(conn_id);
        true
    }

    /// Detach a connection, dropping its peer registration if any.
    pub fn detach(&mut self, conn_id: Uuid) -> Option<Peer> {
        self.connections.remove(&conn_id);
        self.peers.remove(&conn_id)
    }

    // ── Peers ────────────────────────────────────────────────────────────

    /// Register a peer on an attached connection. Fails when the room
    /// already holds two peers, or another peer already claimed the role.
    pub fn register_peer(&mut self, peer: Peer) -> Result<(), RegisterError> {
        if self.peers.len() >= ROOM_CAPACITY && !self.peers.contains_key(&peer.peer_id) {
            return Err(RegisterError::Full);
        }
        if self
            .peers
            .values()
            .any(|p| p.peer_id != peer.peer_id && p.role == peer.role)
        {
            return Err(RegisterError::RoleTaken(peer.role));
        }
        debug!(
            event = "peer_registered",
            room_id = %self.room_id,
            peer_id = %peer.peer_id,
            role = ?peer.role,
            "Peer registered in room"
        );
        self.peers.insert(peer.peer_id, peer);
        Ok(())
    }

    pub fn peer(&self, peer_id: Uuid) -> Option<&Peer> {
        self.peers.get(&peer_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Every registered peer except `peer_id`.
    pub fn other_peers(&self, peer_id: Uuid) -> impl Iterator<Item = &Peer> {
        self.peers.values().filter(move |p| p.peer_id != peer_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    // ── Locks ────────────────────────────────────────────────────────────

    /// Mint a single-use lock for a registered peer.
    pub fn mint_lock(&mut self, peer_id: Uuid) -> Option<ConnectionLock> {
        self.mint_lock_at(peer_id, Instant::now())
    }

    pub(crate) fn mint_lock_at(&mut self, peer_id: Uuid, now: Instant) -> Option<ConnectionLock> {
        let role = self.peers.get(&peer_id)?.role;
        let lock = ConnectionLock {
            lock_id: Uuid::new_v4().to_string(),
            peer_id,
            role,
            expires_at: now + LOCK_TTL,
        };
        self.locks.insert(lock.lock_id.clone(), lock.clone());
        Some(lock)
    }

    /// Consume a lock: removed on success *and* on expiry.
    pub fn consume_lock(&mut self, lock_id: &str) -> Result<ConnectionLock, LockFailure> {
        self.consume_lock_at(lock_id, Instant::now())
    }

    pub(crate) fn consume_lock_at(
        &mut self,
        lock_id: &str,
        now: Instant,
    ) -> Result<ConnectionLock, LockFailure> {
        let Some(lock) = self.locks.remove(lock_id) else {
            return Err(LockFailure::NotFound);
        };
        if now >= lock.expires_at {
            return Err(LockFailure::Expired);
        }
        Ok(lock)
    }

    /// Whether any lock is still within its TTL; expired ones are pruned.
    pub fn has_live_locks(&mut self) -> bool {
        self.has_live_locks_at(Instant::now())
    }

    pub(crate) fn has_live_locks_at(&mut self, now: Instant) -> bool {
        self.locks.retain(|_, l| now < l.expires_at);
        !self.locks.is_empty()
    }

    /// A room is dead once nothing is attached and no peer is registered.
    pub fn is_idle(&self) -> bool {
        self.connections.is_empty() && self.peers.is_empty()
    }
}

/// Why a peer registration was refused.
#[derive(Debug, PartialEq, Eq)]
pub enum RegisterError {
    Full,
    RoleTaken(PeerRole),
}

/// Process-wide map of live rooms.
#[derive(Debug, Default)]
pub struct RoomManager {
    rooms: HashMap<String, Room>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a room, creating it implicitly (first connect).
    pub fn room_entry(&mut self, room_id: &str) -> &mut Room {
        self.rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Room::new(room_id))
    }

    pub fn room_mut(&mut self, room_id: &str) -> Option<&mut Room> {
        self.rooms.get_mut(room_id)
    }

    pub fn remove(&mut self, room_id: &str) -> Option<Room> {
        self.rooms.remove(room_id)
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn peer(role: PeerRole) -> (Peer, mpsc::UnboundedReceiver<BrokerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Peer {
                peer_id: Uuid::new_v4(),
                role,
                tx,
            },
            rx,
        )
    }

    #[test]
    fn test_capacity_two_connections() {
        let mut room = Room::new("000042");
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        assert!(room.attach(a));
        assert!(room.attach(b));
        assert!(!room.attach(c));
        // Re-attaching an existing connection is not a third connect.
        assert!(room.attach(a));

        room.detach(a);
        assert!(room.attach(c));
    }

    #[test]
    fn test_roles_must_differ() {
        let mut room = Room::new("000042");
        let (recv, _rx1) = peer(PeerRole::Receiver);
        let (send, _rx2) = peer(PeerRole::Sender);
        let (recv2, _rx3) = peer(PeerRole::Receiver);

        room.register_peer(recv).unwrap();
        assert_eq!(
            room.register_peer(recv2),
            Err(RegisterError::RoleTaken(PeerRole::Receiver))
        );
        room.register_peer(send).unwrap();
        assert_eq!(room.peer_count(), 2);

        let (extra, _rx4) = peer(PeerRole::Sender);
        assert_eq!(room.register_peer(extra), Err(RegisterError::Full));
    }

    #[test]
    fn test_lock_single_use() {
        let mut room = Room::new("000042");
        let (recv, _rx) = peer(PeerRole::Receiver);
        let peer_id = recv.peer_id;
        room.register_peer(recv).unwrap();

        let now = Instant::now();
        let lock = room.mint_lock_at(peer_id, now).unwrap();
        assert_eq!(lock.role, PeerRole::Receiver);

        let consumed = room.consume_lock_at(&lock.lock_id, now).unwrap();
        assert_eq!(consumed.peer_id, peer_id);
        // Second use: gone.
        assert_eq!(
            room.consume_lock_at(&lock.lock_id, now),
            Err(LockFailure::NotFound)
        );
    }

    #[test]
    fn test_lock_expiry() {
        let mut room = Room::new("000042");
        let (recv, _rx) = peer(PeerRole::Receiver);
        let peer_id = recv.peer_id;
        room.register_peer(recv).unwrap();

        let now = Instant::now();
        let lock = room.mint_lock_at(peer_id, now).unwrap();

        let late = now + LOCK_TTL + Duration::from_secs(1);
        assert_eq!(
            room.consume_lock_at(&lock.lock_id, late),
            Err(LockFailure::Expired)
        );
        // Expiry consumed it too.
        assert_eq!(
            room.consume_lock_at(&lock.lock_id, now),
            Err(LockFailure::NotFound)
        );
    }

    #[test]
    fn test_lock_survives_peer_departure() {
        let mut room = Room::new("000042");
        let (recv, _rx) = peer(PeerRole::Receiver);
        let peer_id = recv.peer_id;
        room.attach(peer_id);
        room.register_peer(recv).unwrap();

        let now = Instant::now();
        let lock = room.mint_lock_at(peer_id, now).unwrap();
        room.detach(peer_id);

        assert!(room.is_idle());
        assert!(room.has_live_locks_at(now));
        // The role transplants even though the peer is gone.
        let consumed = room.consume_lock_at(&lock.lock_id, now).unwrap();
        assert_eq!(consumed.role, PeerRole::Receiver);
    }

    #[test]
    fn test_mint_lock_requires_peer() {
        let mut room = Room::new("000042");
        assert!(room.mint_lock(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_room_manager_implicit_create() {
        let mut mgr = RoomManager::new();
        assert!(mgr.is_empty());
        mgr.room_entry("000042").attach(Uuid::new_v4());
        assert_eq!(mgr.len(), 1);
        assert!(mgr.room_mut("000042").is_some());
        mgr.remove("000042");
        assert!(mgr.is_empty());
    }
}

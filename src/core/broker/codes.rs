//! Rendezvous code registry.
//!
//! Codes are fixed-length decimal strings with significant leading zeros.
//! Each live code maps to exactly one room and the receiver peer that
//! registered it. Entries expire after [`CODE_TTL`] and are evicted lazily
//! on validation and during generation sweeps.

use crate::core::config::{CODE_GENERATION_RETRIES, CODE_LENGTH, CODE_TTL};
use rand::Rng;
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Registry failures surfaced to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CodeError {
    /// Every draw collided with a live code, twice over.
    #[error("code space exhausted")]
    CapacityExhausted,
}

#[derive(Debug, Clone)]
struct CodeEntry {
    room_id: String,
    receiver_peer_id: Uuid,
    created_at: Instant,
}

/// Process-wide table of live rendezvous codes.
#[derive(Debug, Default)]
pub struct CodeRegistry {
    codes: HashMap<String, CodeEntry>,
}

impl CodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `code` has rendezvous shape: exactly [`CODE_LENGTH`] decimal
    /// digits.
    pub fn is_valid_format(code: &str) -> bool {
        code.len() == CODE_LENGTH && code.bytes().all(|b| b.is_ascii_digit())
    }

    /// Register `code` for a room. Replaces any previous registration of the
    /// same code (refreshing its TTL).
    pub fn register(&mut self, code: &str, room_id: &str, receiver_peer_id: Uuid) {
        self.register_at(code, room_id, receiver_peer_id, Instant::now());
    }

    pub(crate) fn register_at(
        &mut self,
        code: &str,
        room_id: &str,
        receiver_peer_id: Uuid,
        now: Instant,
    ) {
        self.codes.insert(
            code.to_string(),
            CodeEntry {
                room_id: room_id.to_string(),
                receiver_peer_id,
                created_at: now,
            },
        );
    }

    /// True iff `code` is registered and inside its TTL. Expired entries are
    /// evicted as a side effect.
    pub fn validate(&mut self, code: &str) -> bool {
        self.validate_at(code, Instant::now())
    }

    pub(crate) fn validate_at(&mut self, code: &str, now: Instant) -> bool {
        match self.codes.get(code) {
            Some(entry) if now.duration_since(entry.created_at) <= CODE_TTL => true,
            Some(_) => {
                debug!(event = "code_expired", code, "Evicting expired code");
                self.codes.remove(code);
                false
            }
            None => false,
        }
    }

    /// The room a live code points at.
    pub fn room_of(&self, code: &str) -> Option<&str> {
        self.codes.get(code).map(|e| e.room_id.as_str())
    }

    /// The receiver peer that registered a live code.
    pub fn receiver_of(&self, code: &str) -> Option<Uuid> {
        self.codes.get(code).map(|e| e.receiver_peer_id)
    }

    /// Drop a code regardless of TTL.
    pub fn expire(&mut self, code: &str) {
        self.codes.remove(code);
    }

    /// Drop every code registered against `room_id` (room teardown).
    pub fn expire_room(&mut self, room_id: &str) {
        self.codes.retain(|_, e| e.room_id != room_id);
    }

    /// Draw a fresh unused code: up to [`CODE_GENERATION_RETRIES`] uniform
    /// draws avoiding registered codes, then one sweep of expired entries
    /// and another round of draws.
    pub fn generate_unused(&mut self) -> Result<String, CodeError> {
        self.generate_unused_at(Instant::now())
    }

    pub(crate) fn generate_unused_at(&mut self, now: Instant) -> Result<String, CodeError> {
        for _ in 0..CODE_GENERATION_RETRIES {
            let code = draw_code();
            if !self.codes.contains_key(&code) {
                return Ok(code);
            }
        }
        self.sweep_expired_at(now);
        for _ in 0..CODE_GENERATION_RETRIES {
            let code = draw_code();
            if !self.codes.contains_key(&code) {
                return Ok(code);
            }
        }
        Err(CodeError::CapacityExhausted)
    }

    fn sweep_expired_at(&mut self, now: Instant) {
        self.codes
            .retain(|_, e| now.duration_since(e.created_at) <= CODE_TTL);
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

/// Uniform draw over the whole code space, zero-padded.
fn draw_code() -> String {
    let space = 10u32.pow(CODE_LENGTH as u32);
    let x = rand::thread_rng().gen_range(0..space);
    format!("{:0width$}", x, width = CODE_LENGTH)
}

//! Abuse control: per-client rate limiting and failed-attempt lockout.
//!
//! Two independent tables, both keyed by a client-identifying string (source
//! IP in production, any stable key in tests):
//!
//! - rate limit: fixed window of [`RATE_WINDOW`], at most
//!   [`RATE_MAX_ATTEMPTS`] join attempts per window;
//! - lockout: [`LOCKOUT_THRESHOLD`] *consecutive* validation failures lock
//!   the key for [`LOCKOUT_DURATION`]. Any success clears the record.
//!
//! Gate order at `join_room`: `is_locked` → `check_rate` → `record_attempt`
//! → code validation → `record_failure` / `record_success`.

use crate::core::config::{
    LOCKOUT_DURATION, LOCKOUT_THRESHOLD, RATE_MAX_ATTEMPTS, RATE_WINDOW,
};
use std::collections::HashMap;
use std::time::Instant;
use tracing::warn;

#[derive(Debug)]
struct RateBucket {
    window_start: Instant,
    attempts: u32,
}

#[derive(Debug)]
struct LockoutRecord {
    failures: u32,
    locked_until: Option<Instant>,
}

/// Process-wide rate-limit and lockout tables.
#[derive(Debug, Default)]
pub struct AbuseControl {
    rates: HashMap<String, RateBucket>,
    lockouts: HashMap<String, LockoutRecord>,
}

impl AbuseControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` may attempt a join in the current window. Rolls the
    /// window when it has elapsed.
    pub fn check_rate(&mut self, key: &str) -> bool {
        self.check_rate_at(key, Instant::now())
    }

    pub(crate) fn check_rate_at(&mut self, key: &str, now: Instant) -> bool {
        match self.rates.get_mut(key) {
            Some(bucket) => {
                if now.duration_since(bucket.window_start) >= RATE_WINDOW {
                    bucket.window_start = now;
                    bucket.attempts = 0;
                }
                bucket.attempts < RATE_MAX_ATTEMPTS
            }
            None => true,
        }
    }

    /// Count one join attempt against `key`.
    pub fn record_attempt(&mut self, key: &str) {
        self.record_attempt_at(key, Instant::now());
    }

    pub(crate) fn record_attempt_at(&mut self, key: &str, now: Instant) {
        let bucket = self.rates.entry(key.to_string()).or_insert(RateBucket {
            window_start: now,
            attempts: 0,
        });
        if now.duration_since(bucket.window_start) >= RATE_WINDOW {
            bucket.window_start = now;
            bucket.attempts = 0;
        }
        bucket.attempts += 1;
    }

    /// Count a consecutive validation failure; crossing the threshold locks
    /// the key.
    pub fn record_failure(&mut self, key: &str) {
        self.record_failure_at(key, Instant::now());
    }

    pub(crate) fn record_failure_at(&mut self, key: &str, now: Instant) {
        let record = self
            .lockouts
            .entry(key.to_string())
            .or_insert(LockoutRecord {
                failures: 0,
                locked_until: None,
            });
        record.failures += 1;
        if record.failures >= LOCKOUT_THRESHOLD {
            record.locked_until = Some(now + LOCKOUT_DURATION);
            warn!(
                event = "client_locked_out",
                key,
                failures = record.failures,
                "Client key locked out after consecutive failures"
            );
        }
    }

    /// A successful validation clears the lockout record entirely.
    pub fn record_success(&mut self, key: &str) {
        self.lockouts.remove(key);
    }

    /// Whether `key` is currently locked out. A lock that has run out is
    /// dropped, so the failure streak restarts from zero.
    pub fn is_locked(&mut self, key: &str) -> bool {
        self.is_locked_at(key, Instant::now())
    }

    pub(crate) fn is_locked_at(&mut self, key: &str, now: Instant) -> bool {
        let Some(record) = self.lockouts.get(key) else {
            return false;
        };
        match record.locked_until {
            Some(until) if now < until => true,
            Some(_) => {
                self.lockouts.remove(key);
                false
            }
            None => false,
        }
    }
}

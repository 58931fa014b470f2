//! Centralized configuration constants for fluxdrop.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format constants (chunk header layout, message
//! discriminators) stay in their respective modules.

use std::time::Duration;

// ── Rendezvous codes ─────────────────────────────────────────────────────────

/// Number of decimal digits in a rendezvous code. Codes are zero-padded to
/// this length; leading zeros are significant.
pub const CODE_LENGTH: usize = 6;

/// How long a registered code stays valid.
pub const CODE_TTL: Duration = Duration::from_secs(300);

/// Attempts to draw an unused code before sweeping expired entries; the
/// sweep is followed by one more round of the same size.
pub const CODE_GENERATION_RETRIES: usize = 100;

// ── Abuse control ────────────────────────────────────────────────────────────

/// Fixed rate-limit window per client key.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Maximum join attempts per client key within [`RATE_WINDOW`].
pub const RATE_MAX_ATTEMPTS: u32 = 10;

/// Consecutive validation failures before a client key is locked out.
pub const LOCKOUT_THRESHOLD: u32 = 3;

/// How long a locked-out client key stays refused.
pub const LOCKOUT_DURATION: Duration = Duration::from_secs(300);

// ── Rooms / locks ────────────────────────────────────────────────────────────

/// Maximum peers (and transport connections) per room.
pub const ROOM_CAPACITY: usize = 2;

/// Lifetime of a connection lock minted by `lock_connection`.
pub const LOCK_TTL: Duration = Duration::from_secs(300);

// ── Transfer / chunking ──────────────────────────────────────────────────────

/// Default chunk size in bytes (pre-compression).
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Length of the binary chunk header: index (u32 LE) + size (u32 LE).
pub const CHUNK_HEADER_LEN: usize = 8;

/// Files smaller than this are not worth compressing.
pub const COMPRESS_MIN_SIZE: u64 = 10 * 1024;

/// Files larger than this skip compression to keep per-chunk CPU cost flat.
pub const COMPRESS_MAX_SIZE: u64 = 100 * 1024 * 1024;

/// Cooperative pause between chunk sends so the event loop stays responsive.
pub const CHUNK_SEND_YIELD: Duration = Duration::from_millis(1);

/// Settle delay between a `file_metadata` message and the first chunk.
pub const METADATA_DEBOUNCE: Duration = Duration::from_millis(100);

/// Emit a `transfer_status` update at most once per this many chunks.
pub const STATUS_REPORT_CHUNK_INTERVAL: u32 = 64;

// ── Data channel ─────────────────────────────────────────────────────────────

/// Label of the single ordered, reliable data channel.
pub const DATA_CHANNEL_LABEL: &str = "flux-transfer";

/// Maximum size of a single datagram accepted by the transport adapter.
pub const MAX_DATAGRAM_SIZE: usize = 16 * 1024 * 1024;

/// High water mark for the data channel send buffer (bytes). Chunk sends
/// pause while `buffered_amount` is above this value.
pub const DC_BUFFERED_AMOUNT_HIGH: usize = 4 * 1024 * 1024;

/// Poll interval while waiting for the send buffer to drain.
pub const DC_BUFFER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Give up waiting for the send buffer to drain after this long.
pub const DC_BUFFER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for ICE candidate gathering in non-trickle mode.
pub const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(15);

// ── Signaling client ─────────────────────────────────────────────────────────

/// Maximum reconnect attempts after the signaling socket drops.
pub const SIGNALING_RECONNECT_MAX_RETRIES: u32 = 3;

/// Delays between signaling reconnect attempts (exponential, capped).
pub const SIGNALING_RECONNECT_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Upper bound on any signaling reconnect delay.
pub const SIGNALING_RECONNECT_CAP: Duration = Duration::from_secs(10);

// ── Broker defaults ──────────────────────────────────────────────────────────

/// Default listen host when `FLUXDROP_HOST` is unset.
pub const DEFAULT_BROKER_HOST: &str = "127.0.0.1";

/// Default listen port when `FLUXDROP_PORT` is unset.
pub const DEFAULT_BROKER_PORT: u16 = 8765;

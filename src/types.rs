//! Protocol constants and core identifier types.
//!
//! All collections and transfers carried by the announcement protocol have
//! explicit size limits; an announcement peer cannot exhaust memory by
//! sending large or many noderefs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Opaque peer identity. Assigned by the peer database, unique per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Session identifier demultiplexing all transport messages of one
/// announcement. Random per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uid(pub u64);

impl Uid {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Hops-to-live. Bounded above by `AnnounceConfig::max_htl`.
pub type Htl = u16;

// =============================================================================
// TIMEOUTS
// =============================================================================

/// Admission handshake timeout. The next hop must answer the request
/// header within this window or the session backtracks.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Body-stage timeout. Covers the downstream node's own routing work, so
/// it is long; expiring with no message at all is fatal for the session.
pub const BODY_TIMEOUT: Duration = Duration::from_millis(240_000);

/// Absolute reply-drain window, measured from when the drain filter is
/// armed, not per message.
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(30_000);

/// NoderefRejected can only meaningfully arrive while the body upload is
/// in flight, so its filter alternative expires early.
pub const REJECT_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Window for a single noderef bulk transfer to drain.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_millis(60_000);

// =============================================================================
// SIZE LIMITS
// =============================================================================

/// Maximum serialized noderef (64 KB). A reference is a compact signed
/// descriptor; anything bigger is rejected before parsing.
pub const MAX_NODEREF_SIZE: usize = 64 * 1024;

/// Noderef blobs and encrypted bucket files pad to this block size.
pub const PAD_BLOCK: usize = 1024;

/// Bulk-transfer chunk payload size. One chunk per pad block keeps the
/// reassembly index arithmetic trivial.
pub const REF_CHUNK_SIZE: usize = PAD_BLOCK;

/// Upper bound on chunks per transfer, derived from the noderef cap.
pub const MAX_REF_CHUNKS: usize = MAX_NODEREF_SIZE / REF_CHUNK_SIZE + 1;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Announcement engine configuration. Defaults hold the protocol values;
/// tests shrink the timeouts.
#[derive(Debug, Clone)]
pub struct AnnounceConfig {
    /// Process-wide HTL ceiling.
    pub max_htl: Htl,
    /// Admission handshake window.
    pub accept_timeout: Duration,
    /// Body-stage window.
    pub body_timeout: Duration,
    /// Absolute drain window.
    pub drain_timeout: Duration,
    /// Early expiry for the NoderefRejected filter alternative.
    pub reject_timeout: Duration,
    /// Per-transfer drain window.
    pub transfer_timeout: Duration,
    /// Probability of actually decrementing when htl == max_htl. Below the
    /// ceiling the decrement is deterministic.
    pub decrement_at_max_probability: f64,
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        Self {
            max_htl: 10,
            accept_timeout: ACCEPT_TIMEOUT,
            body_timeout: BODY_TIMEOUT,
            drain_timeout: DRAIN_TIMEOUT,
            reject_timeout: REJECT_TIMEOUT,
            transfer_timeout: TRANSFER_TIMEOUT,
            decrement_at_max_probability: 0.5,
        }
    }
}

/// TempBucket pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Largest buffer eligible for RAM backing.
    pub max_ram_bucket_size: u64,
    /// Total RAM budget across live RAM-backed buckets.
    pub max_ram_used: u64,
    /// Wrap file-backed buckets in the padded encrypted layer.
    pub really_encrypt: bool,
    /// RAM-backed buckets older than this are swept to disk.
    pub max_age: Duration,
    /// A write growing a RAM bucket past `max_ram_bucket_size ×
    /// conversion_factor` migrates it synchronously.
    pub conversion_factor: u64,
    /// Directory for file-backed buckets.
    pub dir: std::path::PathBuf,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_ram_bucket_size: 256 * 1024,
            max_ram_used: 8 * 1024 * 1024,
            really_encrypt: false,
            max_age: Duration::from_secs(5 * 60),
            conversion_factor: 4,
            dir: std::env::temp_dir(),
        }
    }
}

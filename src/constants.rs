//! Application-wide constants for crossbar.
//!
//! This module centralizes protocol timing and sizing constants so the
//! broker, endpoints, and tests agree on one set of numbers.
//!
//! # Categories
//!
//! - **Heartbeating**: broker/worker liveness timing
//! - **Requests**: pending-request defaults
//! - **Cluster**: peer failure detection
//! - **Transport**: wire-level limits

use std::time::Duration;

// ============================================================================
// Heartbeating
// ============================================================================

/// Interval at which the broker and workers emit heartbeats.
///
/// Also bounds the broker's receive wait, so a silent socket still wakes
/// the dispatch loop often enough to purge dead workers on time.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2500);

/// Missed heartbeat intervals after which a peer is presumed dead.
pub const HEARTBEAT_LIVENESS: u32 = 3;

/// Liveness window: `HEARTBEAT_INTERVAL * HEARTBEAT_LIVENESS`.
///
/// A worker whose last sign of life is older than this is evicted.
pub const HEARTBEAT_EXPIRY: Duration =
    Duration::from_millis(2500 * HEARTBEAT_LIVENESS as u64);

/// Delay before a worker endpoint reconnects after liveness exhaustion.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(2500);

// ============================================================================
// Requests
// ============================================================================

/// Default time-to-live for a pending request.
pub const REQUEST_TTL: Duration = Duration::from_secs(5 * 60);

/// Default retry budget for a pending request.
pub const REQUEST_MAX_RETRIES: u32 = 3;

/// Interval between pending-request store cleanup passes.
pub const REQUEST_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Default client-side receive timeout.
pub const CLIENT_TIMEOUT: Duration = Duration::from_millis(2500);

// ============================================================================
// Cluster
// ============================================================================

/// Interval between cluster failure-detector passes.
pub const FAILURE_DETECT_INTERVAL: Duration = Duration::from_secs(30);

/// Silence threshold after which a non-local peer broker is marked failed.
pub const FAILURE_THRESHOLD: Duration = Duration::from_secs(60);

// ============================================================================
// Transport
// ============================================================================

/// Maximum encoded size of one logical message (all frames included).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

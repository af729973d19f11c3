//! Protocol and timing constants for notebook-sync.
//!
//! Centralizes the magic numbers used by the session task and the default
//! [`SessionConfig`](crate::config::SessionConfig). Constants are grouped
//! by domain with documentation explaining their purpose.
//!
//! # Categories
//!
//! - **Timeouts**: Request, handshake, and HTTP deadlines
//! - **Liveness**: Heartbeat and stale-connection detection
//! - **Reconnect**: Backoff schedule and retry budget
//! - **Protocol**: Channel names and client identification

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// Default deadline for a single correlated request.
///
/// Covers the round trip of a `*_request` frame and its `*_reply`. Delta
/// requests also wait for the broadcast delta to be applied within this
/// window.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for each handshake phase (connect, authenticate, subscribe).
///
/// A phase that does not complete in time is treated like a dropped
/// connection and retried with backoff.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client request timeout for snapshot fetches.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Liveness
// ============================================================================

/// Interval between `ping_request` heartbeats while the session is ready.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Silence after which a connection is considered dead.
///
/// Any inbound frame (including heartbeat replies) resets the clock. Must be
/// larger than [`PING_INTERVAL`] or a healthy idle connection would be torn
/// down between heartbeats.
pub const STALE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(75);

// ============================================================================
// Reconnect
// ============================================================================

/// First reconnect delay in milliseconds.
pub const INITIAL_BACKOFF_MS: u64 = 1_000;

/// Upper bound for a single reconnect delay in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Maximum random jitter added to each reconnect delay, in milliseconds.
pub const BACKOFF_JITTER_MS: u64 = 1_000;

/// Consecutive failed connection attempts before the session gives up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Snapshot rebuilds tried in a row before the connection is recycled.
///
/// Covers a server whose backlog keeps failing to apply on top of a fresh
/// snapshot.
pub const MAX_RESYNC_ATTEMPTS: u32 = 3;

// ============================================================================
// Protocol
// ============================================================================

/// Channel carrying authentication and heartbeat traffic.
pub const SYSTEM_CHANNEL: &str = "system";

/// Client type reported in `authenticate_request`.
pub const DEFAULT_CLIENT_TYPE: &str = "notebook-sync";

/// Placeholder `resource_id` for deltas that do not target a cell.
pub const NULL_RESOURCE_SENTINEL: &str = "__NULL_RESOURCE__";

/// Database connection assigned to new query cells.
pub const DEFAULT_DB_CONNECTION: &str = "@noteable";

/// Prefix of the generated result variable for new query cells.
pub const QUERY_RESULT_PREFIX: &str = "df_";

/// Default API base URL.
pub const DEFAULT_API_URL: &str = "https://app.noteable.io/gate/api";

//! Errors surfaced to the application by a [`Session`](super::Session).

/// Session failure taxonomy.
///
/// Cloneable so one failure can resolve every outstanding waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The server rejected the credentials. Terminal, never retried.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The connection dropped while the operation was in flight.
    #[error("connection lost")]
    ConnectionLost,

    /// No reply within the request deadline.
    #[error("request timed out")]
    Timeout,

    /// The session is not ready to send.
    #[error("not connected")]
    NotConnected,

    /// The session was closed by the application.
    #[error("session closed before the operation completed")]
    Cancelled,

    /// The session has already been closed.
    #[error("session is closed")]
    Closed,

    /// Reconnect attempts exceeded the configured budget. Terminal.
    #[error("gave up reconnecting after {attempts} attempts")]
    RetryBudgetExhausted {
        /// Consecutive failed attempts.
        attempts: u32,
    },

    /// A frame could not be decoded.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The server answered a request with an error event or `success: false`.
    #[error("request rejected ({kind}): {message}")]
    Rejected {
        /// Wire name of the error event, or of the reply that carried `success: false`.
        kind: String,
        /// Server-provided detail.
        message: String,
    },

    /// The operation does not make sense for the current cell or session.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// No cell with this id in the document.
    #[error("cell {0} not found")]
    CellNotFound(String),

    /// The cell was deleted before the operation completed.
    #[error("cell {0} was deleted")]
    CellDeleted(String),

    /// The snapshot collaborator failed.
    #[error("snapshot fetch failed: {0}")]
    Snapshot(String),

    /// Configuration is incomplete or inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SessionError {
    /// Whether the session can never recover from this error.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed(_) | Self::RetryBudgetExhausted { .. } | Self::InvalidConfig(_)
        )
    }
}

//! Per-connection authentication handshake.
//!
//! ```text
//! Connecting ──start()──▶ AuthPending ──authenticate_reply(success)──▶ Authenticated
//!                              │
//!                              └──success:false / permission_denied──▶ AuthFailed
//! ```
//!
//! The authenticator only tracks state; the session task owns the socket,
//! sends the frame it builds, and feeds it every inbound frame until it
//! settles. A missing reply is the caller's timeout to enforce.

use serde_json::Value;
use uuid::Uuid;

use super::error::SessionError;
use super::messages::{Event, Inbound, Request, RtuErrorKind};

/// Handshake state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// Transport up, nothing sent yet.
    Connecting,
    /// `authenticate_request` sent.
    AuthPending {
        /// Transaction id of the request.
        transaction_id: Uuid,
    },
    /// Server accepted the token.
    Authenticated,
    /// Server rejected the token.
    AuthFailed(String),
}

/// Result of feeding one frame to [`Authenticator::on_inbound`].
#[derive(Debug, Clone, PartialEq)]
pub enum AuthProgress {
    /// Frame was not the auth reply; still waiting.
    Pending,
    /// Handshake complete.
    Authenticated {
        /// User record from the reply, if any.
        user: Option<Value>,
    },
    /// Credentials rejected. Terminal.
    Failed(SessionError),
}

/// Runs one authentication handshake.
#[derive(Debug)]
pub struct Authenticator {
    token: String,
    client_type: String,
    state: AuthState,
}

impl Authenticator {
    /// Authenticator for one connection attempt.
    pub fn new(token: impl Into<String>, client_type: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            client_type: client_type.into(),
            state: AuthState::Connecting,
        }
    }

    /// Current state.
    pub fn state(&self) -> &AuthState {
        &self.state
    }

    /// Build the request and move to `AuthPending`.
    pub fn start(&mut self) -> (Uuid, Request) {
        let transaction_id = Uuid::new_v4();
        self.state = AuthState::AuthPending { transaction_id };
        (
            transaction_id,
            Request::Authenticate {
                token: self.token.clone(),
                client_type: self.client_type.clone(),
            },
        )
    }

    /// Feed an inbound frame.
    pub fn on_inbound(&mut self, inbound: &Inbound) -> AuthProgress {
        let AuthState::AuthPending { transaction_id } = self.state else {
            return AuthProgress::Pending;
        };
        if inbound.transaction_id != Some(transaction_id) {
            return AuthProgress::Pending;
        }

        match &inbound.event {
            Event::AuthenticateReply { success: true, user } => {
                log::info!("[RTU] Authenticated");
                self.state = AuthState::Authenticated;
                AuthProgress::Authenticated { user: user.clone() }
            }
            Event::AuthenticateReply { success: false, .. } => {
                self.fail("server rejected token".to_string())
            }
            Event::Error {
                kind: RtuErrorKind::PermissionDenied,
                message,
            } => self.fail(message.clone()),
            Event::Error { kind, message } => {
                self.fail(format!("{}: {}", kind.as_str(), message))
            }
            other => {
                log::warn!("[RTU] Unexpected {:?} answering authentication", other.kind());
                AuthProgress::Pending
            }
        }
    }

    fn fail(&mut self, reason: String) -> AuthProgress {
        log::error!("[RTU] Authentication failed: {}", reason);
        self.state = AuthState::AuthFailed(reason.clone());
        AuthProgress::Failed(SessionError::AuthenticationFailed(reason))
    }
}

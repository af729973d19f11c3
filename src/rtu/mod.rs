//! Realtime update (RTU) protocol client.
//!
//! The collaboration server speaks JSON envelopes over one WebSocket:
//!
//! ```json
//! {"transaction_id": "...", "channel": "files/<id>", "event": "subscribe_request", "data": {...}}
//! ```
//!
//! Requests carry a fresh transaction id and the server echoes it on the
//! reply. Everything else (deltas, cell states, kernel status) is pushed
//! without one.
//!
//! # Modules
//!
//! - [`session`] - Connection state machine and application handle
//! - [`messages`] - Envelope encoding and closed inbound event decoding
//! - [`auth`] - Per-connection authentication handshake
//! - [`backoff`] - Reconnect delay schedule
//! - [`correlator`] - Transaction id to reply waiter
//! - [`subscriptions`] - Channels replayed after every reconnect
//! - [`dispatcher`] - Event routing and application callbacks
//! - [`execution`] - Cell execution completion waiters
//! - [`error`] - Session error type

pub mod auth;
pub mod backoff;
pub mod correlator;
pub mod dispatcher;
pub mod error;
pub mod execution;
pub mod messages;
pub mod session;
pub mod subscriptions;

pub use auth::{AuthProgress, AuthState, Authenticator};
pub use backoff::Backoff;
pub use correlator::Correlator;
pub use dispatcher::{CallbackId, Dispatcher};
pub use error::SessionError;
pub use execution::{Completion, ExecutionHandle, ExecutionTracker};
pub use messages::{
    CellState, Event, EventKind, Inbound, KernelStatus, Request, RtuErrorKind, SubscribeReply,
};
pub use session::{CellTypeChange, Session, SessionState};
pub use subscriptions::{Subscription, SubscriptionRegistry};

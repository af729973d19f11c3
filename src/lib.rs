//! Notebook sync - realtime mirror of a collaborative notebook.
//!
//! This crate keeps an in-memory copy of a notebook document up to date by
//! replaying the ordered delta stream a collaboration server pushes over a
//! WebSocket, and lets the application submit its own edits and cell
//! executions through the same connection.
//!
//! # Architecture
//!
//! ```text
//!   Session (application handle)
//!     │  request / subscribe / add_cell / queue_execution
//!     ▼
//!   session task ── Connector ── WebSocket (or in-memory transport)
//!     │
//!     ├── Authenticator        auth handshake per connection
//!     ├── SubscriptionRegistry replayed after every reconnect
//!     ├── Correlator           transaction id → oneshot waiter
//!     ├── Dispatcher           per-event-kind callbacks
//!     ├── NotebookBuilder      version-ordered delta application
//!     └── ExecutionTracker     cell id → completion waiter
//! ```
//!
//! # Modules
//!
//! - [`rtu`] - Realtime protocol client (session, correlator, registry)
//! - [`notebook`] - Document model and delta application engine
//! - [`snapshot`] - Full-document fetch used on open and on resync
//! - [`transport`] - Connector abstraction over WebSocket and in-memory pipes
//! - [`config`] - Session configuration loading

pub mod config;
pub mod constants;
pub mod notebook;
pub mod rtu;
pub mod snapshot;
pub mod transport;
pub mod ws;

// Re-export commonly used types
pub use config::SessionConfig;
pub use notebook::{
    Cell, CellType, ExecuteScope, ExecutionState, Notebook, NotebookBuilder, TextPatch,
};
pub use rtu::{
    CellTypeChange, Event, EventKind, ExecutionHandle, Inbound, Request, Session, SessionError,
    SessionState,
};
pub use snapshot::{DocumentSnapshot, HttpSnapshotClient, MemorySnapshots, SnapshotSource};
pub use transport::{Connector, WsConnector};

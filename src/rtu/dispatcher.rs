//! Inbound event routing.
//!
//! [`route`] decides, per decoded event, which internal consumers see it:
//! the correlator (replies), the delta engine (deltas and cell states), the
//! execution tracker (cell states) and the resync path. It is an exhaustive
//! match, so adding an [`Event`] variant forces a routing decision.
//!
//! [`Dispatcher`] holds application callbacks keyed by [`EventKind`]. The
//! session task clones the matching callbacks out under the lock and calls
//! them after releasing it, so a callback may register or remove callbacks
//! itself.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::messages::{Event, EventKind, Inbound};

/// Application event callback.
pub type Callback = Arc<dyn Fn(&Inbound) + Send + Sync>;

/// Handle returned by [`Dispatcher::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Internal consumers of one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Route {
    /// Try to resolve a pending request.
    pub correlator: bool,
    /// Feed deltas or cell states to the document.
    pub engine: bool,
    /// Feed cell states to execution waiters.
    pub tracker: bool,
    /// Rebuild the document from a snapshot.
    pub resync: bool,
}

/// Internal routing for `event`.
pub fn route(event: &Event) -> Route {
    match event {
        Event::AuthenticateReply { .. }
        | Event::UnsubscribeReply { .. }
        | Event::PingReply
        | Event::WhoAmIReply { .. }
        | Event::NewDeltaReply { .. }
        | Event::Error { .. } => Route {
            correlator: true,
            ..Route::default()
        },
        // Backlog deltas and cell states ride on the reply.
        Event::SubscribeReply(_) => Route {
            correlator: true,
            engine: true,
            tracker: true,
            resync: false,
        },
        Event::NewDeltas(_) => Route {
            engine: true,
            ..Route::default()
        },
        Event::CellStates(_) => Route {
            engine: true,
            tracker: true,
            ..Route::default()
        },
        Event::KernelStatus(_) => Route {
            engine: true,
            ..Route::default()
        },
        Event::InconsistentState { .. } => Route {
            resync: true,
            ..Route::default()
        },
        Event::Unrecognized { event, .. } => {
            log::warn!("[RTU] Unrecognized event {}", event);
            Route::default()
        }
    }
}

/// Application callbacks keyed by event kind.
#[derive(Default)]
pub struct Dispatcher {
    next_id: u64,
    callbacks: HashMap<EventKind, Vec<(CallbackId, Callback)>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("callbacks", &self.len())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// No callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `callback` for every event of `kind`.
    pub fn register(&mut self, kind: EventKind, callback: Callback) -> CallbackId {
        self.next_id += 1;
        let id = CallbackId(self.next_id);
        self.callbacks.entry(kind).or_default().push((id, callback));
        id
    }

    /// Unregister. Returns whether `id` was registered.
    pub fn remove(&mut self, id: CallbackId) -> bool {
        let mut removed = false;
        for entries in self.callbacks.values_mut() {
            let before = entries.len();
            entries.retain(|(existing, _)| *existing != id);
            removed |= entries.len() != before;
        }
        self.callbacks.retain(|_, entries| !entries.is_empty());
        removed
    }

    /// Callbacks for `kind`, in registration order.
    pub fn callbacks_for(&self, kind: EventKind) -> Vec<Callback> {
        self.callbacks
            .get(&kind)
            .map(|entries| entries.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }

    /// Total registered callbacks.
    pub fn len(&self) -> usize {
        self.callbacks.values().map(Vec::len).sum()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

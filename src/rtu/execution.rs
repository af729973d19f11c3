//! Execution tracker.
//!
//! At most one waiter per cell id. A waiter is reserved before the execute
//! delta goes out (so a terminal state that races the reply still finds
//! it), released if the send fails, and otherwise resolved exactly once:
//! with the final cell on `complete`/`error`, or with the error that ended
//! the wait.

use std::collections::HashMap;

use tokio::sync::oneshot;

use super::error::SessionError;
use crate::notebook::Cell;

/// What an execution waiter eventually receives.
pub type Completion = Result<Cell, SessionError>;

/// Completion waiters keyed by cell id.
#[derive(Debug, Default)]
pub struct ExecutionTracker {
    waiters: HashMap<String, oneshot::Sender<Completion>>,
}

impl ExecutionTracker {
    /// No waiters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the waiter for `cell_id`.
    pub fn reserve(&mut self, cell_id: &str) -> Result<ExecutionHandle, SessionError> {
        if self.waiters.contains_key(cell_id) {
            return Err(SessionError::InvalidState(format!(
                "cell {cell_id} is already queued for execution"
            )));
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(cell_id.to_string(), tx);
        Ok(ExecutionHandle {
            cell_id: cell_id.to_string(),
            rx,
        })
    }

    /// Drop a reservation without resolving it.
    pub fn release(&mut self, cell_id: &str) -> bool {
        self.waiters.remove(cell_id).is_some()
    }

    /// Cell ids with outstanding waiters.
    pub fn waiting(&self) -> Vec<String> {
        self.waiters.keys().cloned().collect()
    }

    /// Feed a cell whose execution state changed. Resolves its waiter on a
    /// terminal state.
    pub fn on_state(&mut self, cell: &Cell) -> bool {
        if !cell.execution_state.is_terminal() {
            return false;
        }
        match self.waiters.remove(&cell.id) {
            Some(tx) => {
                log::debug!("[RTU] Cell {} finished: {:?}", cell.id, cell.execution_state);
                let _ = tx.send(Ok(cell.clone()));
                true
            }
            None => false,
        }
    }

    /// Resolve one waiter with `error`.
    pub fn fail(&mut self, cell_id: &str, error: SessionError) -> bool {
        match self.waiters.remove(cell_id) {
            Some(tx) => {
                let _ = tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Resolve every waiter with `error`.
    pub fn fail_all(&mut self, error: &SessionError) -> usize {
        let count = self.waiters.len();
        for (_, tx) in self.waiters.drain() {
            let _ = tx.send(Err(error.clone()));
        }
        count
    }

    /// Number of outstanding waiters.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// Pending completion of one queued cell.
#[derive(Debug)]
pub struct ExecutionHandle {
    cell_id: String,
    rx: oneshot::Receiver<Completion>,
}

impl ExecutionHandle {
    /// Cell being executed.
    pub fn cell_id(&self) -> &str {
        &self.cell_id
    }

    /// Wait for the final cell state.
    pub async fn wait(self) -> Completion {
        self.rx.await.unwrap_or(Err(SessionError::Cancelled))
    }
}

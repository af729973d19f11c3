//! Request/reply correlation.
//!
//! Every outbound request gets a fresh transaction id and a oneshot waiter
//! registered here. The waiter is resolved exactly once: by the matching
//! reply, by its deadline passing, or by the connection going away. The
//! sender is removed from the map before it is used, so no path can
//! resolve it twice.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use super::error::SessionError;
use super::messages::{Event, EventKind};

/// What a waiter eventually receives.
pub type Reply = Result<Event, SessionError>;

#[derive(Debug)]
struct PendingRequest {
    expected: EventKind,
    deadline: Instant,
    tx: oneshot::Sender<Reply>,
}

/// Outstanding requests keyed by transaction id.
#[derive(Debug, Default)]
pub struct Correlator {
    pending: HashMap<Uuid, PendingRequest>,
}

impl Correlator {
    /// Empty correlator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for a reply of kind `expected`.
    pub fn register(
        &mut self,
        expected: EventKind,
        timeout: Duration,
    ) -> (Uuid, Instant, oneshot::Receiver<Reply>) {
        let mut transaction_id = Uuid::new_v4();
        while self.pending.contains_key(&transaction_id) {
            transaction_id = Uuid::new_v4();
        }
        let deadline = Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            transaction_id,
            PendingRequest {
                expected,
                deadline,
                tx,
            },
        );
        (transaction_id, deadline, rx)
    }

    /// Route a reply to its waiter.
    ///
    /// Only reply events of the expected kind (or RTU errors) resolve a
    /// waiter. Returns whether one was resolved.
    pub fn resolve(&mut self, transaction_id: Uuid, event: &Event) -> bool {
        if !event.is_reply() {
            return false;
        }
        let Some(pending) = self.pending.get(&transaction_id) else {
            log::debug!("[RTU] Reply for unknown transaction {}", transaction_id);
            return false;
        };

        let reply = match event {
            Event::Error { kind, message } => Err(SessionError::Rejected {
                kind: kind.as_str().to_string(),
                message: message.clone(),
            }),
            event if event.kind() == pending.expected => Ok(event.clone()),
            event => {
                log::warn!(
                    "[RTU] Transaction {} expected {:?} but got {:?}",
                    transaction_id,
                    pending.expected,
                    event.kind()
                );
                return false;
            }
        };

        match self.pending.remove(&transaction_id) {
            Some(pending) => {
                // Receiver may have given up (timeout raced the reply).
                let _ = pending.tx.send(reply);
                true
            }
            None => false,
        }
    }

    /// Resolve one waiter with an error.
    pub fn fail(&mut self, transaction_id: Uuid, error: SessionError) -> bool {
        match self.pending.remove(&transaction_id) {
            Some(pending) => {
                let _ = pending.tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Drop a waiter without resolving it (its receiver already gave up).
    pub fn remove(&mut self, transaction_id: Uuid) -> bool {
        self.pending.remove(&transaction_id).is_some()
    }

    /// Resolve every waiter with `error`. Returns how many there were.
    pub fn cancel_all(&mut self, error: &SessionError) -> usize {
        let count = self.pending.len();
        for (_, pending) in self.pending.drain() {
            let _ = pending.tx.send(Err(error.clone()));
        }
        count
    }

    /// Time out every waiter whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for transaction_id in &expired {
            self.fail(*transaction_id, SessionError::Timeout);
        }
        expired.len()
    }

    /// Whether `transaction_id` is still waiting.
    pub fn contains(&self, transaction_id: Uuid) -> bool {
        self.pending.contains_key(&transaction_id)
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtu::messages::RtuErrorKind;

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn out_of_order_replies_reach_their_own_waiters() {
        let mut correlator = Correlator::new();
        let (first, _, first_rx) = correlator.register(EventKind::PingReply, TIMEOUT);
        let (second, _, second_rx) = correlator.register(EventKind::NewDeltaReply, TIMEOUT);
        assert_ne!(first, second);

        assert!(correlator.resolve(second, &Event::NewDeltaReply { success: true }));
        assert!(correlator.resolve(first, &Event::PingReply));
        assert!(correlator.is_empty());

        assert_eq!(first_rx.await.unwrap(), Ok(Event::PingReply));
        assert_eq!(second_rx.await.unwrap(), Ok(Event::NewDeltaReply { success: true }));
    }

    #[tokio::test]
    async fn resolves_exactly_once() {
        let mut correlator = Correlator::new();
        let (id, _, rx) = correlator.register(EventKind::PingReply, TIMEOUT);

        assert!(correlator.resolve(id, &Event::PingReply));
        assert!(!correlator.resolve(id, &Event::PingReply));
        assert!(!correlator.fail(id, SessionError::ConnectionLost));
        assert_eq!(rx.await.unwrap(), Ok(Event::PingReply));
    }

    #[test]
    fn push_events_never_resolve() {
        let mut correlator = Correlator::new();
        let (id, _, _rx) = correlator.register(EventKind::NewDeltaReply, TIMEOUT);

        assert!(!correlator.resolve(id, &Event::NewDeltas(Vec::new())));
        assert!(!correlator.resolve(id, &Event::PingReply));
        assert!(correlator.contains(id));
    }

    #[tokio::test]
    async fn error_events_reject() {
        let mut correlator = Correlator::new();
        let (id, _, rx) = correlator.register(EventKind::NewDeltaReply, TIMEOUT);
        assert!(correlator.resolve(
            id,
            &Event::Error {
                kind: RtuErrorKind::InvalidData,
                message: "bad delta".into(),
            }
        ));
        assert_eq!(
            rx.await.unwrap(),
            Err(SessionError::Rejected {
                kind: "invalid_data".into(),
                message: "bad delta".into(),
            })
        );
    }

    #[tokio::test]
    async fn cancel_all_resolves_every_waiter() {
        let mut correlator = Correlator::new();
        let (_, _, a) = correlator.register(EventKind::PingReply, TIMEOUT);
        let (_, _, b) = correlator.register(EventKind::SubscribeReply, TIMEOUT);

        assert_eq!(correlator.cancel_all(&SessionError::ConnectionLost), 2);
        assert_eq!(a.await.unwrap(), Err(SessionError::ConnectionLost));
        assert_eq!(b.await.unwrap(), Err(SessionError::ConnectionLost));
        assert!(correlator.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expire_times_out_only_overdue_waiters() {
        let mut correlator = Correlator::new();
        let (_, _, short) = correlator.register(EventKind::PingReply, Duration::from_secs(1));
        let (long_id, _, _long) = correlator.register(EventKind::PingReply, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(correlator.expire(Instant::now()), 1);
        assert_eq!(short.await.unwrap(), Err(SessionError::Timeout));
        assert!(correlator.contains(long_id));
    }

    #[test]
    fn dropped_receiver_does_not_panic() {
        let mut correlator = Correlator::new();
        let (id, _, rx) = correlator.register(EventKind::PingReply, TIMEOUT);
        drop(rx);
        assert!(correlator.resolve(id, &Event::PingReply));
    }
}

//! Realtime session: connection state machine and application handle.
//!
//! A [`Session`] is the application's handle. Behind it one tokio task owns
//! the transport and runs the connection lifecycle:
//!
//! ```text
//! Disconnected ─▶ Connecting ─▶ Authenticating ─▶ Subscribing ─▶ Ready
//!                     ▲                                            │
//!                     └──────────── Reconnecting ◀─── lost ────────┘
//!
//! bad credentials / retry budget spent ─▶ Failed      close() ─▶ Closed
//! ```
//!
//! The task drains inbound frames, decodes them once, and routes them to
//! the correlator, the document builder, the execution tracker and the
//! application callbacks. Application calls never touch the socket: they
//! register a waiter, push the request onto an unbounded queue and await
//! the waiter.
//!
//! # Reconnection
//!
//! On any abnormal closure every pending request, execution waiter and
//! edit waiter is resolved with [`SessionError::ConnectionLost`], then the
//! task backs off and reconnects, re-authenticates, and replays every
//! registered subscription before publishing `Ready` again. The document
//! channel is resubscribed from the current watermark so the server sends
//! only the deltas this client missed.

// Rust guideline compliant 2026-02

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use super::auth::{AuthProgress, Authenticator};
use super::backoff::Backoff;
use super::correlator::{Correlator, Reply};
use super::dispatcher::{self, CallbackId, Dispatcher};
use super::error::SessionError;
use super::execution::{ExecutionHandle, ExecutionTracker};
use super::messages::{self, CellState, Event, EventKind, Inbound, KernelStatus, Request};
use super::subscriptions::{Subscription, SubscriptionRegistry};
use crate::config::SessionConfig;
use crate::constants;
use crate::notebook::model::SERVICE_METADATA_KEY;
use crate::notebook::{
    Cell, CellType, Delta, DeltaDraft, DeltaOp, ExecuteScope, Ingest, Notebook, NotebookBuilder,
    TextPatch,
};
use crate::snapshot::{DocumentSnapshot, SnapshotSource};
use crate::transport::{Connector, FrameSink, FrameSource};
use crate::ws::WsMessage;

/// Connection lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Not started yet.
    Disconnected,
    /// Opening the transport.
    Connecting,
    /// Transport up, waiting for `authenticate_reply`.
    Authenticating,
    /// Authenticated, replaying subscriptions.
    Subscribing,
    /// Fully subscribed; requests may be sent.
    Ready,
    /// Waiting before the next connection attempt.
    Reconnecting {
        /// Consecutive failed attempts so far.
        attempt: u32,
        /// Delay before the next attempt in milliseconds.
        next_retry_ms: u64,
    },
    /// Closed by the application.
    Closed,
    /// Gave up; see the error.
    Failed(SessionError),
}

impl SessionState {
    /// Whether the session will never leave this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed(_))
    }
}

/// Target for [`Session::change_cell_type`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellTypeChange {
    /// Code cell in `language`.
    Code {
        /// Kernel language, e.g. `python`.
        language: String,
    },
    /// Markdown cell.
    Markdown,
    /// Raw cell.
    Raw,
    /// SQL query cell.
    Query {
        /// Connection to run against. Defaults to the built-in database.
        db_connection: Option<String>,
        /// Variable receiving the result. Defaults to a random `df_xxxx`.
        assign_results_to: Option<String>,
    },
}

/// Run `wait` with a deadline. `Duration::MAX` overflows the timer and
/// means no deadline.
async fn with_deadline<T>(
    timeout: Duration,
    wait: impl std::future::Future<Output = Result<T, SessionError>>,
) -> Result<T, SessionError> {
    match Instant::now().checked_add(timeout) {
        Some(deadline) => tokio::time::timeout_at(deadline, wait)
            .await
            .unwrap_or(Err(SessionError::Timeout)),
        None => wait.await,
    }
}

/// Request queued for the session task.
#[derive(Debug)]
struct Outbound {
    transaction_id: Uuid,
    request: Request,
}

/// What a freshly installed snapshot must show for a submitted edit to
/// count as applied.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Landed {
    /// The added cell exists.
    CellPresent(String),
    /// The deleted cell is gone.
    CellAbsent(String),
    /// Not observable in a snapshot; only the broadcast copy releases it.
    Broadcast,
}

impl Landed {
    fn for_op(op: &DeltaOp) -> Self {
        match op {
            DeltaOp::AddCell { cell, .. } => Self::CellPresent(cell.id.clone()),
            DeltaOp::DeleteCell { cell_id } => Self::CellAbsent(cell_id.clone()),
            _ => Self::Broadcast,
        }
    }

    fn shown_by(&self, present: &HashSet<String>) -> bool {
        match self {
            Self::CellPresent(cell_id) => present.contains(cell_id),
            Self::CellAbsent(cell_id) => !present.contains(cell_id),
            Self::Broadcast => false,
        }
    }
}

/// Application waiting for its own delta to come back applied.
#[derive(Debug)]
struct EditWaiter {
    landed: Landed,
    tx: oneshot::Sender<Result<(), SessionError>>,
}

/// Waiters for submitted deltas, keyed by delta id.
type AppliedWaiters = HashMap<Uuid, EditWaiter>;

/// State shared between the application handle and the session task.
#[derive(Debug)]
struct Shared {
    config: SessionConfig,
    document_channel: String,
    correlator: Mutex<Correlator>,
    registry: Mutex<SubscriptionRegistry>,
    dispatcher: Mutex<Dispatcher>,
    tracker: Mutex<ExecutionTracker>,
    builder: RwLock<NotebookBuilder>,
    applied: Mutex<AppliedWaiters>,
    kernel_tx: watch::Sender<Option<KernelStatus>>,
    state_tx: watch::Sender<SessionState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn correlator(&self) -> MutexGuard<'_, Correlator> {
        lock(&self.correlator)
    }

    fn registry(&self) -> MutexGuard<'_, SubscriptionRegistry> {
        lock(&self.registry)
    }

    fn dispatcher(&self) -> MutexGuard<'_, Dispatcher> {
        lock(&self.dispatcher)
    }

    fn tracker(&self) -> MutexGuard<'_, ExecutionTracker> {
        lock(&self.tracker)
    }

    fn applied(&self) -> MutexGuard<'_, AppliedWaiters> {
        lock(&self.applied)
    }

    fn builder(&self) -> RwLockReadGuard<'_, NotebookBuilder> {
        self.builder.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn builder_mut(&self) -> RwLockWriteGuard<'_, NotebookBuilder> {
        self.builder.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn kernel(&self) -> Option<KernelStatus> {
        self.kernel_tx.borrow().clone()
    }

    fn set_kernel(&self, status: KernelStatus) {
        log::debug!(
            "[Session] Kernel {} is {}",
            status.name.as_deref().unwrap_or("?"),
            status.execution_state
        );
        self.kernel_tx.send_replace(Some(status));
    }

    fn publish(&self, state: SessionState) {
        let previous = self.state_tx.send_replace(state.clone());
        if previous != state {
            log::info!("[Session] {:?} -> {:?}", previous, state);
        }
    }

    /// Resolve every outstanding waiter with `error`.
    fn cancel_in_flight(&self, error: &SessionError) {
        let requests = self.correlator().cancel_all(error);
        let executions = self.tracker().fail_all(error);
        let edits = {
            let mut applied = self.applied();
            let count = applied.len();
            for (_, waiter) in applied.drain() {
                let _ = waiter.tx.send(Err(error.clone()));
            }
            count
        };
        if requests + executions + edits > 0 {
            log::info!(
                "[Session] Cancelled {} requests, {} executions, {} edits: {}",
                requests,
                executions,
                edits,
                error
            );
        }
    }

    /// Full routing of one inbound event. Returns a resync reason if the
    /// document can no longer be trusted.
    fn dispatch(&self, inbound: &Inbound) -> Option<String> {
        let route = dispatcher::route(&inbound.event);
        let mut resync = None;

        if route.engine || route.tracker {
            resync = self.apply(inbound);
        }
        if route.resync {
            if let Event::InconsistentState { message } = &inbound.event {
                resync = Some(format!("server reported inconsistent state: {message}"));
            }
        }
        if route.correlator {
            if let Some(transaction_id) = inbound.transaction_id {
                self.correlator().resolve(transaction_id, &inbound.event);
            }
        }

        let callbacks = self.dispatcher().callbacks_for(inbound.event.kind());
        for callback in callbacks {
            callback(inbound);
        }
        resync
    }

    /// Feed the document builder and execution tracker.
    fn apply(&self, inbound: &Inbound) -> Option<String> {
        match &inbound.event {
            Event::NewDeltas(deltas) if inbound.channel == self.document_channel => {
                self.ingest(deltas)
            }
            Event::NewDeltas(_) => {
                log::debug!("[Session] Ignoring deltas for {}", inbound.channel);
                None
            }
            Event::SubscribeReply(reply) => {
                if let Some(kernel) = &reply.kernel_session {
                    self.set_kernel(kernel.clone());
                }
                let resync = if inbound.channel == self.document_channel {
                    self.ingest(&reply.deltas_to_apply)
                } else {
                    None
                };
                if resync.is_none() {
                    self.apply_cell_states(&reply.cell_states);
                }
                resync
            }
            Event::CellStates(states) => {
                self.apply_cell_states(states);
                None
            }
            Event::KernelStatus(status) => {
                self.set_kernel(status.clone());
                None
            }
            _ => None,
        }
    }

    fn ingest(&self, deltas: &[Delta]) -> Option<String> {
        for delta in deltas {
            let outcome = self.builder_mut().ingest(delta);
            match outcome {
                Ingest::Applied => {
                    if let DeltaOp::DeleteCell { cell_id } = &delta.op {
                        self.tracker()
                            .fail(cell_id, SessionError::CellDeleted(cell_id.clone()));
                    }
                    self.release_edit(delta.id);
                }
                // A replayed copy of our own edit still means it is in the document.
                Ingest::Duplicate => self.release_edit(delta.id),
                Ingest::Resync(error) => {
                    // The rest of the batch builds on state we do not have.
                    return Some(error.to_string());
                }
            }
        }
        None
    }

    fn release_edit(&self, delta_id: Uuid) {
        let waiter = self.applied().remove(&delta_id);
        if let Some(waiter) = waiter {
            let _ = waiter.tx.send(Ok(()));
        }
    }

    fn apply_cell_states(&self, states: &[CellState]) {
        for state in states {
            let updated = self
                .builder_mut()
                .apply_cell_state(&state.cell_id, state.state);
            match updated {
                Some(cell) => {
                    self.tracker().on_state(&cell);
                }
                None => log::debug!(
                    "[Session] State {:?} for unknown cell {}",
                    state.state,
                    state.cell_id
                ),
            }
        }
    }

    /// Replace the document with `snapshot`.
    ///
    /// Execution waiters for cells that no longer exist resolve with
    /// `CellDeleted`. Edit waiters resolve only if the snapshot shows their
    /// effect; the rest stay pending until the resubscription replays the
    /// broadcast copy.
    fn install_snapshot(&self, snapshot: DocumentSnapshot) {
        let version = snapshot.version;
        let present: HashSet<String> = snapshot.notebook.cell_ids().into_iter().collect();
        self.builder_mut().reset(snapshot);

        {
            let mut tracker = self.tracker();
            for cell_id in tracker.waiting() {
                if !present.contains(&cell_id) {
                    tracker.fail(&cell_id, SessionError::CellDeleted(cell_id.clone()));
                }
            }
        }

        let (released, pending) = {
            let mut applied = self.applied();
            let landed: Vec<Uuid> = applied
                .iter()
                .filter(|(_, waiter)| waiter.landed.shown_by(&present))
                .map(|(id, _)| *id)
                .collect();
            for id in &landed {
                if let Some(waiter) = applied.remove(id) {
                    let _ = waiter.tx.send(Ok(()));
                }
            }
            (landed.len(), applied.len())
        };
        log::info!(
            "[Session] Document reset to version {} ({} edits released, {} still pending)",
            version,
            released,
            pending
        );
    }
}

/// Why a connection ended.
#[derive(Debug)]
enum Outcome {
    /// Application asked to close.
    Shutdown,
    /// Transport failure; reconnect.
    Lost(String),
    /// Unrecoverable; stop.
    Fatal(SessionError),
}

struct Connection {
    sink: Box<dyn FrameSink>,
    source: Box<dyn FrameSource>,
}

/// Owns the transport for one session.
struct SessionTask {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    snapshots: Arc<dyn SnapshotSource>,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    shutdown_rx: watch::Receiver<bool>,
    backoff: Backoff,
    last_inbound: Instant,
    resync_pending: bool,
}

impl SessionTask {
    async fn run(mut self) {
        loop {
            if self.shutdown_requested() {
                break;
            }

            match self.connect_and_serve().await {
                Outcome::Shutdown => break,
                Outcome::Fatal(error) => {
                    log::error!("[Session] Giving up: {}", error);
                    self.shared.publish(SessionState::Failed(error.clone()));
                    self.shared.cancel_in_flight(&error);
                    return;
                }
                Outcome::Lost(reason) => {
                    log::warn!("[Session] Connection lost: {}", reason);
                    let Some(delay) = self.backoff.next_delay() else {
                        let error = SessionError::RetryBudgetExhausted {
                            attempts: self.backoff.attempt(),
                        };
                        log::error!("[Session] {}", error);
                        self.shared.publish(SessionState::Failed(error.clone()));
                        self.shared.cancel_in_flight(&error);
                        return;
                    };

                    self.shared.publish(SessionState::Reconnecting {
                        attempt: self.backoff.attempt(),
                        next_retry_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    });
                    self.shared.cancel_in_flight(&SessionError::ConnectionLost);

                    log::info!("[Session] Reconnecting in {:.1}s...", delay.as_secs_f32());
                    if !self.wait_before_retry(delay).await {
                        break;
                    }
                }
            }
        }

        self.shared.cancel_in_flight(&SessionError::Cancelled);
        self.shared.publish(SessionState::Closed);
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow() || self.shutdown_rx.has_changed().is_err()
    }

    /// Sleep out the backoff delay. Returns `false` on shutdown.
    async fn wait_before_retry(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => return false,
                () = tokio::time::sleep_until(deadline) => return true,
                Some(outbound) = self.outbound_rx.recv() => self.reject(&outbound),
            }
        }
    }

    fn reject(&self, outbound: &Outbound) {
        log::debug!(
            "[Session] Rejecting {} while disconnected",
            outbound.request.event()
        );
        self.shared
            .correlator()
            .fail(outbound.transaction_id, SessionError::NotConnected);
    }

    async fn connect_and_serve(&mut self) -> Outcome {
        let mut conn = match self.establish().await {
            Ok(conn) => conn,
            Err(outcome) => return outcome,
        };

        let outcome = match self.handshake(&mut conn).await {
            Ok(held) => {
                self.backoff.reset();
                match self.process(&mut conn, held).await {
                    Ok(()) => self.serve(&mut conn).await,
                    Err(outcome) => outcome,
                }
            }
            Err(outcome) => outcome,
        };

        if matches!(outcome, Outcome::Shutdown | Outcome::Fatal(_)) {
            if let Err(e) = conn.sink.close().await {
                log::debug!("[Session] Close frame not delivered: {:#}", e);
            }
        }
        outcome
    }

    async fn establish(&mut self) -> Result<Connection, Outcome> {
        self.shared.publish(SessionState::Connecting);
        let url = self.shared.config.rtu_endpoint();
        let timeout = self.shared.config.handshake_timeout();
        let connector = Arc::clone(&self.connector);
        log::info!("[Session] Connecting to {}", url);

        tokio::select! {
            biased;
            _ = self.shutdown_rx.changed() => Err(Outcome::Shutdown),
            result = tokio::time::timeout(timeout, connector.connect(&url)) => match result {
                Ok(Ok((sink, source))) => {
                    self.last_inbound = Instant::now();
                    Ok(Connection { sink, source })
                }
                Ok(Err(e)) => Err(Outcome::Lost(format!("connect failed: {e:#}"))),
                Err(_) => Err(Outcome::Lost("connect timed out".to_string())),
            },
        }
    }

    /// Authenticate and replay subscriptions. Returns push frames that
    /// arrived meanwhile, in order.
    async fn handshake(&mut self, conn: &mut Connection) -> Result<Vec<Inbound>, Outcome> {
        let mut held = Vec::new();

        self.shared.publish(SessionState::Authenticating);
        let mut auth = Authenticator::new(
            self.shared.config.token.clone(),
            self.shared.config.client_type.clone(),
        );
        let (transaction_id, request) = auth.start();
        send(conn, &request.encode(transaction_id)).await?;
        let reply = self.await_reply(conn, transaction_id, &mut held).await?;
        match auth.on_inbound(&reply) {
            AuthProgress::Authenticated { .. } => {}
            AuthProgress::Failed(error) => return Err(Outcome::Fatal(error)),
            AuthProgress::Pending => {
                return Err(Outcome::Lost(format!(
                    "unexpected {} answering authentication",
                    reply.event.kind().as_str()
                )))
            }
        }

        self.shared.publish(SessionState::Subscribing);
        self.replay_subscriptions(conn, &mut held).await?;
        Ok(held)
    }

    /// Subscribe every registry entry, then publish `Ready`.
    ///
    /// Re-reads the registry until a pass finds nothing new. The final check
    /// and the `Ready` transition happen under the registry lock, so an
    /// application `subscribe` either lands in this replay or sees `Ready`
    /// and sends its own request.
    async fn replay_subscriptions(
        &mut self,
        conn: &mut Connection,
        held: &mut Vec<Inbound>,
    ) -> Result<(), Outcome> {
        let mut done: HashSet<String> = HashSet::new();
        loop {
            let (pending, stale) = {
                let registry = self.shared.registry();
                let pending: Vec<Subscription> = registry
                    .snapshot()
                    .into_iter()
                    .filter(|s| !done.contains(&s.channel))
                    .collect();
                let mut stale = Vec::new();
                if pending.is_empty() {
                    self.shared.publish(SessionState::Ready);
                    stale = done
                        .iter()
                        .filter(|channel| !registry.contains(channel))
                        .cloned()
                        .collect();
                }
                (pending, stale)
            };

            if pending.is_empty() {
                // Unsubscribed while the replay was in flight.
                for channel in stale {
                    log::debug!("[Session] Dropping {} unsubscribed during replay", channel);
                    send(conn, &Request::Unsubscribe { channel }.encode(Uuid::new_v4())).await?;
                }
                return Ok(());
            }

            for subscription in pending {
                let channel = subscription.channel.clone();
                self.replay_one(conn, subscription, held).await?;
                done.insert(channel);
            }
        }
    }

    async fn replay_one(
        &mut self,
        conn: &mut Connection,
        subscription: Subscription,
        held: &mut Vec<Inbound>,
    ) -> Result<(), Outcome> {
        if subscription.channel == self.shared.document_channel {
            return self.subscribe_document(conn, held).await;
        }

        let channel = subscription.channel;
        let request = Request::Subscribe {
            channel: channel.clone(),
            params: subscription.params,
        };
        let reply = self.handshake_request(conn, &request, held).await?;
        match &reply.event {
            Event::SubscribeReply(r) if r.success => {
                self.shared.apply(&reply);
                Ok(())
            }
            Event::SubscribeReply(_) | Event::Error { .. } => {
                let detail = match &reply.event {
                    Event::Error { message, .. } => message.clone(),
                    _ => "success: false".to_string(),
                };
                log::error!(
                    "[Session] Subscription to {} rejected ({}); dropping it",
                    channel,
                    detail
                );
                self.shared.registry().remove(&channel);
                Ok(())
            }
            other => Err(Outcome::Lost(format!(
                "unexpected {} answering subscription to {}",
                other.kind().as_str(),
                channel
            ))),
        }
    }

    /// Subscribe the document channel from the current watermark and apply
    /// the backlog, rebuilding from a snapshot if the backlog does not fit.
    async fn subscribe_document(
        &mut self,
        conn: &mut Connection,
        held: &mut Vec<Inbound>,
    ) -> Result<(), Outcome> {
        for _ in 0..=constants::MAX_RESYNC_ATTEMPTS {
            let reply = self.request_document(conn, held).await?;
            match self.shared.apply(&reply) {
                None => {
                    self.resync_pending = false;
                    return Ok(());
                }
                Some(reason) => {
                    log::warn!("[Session] Backlog did not apply: {}", reason);
                    if !self.refetch_snapshot().await {
                        return Ok(());
                    }
                }
            }
        }
        Err(Outcome::Lost(
            "document did not converge after repeated resyncs".to_string(),
        ))
    }

    async fn request_document(
        &mut self,
        conn: &mut Connection,
        held: &mut Vec<Inbound>,
    ) -> Result<Inbound, Outcome> {
        let from_version = self.shared.builder().watermark();
        let channel = self.shared.document_channel.clone();
        log::debug!("[Session] Subscribing {} from version {}", channel, from_version);

        let request = Request::Subscribe {
            channel: channel.clone(),
            params: json!({ "from_version": from_version }),
        };
        let reply = self.handshake_request(conn, &request, held).await?;
        match &reply.event {
            Event::SubscribeReply(r) if r.success => Ok(reply),
            Event::SubscribeReply(_) => Err(Outcome::Fatal(SessionError::Rejected {
                kind: EventKind::SubscribeReply.as_str().to_string(),
                message: format!("subscription to {channel} refused"),
            })),
            Event::Error { kind, message } => Err(Outcome::Fatal(SessionError::Rejected {
                kind: kind.as_str().to_string(),
                message: message.clone(),
            })),
            other => Err(Outcome::Lost(format!(
                "unexpected {} answering document subscription",
                other.kind().as_str()
            ))),
        }
    }

    /// Fetch and install a snapshot. Returns `false` (and leaves a retry
    /// pending) if the fetch failed.
    async fn refetch_snapshot(&mut self) -> bool {
        match self.snapshots.fetch(&self.shared.config.file_id).await {
            Ok(snapshot) => {
                self.shared.install_snapshot(snapshot);
                self.resync_pending = false;
                true
            }
            Err(e) => {
                log::error!("[Session] Snapshot fetch failed: {:#}", e);
                self.resync_pending = true;
                false
            }
        }
    }

    /// Rebuild the document and resubscribe. Returns frames held meanwhile.
    async fn resync(&mut self, conn: &mut Connection, reason: &str) -> Result<Vec<Inbound>, Outcome> {
        log::warn!("[Session] Resyncing document: {}", reason);
        let mut held = Vec::new();
        if self.refetch_snapshot().await {
            self.subscribe_document(conn, &mut held).await?;
        }
        Ok(held)
    }

    async fn handshake_request(
        &mut self,
        conn: &mut Connection,
        request: &Request,
        held: &mut Vec<Inbound>,
    ) -> Result<Inbound, Outcome> {
        let transaction_id = Uuid::new_v4();
        send(conn, &request.encode(transaction_id)).await?;
        self.await_reply(conn, transaction_id, held).await
    }

    /// Read frames until the reply to `transaction_id` arrives.
    ///
    /// Other frames are decoded and held for later, in order. Application
    /// requests stay queued until the handshake is done.
    async fn await_reply(
        &mut self,
        conn: &mut Connection,
        transaction_id: Uuid,
        held: &mut Vec<Inbound>,
    ) -> Result<Inbound, Outcome> {
        let deadline = Instant::now() + self.shared.config.handshake_timeout();
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => return Err(Outcome::Shutdown),
                () = tokio::time::sleep_until(deadline) => {
                    return Err(Outcome::Lost(format!("no reply to handshake transaction {transaction_id}")));
                }
                frame = conn.source.recv() => {
                    if let Some(inbound) = self.read_frame(conn, frame).await? {
                        if inbound.transaction_id == Some(transaction_id) && inbound.event.is_reply() {
                            return Ok(inbound);
                        }
                        held.push(inbound);
                    }
                }
            }
        }
    }

    /// Handle one transport frame. Text frames are decoded; malformed ones
    /// are logged and dropped.
    async fn read_frame(
        &mut self,
        conn: &mut Connection,
        frame: Option<anyhow::Result<WsMessage>>,
    ) -> Result<Option<Inbound>, Outcome> {
        self.last_inbound = Instant::now();
        match frame {
            None => Err(Outcome::Lost("stream ended".to_string())),
            Some(Err(e)) => Err(Outcome::Lost(format!("read error: {e:#}"))),
            Some(Ok(WsMessage::Text(text))) => match messages::decode(&text) {
                Ok(inbound) => {
                    log::trace!(
                        "[RTU] <- {} on {}",
                        inbound.event.kind().as_str(),
                        inbound.channel
                    );
                    Ok(Some(inbound))
                }
                Err(e) => {
                    log::warn!("[RTU] Dropping frame: {}", e);
                    Ok(None)
                }
            },
            Some(Ok(WsMessage::Ping(data))) => {
                conn.sink
                    .send_pong(data)
                    .await
                    .map_err(|e| Outcome::Lost(format!("pong failed: {e:#}")))?;
                Ok(None)
            }
            Some(Ok(WsMessage::Close { code, reason })) => Err(Outcome::Lost(format!(
                "server closed connection ({code}): {reason}"
            ))),
            Some(Ok(WsMessage::Binary(_) | WsMessage::Pong(_))) => Ok(None),
        }
    }

    /// Dispatch frames in order, resyncing as needed.
    async fn process(&mut self, conn: &mut Connection, frames: Vec<Inbound>) -> Result<(), Outcome> {
        let mut queue = VecDeque::from(frames);
        while let Some(inbound) = queue.pop_front() {
            if let Some(reason) = self.shared.dispatch(&inbound) {
                let held = self.resync(conn, &reason).await?;
                queue.extend(held);
            }
        }
        Ok(())
    }

    async fn serve(&mut self, conn: &mut Connection) -> Outcome {
        let period = self.shared.config.ping_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let result = tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => Err(Outcome::Shutdown),
                frame = conn.source.recv() => self.on_frame(conn, frame).await,
                Some(outbound) = self.outbound_rx.recv() => self.send_outbound(conn, outbound).await,
                _ = heartbeat.tick() => self.on_heartbeat(conn).await,
            };
            if let Err(outcome) = result {
                return outcome;
            }
        }
    }

    async fn on_frame(
        &mut self,
        conn: &mut Connection,
        frame: Option<anyhow::Result<WsMessage>>,
    ) -> Result<(), Outcome> {
        match self.read_frame(conn, frame).await? {
            Some(inbound) => self.process(conn, vec![inbound]).await,
            None => Ok(()),
        }
    }

    async fn send_outbound(&mut self, conn: &mut Connection, outbound: Outbound) -> Result<(), Outcome> {
        if !self.shared.correlator().contains(outbound.transaction_id) {
            log::debug!(
                "[RTU] Skipping {} {}: waiter already resolved",
                outbound.request.event(),
                outbound.transaction_id
            );
            return Ok(());
        }
        log::debug!(
            "[RTU] -> {} on {}",
            outbound.request.event(),
            outbound.request.channel()
        );
        send(conn, &outbound.request.encode(outbound.transaction_id)).await
    }

    async fn on_heartbeat(&mut self, conn: &mut Connection) -> Result<(), Outcome> {
        let silent = self.last_inbound.elapsed();
        if silent > self.shared.config.stale_timeout() {
            return Err(Outcome::Lost(format!(
                "connection stale ({}s without traffic)",
                silent.as_secs()
            )));
        }

        let expired = self.shared.correlator().expire(Instant::now());
        if expired > 0 {
            log::debug!("[RTU] {} requests timed out", expired);
        }

        send(conn, &Request::Ping.encode(Uuid::new_v4())).await?;

        if self.resync_pending {
            let held = self.resync(conn, "retrying failed snapshot fetch").await?;
            self.process(conn, held).await?;
        }
        Ok(())
    }
}

async fn send(conn: &mut Connection, text: &str) -> Result<(), Outcome> {
    conn.sink
        .send_text(text)
        .await
        .map_err(|e| Outcome::Lost(format!("send failed: {e:#}")))
}

/// Turn a `success: false` reply into [`SessionError::Rejected`].
fn check_success(event: Event) -> Result<Event, SessionError> {
    let failed = match &event {
        Event::SubscribeReply(reply) => !reply.success,
        Event::UnsubscribeReply { success }
        | Event::NewDeltaReply { success }
        | Event::AuthenticateReply { success, .. } => !success,
        _ => false,
    };
    if failed {
        return Err(SessionError::Rejected {
            kind: event.kind().as_str().to_string(),
            message: "server reported failure".to_string(),
        });
    }
    Ok(event)
}

fn random_result_name() -> String {
    let suffix: String = (0..4)
        .map(|_| char::from(rand::random_range(b'a'..=b'z')))
        .collect();
    format!("{}{}", constants::QUERY_RESULT_PREFIX, suffix)
}

/// Application handle for one realtime session.
///
/// Dropping the handle shuts the session task down; [`Session::close`]
/// does the same and waits for it.
#[derive(Debug)]
pub struct Session {
    shared: Arc<Shared>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    shutdown_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<SessionState>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Fetch the document, connect, authenticate and subscribe.
    ///
    /// Returns once the session is `Ready`. Transient connection failures
    /// are retried with backoff; bad credentials and an exhausted retry
    /// budget are returned as errors.
    pub async fn open(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        snapshots: Arc<dyn SnapshotSource>,
    ) -> Result<Self, SessionError> {
        config
            .validate()
            .map_err(|e| SessionError::InvalidConfig(format!("{e:#}")))?;

        log::info!("[Session] Opening file {}", config.file_id);
        let snapshot = snapshots
            .fetch(&config.file_id)
            .await
            .map_err(|e| SessionError::Snapshot(format!("{e:#}")))?;

        let session = Self::spawn(config, connector, snapshots, snapshot);
        match session.wait_until_ready().await {
            Ok(()) => Ok(session),
            Err(error) => {
                session.close().await;
                Err(error)
            }
        }
    }

    fn spawn(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        snapshots: Arc<dyn SnapshotSource>,
        snapshot: DocumentSnapshot,
    ) -> Self {
        let document_channel = messages::files_channel(&config.file_id);
        let mut registry = SubscriptionRegistry::new();
        // Params for the document channel are computed at send time.
        registry.insert(document_channel.clone(), Value::Null);
        if config.subscribe_kernel_channel {
            registry.insert(
                messages::kernels_channel(&config.file_id),
                json!({ "file_id": config.file_id }),
            );
        }

        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let backoff = Backoff::new(&config.backoff);

        let shared = Arc::new(Shared {
            config,
            document_channel,
            correlator: Mutex::new(Correlator::new()),
            registry: Mutex::new(registry),
            dispatcher: Mutex::new(Dispatcher::new()),
            tracker: Mutex::new(ExecutionTracker::new()),
            builder: RwLock::new(NotebookBuilder::new(snapshot)),
            applied: Mutex::new(HashMap::new()),
            kernel_tx: watch::channel(None).0,
            state_tx,
        });

        let task = SessionTask {
            shared: Arc::clone(&shared),
            connector,
            snapshots,
            outbound_rx,
            shutdown_rx,
            backoff,
            last_inbound: Instant::now(),
            resync_pending: false,
        };
        let handle = tokio::spawn(task.run());

        Self {
            shared,
            outbound_tx,
            shutdown_tx,
            state_rx,
            task: tokio::sync::Mutex::new(Some(handle)),
        }
    }

    async fn wait_until_ready(&self) -> Result<(), SessionError> {
        let state = self
            .wait_for_state(
                |state| *state == SessionState::Ready || state.is_terminal(),
                Duration::MAX,
            )
            .await?;
        match state {
            SessionState::Ready => Ok(()),
            SessionState::Failed(error) => Err(error),
            _ => Err(SessionError::Closed),
        }
    }

    /// Shut down and wait for the session task. Idempotent.
    ///
    /// Outstanding waiters resolve with [`SessionError::Cancelled`].
    pub async fn close(&self) {
        // Fails only if the task already exited.
        let _ = self.shutdown_tx.send(true);
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("[Session] Session task ended abnormally: {}", e);
            }
            log::info!("[Session] Closed {}", self.shared.config.file_id);
        }
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    /// Current connection state.
    pub fn state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    /// Receiver notified on every state transition.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Wait until `predicate` holds for the state, up to `timeout`.
    pub async fn wait_for_state(
        &self,
        predicate: impl Fn(&SessionState) -> bool,
        timeout: Duration,
    ) -> Result<SessionState, SessionError> {
        let mut rx = self.state_rx.clone();
        let wait = async move {
            match rx.wait_for(|state| predicate(state)).await {
                Ok(state) => Ok(state.clone()),
                Err(_) => Err(SessionError::Closed),
            }
        };
        with_deadline(timeout, wait).await
    }

    /// Wait until the kernel reports `idle`, up to `timeout`.
    ///
    /// Fails early if the session closes or fails while waiting.
    pub async fn wait_for_kernel_idle(&self, timeout: Duration) -> Result<KernelStatus, SessionError> {
        let mut kernel_rx = self.shared.kernel_tx.subscribe();
        let mut state_rx = self.state_rx.clone();
        log::debug!("[Session] Waiting for kernel to be idle");
        let wait = async move {
            tokio::select! {
                biased;
                status = kernel_rx.wait_for(|status| {
                    status.as_ref().is_some_and(|s| s.execution_state == "idle")
                }) => match status {
                    Ok(status) => (*status).clone().ok_or(SessionError::Closed),
                    Err(_) => Err(SessionError::Closed),
                },
                state = state_rx.wait_for(SessionState::is_terminal) => match state.as_deref() {
                    Ok(SessionState::Failed(error)) => Err(error.clone()),
                    _ => Err(SessionError::Closed),
                },
            }
        };
        with_deadline(timeout, wait).await
    }

    /// Receiver for kernel status updates.
    pub fn kernel_changes(&self) -> watch::Receiver<Option<KernelStatus>> {
        self.shared.kernel_tx.subscribe()
    }

    fn ensure_ready(&self) -> Result<(), SessionError> {
        match &*self.state_rx.borrow() {
            SessionState::Ready => Ok(()),
            SessionState::Closed => Err(SessionError::Closed),
            SessionState::Failed(error) => Err(error.clone()),
            _ => Err(SessionError::NotConnected),
        }
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        match &*self.state_rx.borrow() {
            SessionState::Closed => Err(SessionError::Closed),
            SessionState::Failed(error) => Err(error.clone()),
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Document reads
    // ------------------------------------------------------------------

    /// Snapshot of the mirrored document.
    pub fn document(&self) -> Notebook {
        self.shared.builder().notebook().clone()
    }

    /// Snapshot of one cell.
    pub fn cell(&self, cell_id: &str) -> Option<Cell> {
        self.shared.builder().cell(cell_id).cloned()
    }

    /// Highest delta version applied.
    pub fn watermark(&self) -> u64 {
        self.shared.builder().watermark()
    }

    /// Last reported kernel status, if any.
    pub fn kernel_state(&self) -> Option<KernelStatus> {
        self.shared.kernel()
    }

    /// Channel carrying this document's deltas.
    pub fn document_channel(&self) -> &str {
        &self.shared.document_channel
    }

    /// Channels currently registered, in subscription order.
    pub fn subscriptions(&self) -> Vec<String> {
        self.shared.registry().channels()
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Call `callback` on the session task for every event of `kind`.
    ///
    /// Callbacks run inline with frame processing; keep them short.
    pub fn on_event<F>(&self, kind: EventKind, callback: F) -> CallbackId
    where
        F: Fn(&Inbound) + Send + Sync + 'static,
    {
        self.shared.dispatcher().register(kind, Arc::new(callback))
    }

    /// Unregister a callback. Returns whether it was registered.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        self.shared.dispatcher().remove(id)
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Send `request` and wait for its reply.
    ///
    /// Resolves exactly once: with the reply, [`SessionError::Rejected`] for
    /// an error event or `success: false`, [`SessionError::Timeout`], or
    /// [`SessionError::ConnectionLost`].
    pub async fn request(&self, request: Request, timeout: Duration) -> Result<Event, SessionError> {
        self.ensure_ready()?;
        let (transaction_id, deadline, rx) = self
            .shared
            .correlator()
            .register(request.reply_kind(), timeout);

        if self
            .outbound_tx
            .send(Outbound {
                transaction_id,
                request,
            })
            .is_err()
        {
            self.shared.correlator().remove(transaction_id);
            return Err(SessionError::Closed);
        }

        let event = self.await_reply(transaction_id, deadline, rx).await?;
        check_success(event)
    }

    async fn await_reply(
        &self,
        transaction_id: Uuid,
        deadline: Instant,
        mut rx: oneshot::Receiver<Reply>,
    ) -> Reply {
        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(SessionError::Cancelled),
            Err(_) => {
                if self.shared.correlator().remove(transaction_id) {
                    Err(SessionError::Timeout)
                } else {
                    // Resolved between the deadline and the removal.
                    rx.try_recv().unwrap_or(Err(SessionError::Timeout))
                }
            }
        }
    }

    /// Heartbeat round trip.
    pub async fn ping(&self) -> Result<Duration, SessionError> {
        let started = Instant::now();
        self.request(Request::Ping, self.shared.config.request_timeout())
            .await?;
        Ok(started.elapsed())
    }

    /// User record the connection is authenticated as.
    pub async fn whoami(&self) -> Result<Option<Value>, SessionError> {
        match self
            .request(Request::WhoAmI, self.shared.config.request_timeout())
            .await?
        {
            Event::WhoAmIReply { user } => Ok(user),
            other => Err(SessionError::ProtocolViolation(format!(
                "unexpected {} answering whoami",
                other.kind().as_str()
            ))),
        }
    }

    /// Add `channel` to the registry and subscribe now if ready.
    ///
    /// While reconnecting the subscription is deferred to the replay. A
    /// server rejection removes it from the registry again.
    pub async fn subscribe(&self, channel: &str, params: Value) -> Result<(), SessionError> {
        self.ensure_open()?;
        if channel == self.shared.document_channel {
            return Err(SessionError::InvalidState(
                "the document channel is managed by the session".to_string(),
            ));
        }

        let send_now = {
            let mut registry = self.shared.registry();
            registry.insert(channel, params.clone());
            *self.state_rx.borrow() == SessionState::Ready
        };
        if !send_now {
            log::debug!("[Session] Deferring subscription to {} until ready", channel);
            return Ok(());
        }

        let request = Request::Subscribe {
            channel: channel.to_string(),
            params,
        };
        match self
            .request(request, self.shared.config.request_timeout())
            .await
        {
            Ok(_) => Ok(()),
            Err(error @ SessionError::Rejected { .. }) => {
                log::error!("[Session] Subscription to {} rejected: {}", channel, error);
                self.shared.registry().remove(channel);
                Err(error)
            }
            // Still registered; the reconnect replay will subscribe it.
            Err(SessionError::ConnectionLost | SessionError::NotConnected) => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Remove `channel` from the registry and unsubscribe if ready.
    pub async fn unsubscribe(&self, channel: &str) -> Result<(), SessionError> {
        self.ensure_open()?;
        if channel == self.shared.document_channel {
            return Err(SessionError::InvalidState(
                "the document channel is managed by the session".to_string(),
            ));
        }

        let send_now = {
            let mut registry = self.shared.registry();
            if !registry.remove(channel) {
                return Ok(());
            }
            *self.state_rx.borrow() == SessionState::Ready
        };
        if !send_now {
            return Ok(());
        }

        let request = Request::Unsubscribe {
            channel: channel.to_string(),
        };
        match self
            .request(request, self.shared.config.request_timeout())
            .await
        {
            Ok(_) | Err(SessionError::ConnectionLost | SessionError::NotConnected) => Ok(()),
            Err(error) => Err(error),
        }
    }

    // ------------------------------------------------------------------
    // Document edits
    // ------------------------------------------------------------------

    /// Submit `op` and wait for the server to record it. With
    /// `wait_applied`, also wait until the broadcast copy has been applied
    /// to the local document.
    async fn submit(&self, op: DeltaOp, wait_applied: bool) -> Result<(), SessionError> {
        self.ensure_ready()?;
        let draft = DeltaDraft::new(op);
        let (delta_type, delta_action) = draft.op.kind();
        log::debug!(
            "[Session] Submitting {}/{} delta {}",
            delta_type,
            delta_action,
            draft.id
        );

        let applied_rx = if wait_applied {
            let (tx, rx) = oneshot::channel();
            let landed = Landed::for_op(&draft.op);
            self.shared
                .applied()
                .insert(draft.id, EditWaiter { landed, tx });
            Some(rx)
        } else {
            None
        };

        let request = Request::NewDelta {
            channel: self.shared.document_channel.clone(),
            delta: draft.to_wire(&self.shared.config.file_id),
        };
        let timeout = self.shared.config.request_timeout();
        if let Err(error) = self.request(request, timeout).await {
            self.shared.applied().remove(&draft.id);
            return Err(error);
        }

        let Some(rx) = applied_rx else {
            return Ok(());
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::Cancelled),
            Err(_) => {
                self.shared.applied().remove(&draft.id);
                Err(SessionError::Timeout)
            }
        }
    }

    fn require_cell(&self, cell_id: &str) -> Result<Cell, SessionError> {
        self.cell(cell_id)
            .ok_or_else(|| SessionError::CellNotFound(cell_id.to_string()))
    }

    fn applied_cell(&self, cell_id: &str) -> Result<Cell, SessionError> {
        let builder = self.shared.builder();
        match builder.cell(cell_id) {
            Some(cell) => Ok(cell.clone()),
            None if builder.was_deleted(cell_id) => Err(SessionError::CellDeleted(cell_id.to_string())),
            None => Err(SessionError::CellNotFound(cell_id.to_string())),
        }
    }

    /// Insert a new cell after `after_id`, or after the last cell.
    pub async fn add_cell(
        &self,
        cell_type: CellType,
        source: impl Into<String>,
        after_id: Option<&str>,
    ) -> Result<Cell, SessionError> {
        let after_id = match after_id {
            Some(after_id) => Some(self.require_cell(after_id)?.id),
            None => self.shared.builder().notebook().cells.last().map(|c| c.id.clone()),
        };
        let cell = Cell::new(Uuid::new_v4().to_string(), cell_type, source);
        let cell_id = cell.id.clone();

        self.submit(DeltaOp::AddCell { after_id, cell }, true).await?;
        self.applied_cell(&cell_id)
    }

    /// Remove a cell.
    pub async fn delete_cell(&self, cell_id: &str) -> Result<(), SessionError> {
        self.require_cell(cell_id)?;
        self.submit(
            DeltaOp::DeleteCell {
                cell_id: cell_id.to_string(),
            },
            true,
        )
        .await
    }

    /// Move a cell below `after_id`, or to the top.
    pub async fn move_cell(&self, cell_id: &str, after_id: Option<&str>) -> Result<(), SessionError> {
        self.require_cell(cell_id)?;
        if let Some(after_id) = after_id {
            self.require_cell(after_id)?;
        }
        self.submit(
            DeltaOp::MoveCell {
                cell_id: cell_id.to_string(),
                after_id: after_id.map(str::to_string),
            },
            true,
        )
        .await
    }

    /// Apply a text patch to a cell's source.
    pub async fn update_cell_content(&self, cell_id: &str, patch: &TextPatch) -> Result<Cell, SessionError> {
        let cell = self.require_cell(cell_id)?;
        // Reject locally what would fail for every client.
        if let Err(e) = patch.apply(&cell.source) {
            return Err(SessionError::InvalidState(format!(
                "patch does not apply to cell {cell_id}: {e}"
            )));
        }
        self.submit(
            DeltaOp::PatchContents {
                cell_id: cell_id.to_string(),
                patch: patch.clone(),
            },
            true,
        )
        .await?;
        self.applied_cell(cell_id)
    }

    /// Replace a cell's source outright.
    pub async fn replace_cell_content(
        &self,
        cell_id: &str,
        source: impl Into<String>,
    ) -> Result<Cell, SessionError> {
        self.require_cell(cell_id)?;
        self.submit(
            DeltaOp::ReplaceContents {
                cell_id: cell_id.to_string(),
                source: source.into(),
            },
            true,
        )
        .await?;
        self.applied_cell(cell_id)
    }

    /// Set a metadata value at `path`, creating intermediate objects.
    pub async fn update_cell_metadata(
        &self,
        cell_id: &str,
        path: &[&str],
        value: Value,
    ) -> Result<Cell, SessionError> {
        let cell = self.require_cell(cell_id)?;
        let prior_value = path
            .iter()
            .try_fold(None::<&Value>, |node, key| match node {
                None => cell.metadata.get(*key).map(Some),
                Some(node) => node.get(*key).map(Some),
            })
            .flatten()
            .cloned();

        self.submit(
            DeltaOp::UpdateCellMetadata {
                cell_id: cell_id.to_string(),
                path: path.iter().map(|key| (*key).to_string()).collect(),
                value,
                prior_value,
            },
            true,
        )
        .await?;
        self.applied_cell(cell_id)
    }

    /// Change a cell's type. Query cells are code cells flagged in the
    /// service metadata.
    pub async fn change_cell_type(&self, cell_id: &str, change: CellTypeChange) -> Result<Cell, SessionError> {
        let cell = self.require_cell(cell_id)?;
        let (cell_type, language) = match &change {
            CellTypeChange::Code { language } => (CellType::Code, Some(language.clone())),
            CellTypeChange::Markdown => (CellType::Markdown, Some("markdown".to_string())),
            CellTypeChange::Raw => (CellType::Raw, None),
            CellTypeChange::Query { .. } => (CellType::Code, Some("sql".to_string())),
        };

        self.submit(
            DeltaOp::ReplaceCellMetadata {
                cell_id: cell_id.to_string(),
                cell_type: Some(cell_type),
                language,
            },
            true,
        )
        .await?;

        if let CellTypeChange::Query {
            db_connection,
            assign_results_to,
        } = change
        {
            let mut service = match cell.metadata.get(SERVICE_METADATA_KEY) {
                Some(Value::Object(map)) => map.clone(),
                _ => Map::new(),
            };
            service.insert("cell_type".to_string(), json!("sql"));
            service.insert(
                "db_connection".to_string(),
                json!(db_connection.unwrap_or_else(|| constants::DEFAULT_DB_CONNECTION.to_string())),
            );
            service.insert(
                "assign_results_to".to_string(),
                json!(assign_results_to.unwrap_or_else(random_result_name)),
            );
            return self
                .update_cell_metadata(cell_id, &[SERVICE_METADATA_KEY], Value::Object(service))
                .await;
        }
        self.applied_cell(cell_id)
    }

    fn ensure_kernel_accepts_work(&self) -> Result<(), SessionError> {
        match self.shared.kernel() {
            Some(status) if !status.is_started() => Err(SessionError::InvalidState(
                "kernel is not started".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Queue a cell for execution.
    ///
    /// Fails with [`SessionError::InvalidState`] without sending anything if
    /// the cell is not code, is blank, or is already queued. The handle
    /// resolves with the final cell once the kernel reports `complete` or
    /// `error`.
    pub async fn queue_execution(&self, cell_id: &str) -> Result<ExecutionHandle, SessionError> {
        let cell = self.require_cell(cell_id)?;
        if cell.cell_type != CellType::Code {
            return Err(SessionError::InvalidState(format!(
                "cell {cell_id} is {}, not code",
                cell.cell_type.as_str()
            )));
        }
        if !cell.is_runnable() {
            return Err(SessionError::InvalidState(format!("cell {cell_id} is empty")));
        }
        self.ensure_ready()?;
        self.ensure_kernel_accepts_work()?;

        let handle = self.shared.tracker().reserve(cell_id)?;
        let op = DeltaOp::Execute {
            cell_id: Some(cell_id.to_string()),
            scope: ExecuteScope::Cell,
        };
        if let Err(error) = self.submit(op, false).await {
            self.shared.tracker().release(cell_id);
            return Err(error);
        }
        Ok(handle)
    }

    /// Queue a range of cells: everything up to `anchor`, everything from
    /// `anchor` on, or the whole notebook.
    ///
    /// One handle per runnable code cell in range. Cells already queued are
    /// skipped. Nothing is sent if no cell in range is runnable.
    pub async fn queue_execution_scope(
        &self,
        scope: ExecuteScope,
        anchor: Option<&str>,
    ) -> Result<Vec<ExecutionHandle>, SessionError> {
        if scope == ExecuteScope::Cell {
            let anchor = anchor.ok_or_else(|| {
                SessionError::InvalidState("single-cell execution needs a cell id".to_string())
            })?;
            return Ok(vec![self.queue_execution(anchor).await?]);
        }

        let cells = self.document().cells;
        let range: &[Cell] = match (scope, anchor) {
            (ExecuteScope::All, _) => &cells,
            (_, None) => {
                return Err(SessionError::InvalidState(format!(
                    "{scope:?} execution needs an anchor cell"
                )))
            }
            (ExecuteScope::Before, Some(anchor)) => {
                let index = self.index_of(&cells, anchor)?;
                &cells[..=index]
            }
            (_, Some(anchor)) => {
                let index = self.index_of(&cells, anchor)?;
                &cells[index..]
            }
        };
        let runnable: Vec<String> = range
            .iter()
            .filter(|cell| cell.is_runnable())
            .map(|cell| cell.id.clone())
            .collect();
        if runnable.is_empty() {
            log::info!("[Session] No runnable cells for {:?} execution", scope);
            return Ok(Vec::new());
        }
        self.ensure_ready()?;
        self.ensure_kernel_accepts_work()?;

        let handles: Vec<ExecutionHandle> = {
            let mut tracker = self.shared.tracker();
            runnable
                .iter()
                .filter_map(|cell_id| match tracker.reserve(cell_id) {
                    Ok(handle) => Some(handle),
                    Err(_) => {
                        log::debug!("[Session] Cell {} already queued; skipping", cell_id);
                        None
                    }
                })
                .collect()
        };
        if handles.is_empty() {
            return Ok(handles);
        }

        let op = DeltaOp::Execute {
            cell_id: match scope {
                ExecuteScope::All => None,
                _ => anchor.map(str::to_string),
            },
            scope,
        };
        if let Err(error) = self.submit(op, false).await {
            let mut tracker = self.shared.tracker();
            for handle in &handles {
                tracker.release(handle.cell_id());
            }
            return Err(error);
        }
        Ok(handles)
    }

    fn index_of(&self, cells: &[Cell], cell_id: &str) -> Result<usize, SessionError> {
        cells
            .iter()
            .position(|cell| cell.id == cell_id)
            .ok_or_else(|| SessionError::CellNotFound(cell_id.to_string()))
    }
}

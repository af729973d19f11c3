//! Shared fixtures for session integration tests: a scripted server over
//! the in-memory transport.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::sync::Arc;
use std::time::Duration;

use notebook_sync::transport::memory::{self, MemoryConnector, MemoryListener, ServerConnection};
use notebook_sync::{
    Cell, CellType, DocumentSnapshot, MemorySnapshots, Notebook, Session, SessionConfig,
};
use serde_json::{json, Value};

pub const FILE_ID: &str = "file-1";
pub const DOC_CHANNEL: &str = "files/file-1";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Config with a fast, jitter-free backoff and no kernel channel.
pub fn config() -> SessionConfig {
    let mut config = SessionConfig::new("http://memory/api", FILE_ID, "secret-token");
    config.subscribe_kernel_channel = false;
    config.request_timeout_ms = 2_000;
    config.handshake_timeout_ms = 2_000;
    config.backoff.initial_ms = 10;
    config.backoff.max_ms = 40;
    config.backoff.jitter_ms = 0;
    config
}

pub fn snapshot(version: u64, cells: Vec<Cell>) -> DocumentSnapshot {
    DocumentSnapshot {
        version,
        notebook: Notebook::with_cells(cells),
    }
}

pub fn code(id: &str, source: &str) -> Cell {
    Cell::new(id, CellType::Code, source)
}

pub fn markdown(id: &str, source: &str) -> Cell {
    Cell::new(id, CellType::Markdown, source)
}

/// Reply envelope echoing the request's transaction id and channel.
pub fn reply(request: &Value, event: &str, data: Value) -> Value {
    json!({
        "transaction_id": request["transaction_id"],
        "channel": request["channel"],
        "event": event,
        "data": data,
    })
}

/// Push envelope without a transaction id.
pub fn push(channel: &str, event: &str, data: Value) -> Value {
    json!({ "channel": channel, "event": event, "data": data })
}

/// Next JSON frame, failing the test after a second of silence.
pub async fn next_frame(conn: &mut ServerConnection) -> Value {
    tokio::time::timeout(Duration::from_secs(1), conn.recv_json())
        .await
        .expect("client went quiet")
        .expect("client hung up")
}

pub async fn accept(listener: &mut MemoryListener) -> ServerConnection {
    tokio::time::timeout(Duration::from_secs(1), listener.accept())
        .await
        .expect("no connection attempt")
        .expect("connector dropped")
}

/// Accept the connection and answer authentication.
pub async fn authenticate(listener: &mut MemoryListener) -> ServerConnection {
    let mut conn = accept(listener).await;
    let auth = next_frame(&mut conn).await;
    assert_eq!(auth["event"], "authenticate_request");
    conn.send_json(&reply(&auth, "authenticate_reply", json!({"success": true, "user": {"id": "u1"}})));
    conn
}

/// Authenticate and accept the document subscription, checking it resumes
/// from `from_version`.
pub async fn handshake(listener: &mut MemoryListener, from_version: u64) -> ServerConnection {
    let mut conn = authenticate(listener).await;
    let subscribe = next_frame(&mut conn).await;
    assert_eq!(subscribe["event"], "subscribe_request");
    assert_eq!(subscribe["channel"], DOC_CHANNEL);
    assert_eq!(subscribe["data"]["from_version"], from_version);
    conn.send_json(&reply(&subscribe, "subscribe_reply", json!({"success": true})));
    conn
}

/// Harness around one open session.
pub struct Harness {
    pub session: Arc<Session>,
    pub conn: ServerConnection,
    pub listener: MemoryListener,
    pub connector: MemoryConnector,
    pub snapshots: MemorySnapshots,
}

/// Open a session against `initial` with `config`.
pub async fn open_with(config: SessionConfig, initial: DocumentSnapshot) -> Harness {
    init_logging();
    let (connector, mut listener) = memory::pair();
    let snapshots = MemorySnapshots::new(initial.clone());

    let opening = tokio::spawn(Session::open(
        config,
        Arc::new(connector.clone()),
        Arc::new(snapshots.clone()),
    ));
    let conn = handshake(&mut listener, initial.version).await;
    let session = opening.await.expect("open panicked").expect("open failed");

    Harness {
        session: Arc::new(session),
        conn,
        listener,
        connector,
        snapshots,
    }
}

pub async fn open(initial: DocumentSnapshot) -> Harness {
    open_with(config(), initial).await
}

/// Poll until `check` holds, failing the test after a second.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held");
}

/// Play a server that accepts the next `count` delta submissions and
/// broadcasts each one back with the next version after `watermark`.
/// Returns the submitted deltas.
pub async fn accept_deltas(conn: &mut ServerConnection, count: usize, watermark: u64) -> Vec<Value> {
    let mut submitted = Vec::new();
    for version in (watermark + 1..).take(count) {
        let request = next_frame(conn).await;
        assert_eq!(request["event"], "new_delta_request");
        let mut delta = request["data"]["delta"].clone();
        conn.send_json(&reply(&request, "new_delta_reply", json!({"success": true})));
        delta["version"] = json!(version);
        conn.send_json(&push(DOC_CHANNEL, "new_delta_event", delta.clone()));
        submitted.push(delta);
    }
    submitted
}

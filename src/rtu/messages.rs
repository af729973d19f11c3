//! RTU wire format.
//!
//! Every frame, in both directions, is a JSON text frame with the same
//! envelope:
//!
//! ```json
//! {"transaction_id": "<uuid>", "channel": "files/<id>", "event": "subscribe_request", "data": {}}
//! ```
//!
//! Outbound frames are built from the closed [`Request`] enum. Inbound frames
//! are decoded once, here, into the closed [`Event`] enum; nothing past this
//! module looks at raw JSON.

// Rust guideline compliant 2026-02

use std::fmt;

use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::error::SessionError;
use crate::constants::SYSTEM_CHANNEL;
use crate::notebook::{Delta, ExecutionState};

/// Channel carrying document deltas for `file_id`.
pub fn files_channel(file_id: &str) -> String {
    format!("files/{file_id}")
}

/// Channel carrying kernel and cell execution status for `file_id`.
///
/// The kernel name embeds the first 20 hex digits of the file id with
/// hyphens stripped.
pub fn kernels_channel(file_id: &str) -> String {
    let simple: String = file_id.chars().filter(|c| *c != '-').take(20).collect();
    format!("kernels/notebook-kernel-{simple}")
}

/// Outbound request. Each one expects exactly one reply kind.
#[derive(Clone, PartialEq)]
pub enum Request {
    /// Authenticate this connection.
    Authenticate {
        /// Bearer token.
        token: String,
        /// Reported client type.
        client_type: String,
    },
    /// Subscribe to a channel.
    Subscribe {
        /// Target channel.
        channel: String,
        /// Channel-specific scope parameters.
        params: Value,
    },
    /// Leave a channel.
    Unsubscribe {
        /// Target channel.
        channel: String,
    },
    /// Application-level heartbeat.
    Ping,
    /// Ask the server who this connection is authenticated as.
    WhoAmI,
    /// Submit a delta.
    NewDelta {
        /// Document channel.
        channel: String,
        /// Wire form of the delta.
        delta: Value,
    },
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authenticate { client_type, .. } => f
                .debug_struct("Authenticate")
                .field("token", &"<redacted>")
                .field("client_type", client_type)
                .finish(),
            Self::Subscribe { channel, params } => f
                .debug_struct("Subscribe")
                .field("channel", channel)
                .field("params", params)
                .finish(),
            Self::Unsubscribe { channel } => {
                f.debug_struct("Unsubscribe").field("channel", channel).finish()
            }
            Self::Ping => f.write_str("Ping"),
            Self::WhoAmI => f.write_str("WhoAmI"),
            Self::NewDelta { channel, delta } => f
                .debug_struct("NewDelta")
                .field("channel", channel)
                .field("delta", delta)
                .finish(),
        }
    }
}

impl Request {
    /// Wire event name.
    pub fn event(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate_request",
            Self::Subscribe { .. } => "subscribe_request",
            Self::Unsubscribe { .. } => "unsubscribe_request",
            Self::Ping => "ping_request",
            Self::WhoAmI => "whoami_request",
            Self::NewDelta { .. } => "new_delta_request",
        }
    }

    /// Channel the request is sent on.
    pub fn channel(&self) -> &str {
        match self {
            Self::Authenticate { .. } | Self::Ping | Self::WhoAmI => SYSTEM_CHANNEL,
            Self::Subscribe { channel, .. }
            | Self::Unsubscribe { channel }
            | Self::NewDelta { channel, .. } => channel,
        }
    }

    /// Reply kind that resolves this request.
    pub fn reply_kind(&self) -> EventKind {
        match self {
            Self::Authenticate { .. } => EventKind::AuthenticateReply,
            Self::Subscribe { .. } => EventKind::SubscribeReply,
            Self::Unsubscribe { .. } => EventKind::UnsubscribeReply,
            Self::Ping => EventKind::PingReply,
            Self::WhoAmI => EventKind::WhoAmIReply,
            Self::NewDelta { .. } => EventKind::NewDeltaReply,
        }
    }

    fn data(&self) -> Value {
        match self {
            Self::Authenticate { token, client_type } => json!({
                "token": token,
                "rtu_client_type": client_type,
            }),
            Self::Subscribe { params, .. } => params.clone(),
            Self::Unsubscribe { .. } | Self::Ping | Self::WhoAmI => Value::Null,
            Self::NewDelta { delta, .. } => json!({ "delta": delta }),
        }
    }

    /// Serialize as an envelope tagged with `transaction_id`.
    pub fn encode(&self, transaction_id: Uuid) -> String {
        json!({
            "transaction_id": transaction_id,
            "channel": self.channel(),
            "event": self.event(),
            "data": self.data(),
        })
        .to_string()
    }
}

/// Discriminant of [`Event`], used to key callbacks and match replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `authenticate_reply`
    AuthenticateReply,
    /// `subscribe_reply`
    SubscribeReply,
    /// `unsubscribe_reply`
    UnsubscribeReply,
    /// `ping_reply`
    PingReply,
    /// `whoami_reply`
    WhoAmIReply,
    /// `new_delta_reply`
    NewDeltaReply,
    /// `new_delta_event`
    NewDeltas,
    /// `bulk_cell_state_update_event`
    CellStates,
    /// `kernel_status_update_event`
    KernelStatus,
    /// Any RTU error event.
    Error,
    /// `inconsistent_state_event`
    InconsistentState,
    /// Event this client does not know.
    Unrecognized,
}

impl EventKind {
    /// Wire event name (the generic `error` for RTU error events).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthenticateReply => "authenticate_reply",
            Self::SubscribeReply => "subscribe_reply",
            Self::UnsubscribeReply => "unsubscribe_reply",
            Self::PingReply => "ping_reply",
            Self::WhoAmIReply => "whoami_reply",
            Self::NewDeltaReply => "new_delta_reply",
            Self::NewDeltas => "new_delta_event",
            Self::CellStates => "bulk_cell_state_update_event",
            Self::KernelStatus => "kernel_status_update_event",
            Self::Error => "error",
            Self::InconsistentState => "inconsistent_state_event",
            Self::Unrecognized => "unrecognized",
        }
    }
}

/// RTU error event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RtuErrorKind {
    /// Request did not match any server handler.
    InvalidEvent,
    /// Request payload failed validation.
    InvalidData,
    /// Not authenticated, or not allowed.
    PermissionDenied,
    /// A submitted delta was refused.
    DeltaRejected,
}

impl RtuErrorKind {
    /// Wire event name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidEvent => "invalid_event",
            Self::InvalidData => "invalid_data",
            Self::PermissionDenied => "permission_denied",
            Self::DeltaRejected => "delta_rejected",
        }
    }
}

/// Execution state of one cell as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CellState {
    /// Cell id.
    pub cell_id: String,
    /// Reported state.
    pub state: ExecutionState,
}

/// Kernel session status.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "RawKernelStatus")]
pub struct KernelStatus {
    /// Kernel session id.
    pub session_id: Option<String>,
    /// Kernel name, e.g. `python3`.
    pub name: Option<String>,
    /// Kernel execution state, e.g. `idle`, `busy`, `not_started`.
    pub execution_state: String,
}

#[derive(Deserialize)]
struct RawKernelStatus {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    kernel: Option<RawKernelDetails>,
    #[serde(default)]
    execution_state: Option<String>,
}

#[derive(Deserialize)]
struct RawKernelDetails {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    execution_state: Option<String>,
}

impl From<RawKernelStatus> for KernelStatus {
    fn from(raw: RawKernelStatus) -> Self {
        let (name, nested_state) = match raw.kernel {
            Some(kernel) => (kernel.name, kernel.execution_state),
            None => (None, None),
        };
        Self {
            session_id: raw.session_id,
            name,
            execution_state: nested_state
                .or(raw.execution_state)
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

impl KernelStatus {
    /// Whether the kernel can accept executions.
    pub fn is_started(&self) -> bool {
        self.execution_state != "not_started"
    }
}

/// Payload of a document-channel `subscribe_reply`.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SubscribeReply {
    /// Whether the subscription was accepted.
    #[serde(default = "default_true")]
    pub success: bool,
    /// Deltas the client has not seen yet, in order.
    #[serde(default)]
    pub deltas_to_apply: Vec<Delta>,
    /// Server's latest version for the document.
    #[serde(default)]
    pub latest_version: Option<u64>,
    /// Execution state of every cell the kernel knows about.
    #[serde(default)]
    pub cell_states: Vec<CellState>,
    /// Current kernel session, if one is alive.
    #[serde(default)]
    pub kernel_session: Option<KernelStatus>,
}

fn default_true() -> bool {
    true
}

/// Decoded inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Result of `authenticate_request`.
    AuthenticateReply {
        /// Whether the token was accepted.
        success: bool,
        /// Authenticated user record.
        user: Option<Value>,
    },
    /// Result of `subscribe_request`.
    SubscribeReply(SubscribeReply),
    /// Result of `unsubscribe_request`.
    UnsubscribeReply {
        /// Whether the server acknowledged.
        success: bool,
    },
    /// Heartbeat answer.
    PingReply,
    /// Result of `whoami_request`.
    WhoAmIReply {
        /// Authenticated user record.
        user: Option<Value>,
    },
    /// Result of `new_delta_request`. The delta itself arrives as [`Event::NewDeltas`].
    NewDeltaReply {
        /// Whether the delta was recorded.
        success: bool,
    },
    /// Broadcast deltas, in order.
    NewDeltas(Vec<Delta>),
    /// Cell execution states.
    CellStates(Vec<CellState>),
    /// Kernel session status.
    KernelStatus(KernelStatus),
    /// Server-side error for a request.
    Error {
        /// Error event name.
        kind: RtuErrorKind,
        /// Server-provided detail.
        message: String,
    },
    /// The server believes this client's document has diverged.
    InconsistentState {
        /// Server-provided detail.
        message: String,
    },
    /// Event name this client does not handle.
    Unrecognized {
        /// Wire event name.
        event: String,
        /// Raw payload.
        data: Value,
    },
}

impl Event {
    /// Discriminant.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::AuthenticateReply { .. } => EventKind::AuthenticateReply,
            Self::SubscribeReply(_) => EventKind::SubscribeReply,
            Self::UnsubscribeReply { .. } => EventKind::UnsubscribeReply,
            Self::PingReply => EventKind::PingReply,
            Self::WhoAmIReply { .. } => EventKind::WhoAmIReply,
            Self::NewDeltaReply { .. } => EventKind::NewDeltaReply,
            Self::NewDeltas(_) => EventKind::NewDeltas,
            Self::CellStates(_) => EventKind::CellStates,
            Self::KernelStatus(_) => EventKind::KernelStatus,
            Self::Error { .. } => EventKind::Error,
            Self::InconsistentState { .. } => EventKind::InconsistentState,
            Self::Unrecognized { .. } => EventKind::Unrecognized,
        }
    }

    /// Whether this event may resolve a pending request.
    ///
    /// Push events never do, even when they carry a transaction id.
    pub fn is_reply(&self) -> bool {
        matches!(
            self.kind(),
            EventKind::AuthenticateReply
                | EventKind::SubscribeReply
                | EventKind::UnsubscribeReply
                | EventKind::PingReply
                | EventKind::WhoAmIReply
                | EventKind::NewDeltaReply
                | EventKind::Error
        )
    }
}

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    /// Correlation id, if the server echoed one.
    pub transaction_id: Option<Uuid>,
    /// Channel the frame arrived on.
    pub channel: String,
    /// Decoded payload.
    pub event: Event,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    transaction_id: Option<Uuid>,
    #[serde(default)]
    channel: String,
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct SuccessData {
    #[serde(default = "default_true")]
    success: bool,
}

#[derive(Deserialize)]
struct AuthenticateData {
    success: bool,
    #[serde(default)]
    user: Option<Value>,
}

#[derive(Deserialize)]
struct CellStatesData {
    cell_states: Vec<CellState>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DeltaPayload {
    Batch { deltas: Vec<Delta> },
    Single(Delta),
}

/// Decode one text frame.
pub fn decode(text: &str) -> Result<Inbound, SessionError> {
    let envelope: Envelope = serde_json::from_str(text)
        .map_err(|e| SessionError::ProtocolViolation(format!("bad envelope: {e}")))?;
    let Envelope {
        transaction_id,
        channel,
        event: name,
        data,
    } = envelope;

    let event = decode_event(&name, data)
        .map_err(|e| SessionError::ProtocolViolation(format!("bad {name} payload: {e}")))?;

    Ok(Inbound {
        transaction_id,
        channel,
        event,
    })
}

fn decode_event(name: &str, data: Value) -> Result<Event, serde_json::Error> {
    let event = match name {
        "authenticate_reply" => {
            let data: AuthenticateData = serde_json::from_value(data)?;
            Event::AuthenticateReply {
                success: data.success,
                user: data.user,
            }
        }
        "subscribe_reply" => Event::SubscribeReply(if data.is_null() {
            SubscribeReply {
                success: true,
                ..SubscribeReply::default()
            }
        } else {
            serde_json::from_value(data)?
        }),
        "unsubscribe_reply" => Event::UnsubscribeReply {
            success: success_of(data)?,
        },
        "ping_reply" | "ping_response" => Event::PingReply,
        "whoami_reply" | "whoami_response" => Event::WhoAmIReply {
            user: data.get("user").cloned(),
        },
        "new_delta_reply" => Event::NewDeltaReply {
            success: success_of(data)?,
        },
        "new_delta_event" => Event::NewDeltas(match serde_json::from_value(data)? {
            DeltaPayload::Batch { deltas } => deltas,
            DeltaPayload::Single(delta) => vec![delta],
        }),
        "bulk_cell_state_update_event" => {
            let data: CellStatesData = serde_json::from_value(data)?;
            Event::CellStates(data.cell_states)
        }
        "kernel_status_update_event" => Event::KernelStatus(serde_json::from_value(data)?),
        "invalid_event" => error_event(RtuErrorKind::InvalidEvent, &data),
        "invalid_data" => error_event(RtuErrorKind::InvalidData, &data),
        "permission_denied" => error_event(RtuErrorKind::PermissionDenied, &data),
        "delta_rejected" => error_event(RtuErrorKind::DeltaRejected, &data),
        "inconsistent_state_event" => Event::InconsistentState {
            message: message_of(&data),
        },
        other => Event::Unrecognized {
            event: other.to_string(),
            data,
        },
    };
    Ok(event)
}

fn success_of(data: Value) -> Result<bool, serde_json::Error> {
    if data.is_null() {
        return Ok(true);
    }
    let data: SuccessData = serde_json::from_value(data)?;
    Ok(data.success)
}

fn error_event(kind: RtuErrorKind, data: &Value) -> Event {
    Event::Error {
        kind,
        message: message_of(data),
    }
}

/// Human-readable detail from an error payload (`message`, or `cause` for rejected deltas).
fn message_of(data: &Value) -> String {
    ["message", "cause"]
        .iter()
        .find_map(|key| data.get(*key))
        .map(|value| match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notebook::DeltaOp;

    #[test]
    fn channel_names() {
        assert_eq!(files_channel("abc"), "files/abc");
        assert_eq!(
            kernels_channel("0f4e5b1c-9a2d-4c3b-8e7f-1a2b3c4d5e6f"),
            "kernels/notebook-kernel-0f4e5b1c9a2d4c3b8e7f"
        );
    }

    #[test]
    fn authenticate_request_envelope() {
        let tx = Uuid::new_v4();
        let request = Request::Authenticate {
            token: "secret".into(),
            client_type: "notebook-sync".into(),
        };
        let frame: Value = serde_json::from_str(&request.encode(tx)).unwrap();

        assert_eq!(frame["transaction_id"], tx.to_string());
        assert_eq!(frame["channel"], "system");
        assert_eq!(frame["event"], "authenticate_request");
        assert_eq!(frame["data"]["token"], "secret");
        assert_eq!(frame["data"]["rtu_client_type"], "notebook-sync");
        assert_eq!(request.reply_kind(), EventKind::AuthenticateReply);
    }

    #[test]
    fn debug_redacts_token() {
        let request = Request::Authenticate {
            token: "super-secret".into(),
            client_type: "x".into(),
        };
        assert!(!format!("{request:?}").contains("super-secret"));
    }

    #[test]
    fn new_delta_request_wraps_delta() {
        let request = Request::NewDelta {
            channel: files_channel("f"),
            delta: json!({"id": "d"}),
        };
        let frame: Value = serde_json::from_str(&request.encode(Uuid::new_v4())).unwrap();
        assert_eq!(frame["channel"], "files/f");
        assert_eq!(frame["data"]["delta"]["id"], "d");
    }

    #[test]
    fn decodes_authenticate_reply() {
        let tx = Uuid::new_v4();
        let inbound = decode(
            &json!({
                "transaction_id": tx,
                "channel": "system",
                "event": "authenticate_reply",
                "data": {"success": true, "user": {"id": "u1"}}
            })
            .to_string(),
        )
        .unwrap();

        assert_eq!(inbound.transaction_id, Some(tx));
        assert_eq!(
            inbound.event,
            Event::AuthenticateReply {
                success: true,
                user: Some(json!({"id": "u1"})),
            }
        );
        assert!(inbound.event.is_reply());
    }

    #[test]
    fn decodes_subscribe_reply_with_backlog() {
        let delta_id = Uuid::new_v4();
        let inbound = decode(
            &json!({
                "transaction_id": Uuid::new_v4(),
                "channel": "files/f",
                "event": "subscribe_reply",
                "data": {
                    "success": true,
                    "latest_version": 7,
                    "deltas_to_apply": [{
                        "id": delta_id, "version": 7,
                        "delta_type": "nb_cells", "delta_action": "delete",
                        "resource_id": "__NULL_RESOURCE__",
                        "properties": {"id": "a"}
                    }],
                    "cell_states": [{"cell_id": "a", "state": "executing"}],
                    "kernel_session": {"session_id": "s1", "kernel": {"name": "python3", "execution_state": "idle"}}
                }
            })
            .to_string(),
        )
        .unwrap();

        let Event::SubscribeReply(reply) = inbound.event else {
            panic!("expected subscribe reply");
        };
        assert_eq!(reply.latest_version, Some(7));
        assert_eq!(reply.deltas_to_apply[0].id, delta_id);
        assert_eq!(
            reply.deltas_to_apply[0].op,
            DeltaOp::DeleteCell { cell_id: "a".into() }
        );
        assert_eq!(reply.cell_states[0].state, ExecutionState::Running);
        let kernel = reply.kernel_session.unwrap();
        assert_eq!(kernel.name.as_deref(), Some("python3"));
        assert!(kernel.is_started());
    }

    #[test]
    fn new_delta_event_single_or_batch() {
        let delta = json!({
            "id": Uuid::new_v4(), "version": 3,
            "delta_type": "cell_contents", "delta_action": "replace",
            "resource_id": "a", "properties": {"source": "x"}
        });

        let single = decode(&json!({"channel": "files/f", "event": "new_delta_event", "data": delta}).to_string())
            .unwrap();
        let batch = decode(
            &json!({"channel": "files/f", "event": "new_delta_event", "data": {"deltas": [delta, delta]}})
                .to_string(),
        )
        .unwrap();

        assert!(matches!(single.event, Event::NewDeltas(ref d) if d.len() == 1));
        assert!(matches!(batch.event, Event::NewDeltas(ref d) if d.len() == 2));
        assert!(!single.event.is_reply());
    }

    #[test]
    fn decodes_kernel_channel_events() {
        let states = decode(
            &json!({
                "channel": "kernels/notebook-kernel-abc",
                "event": "bulk_cell_state_update_event",
                "data": {"cell_states": [{"cell_id": "a", "state": "finished_with_no_error"}]}
            })
            .to_string(),
        )
        .unwrap();
        assert_eq!(
            states.event,
            Event::CellStates(vec![CellState {
                cell_id: "a".into(),
                state: ExecutionState::Complete,
            }])
        );

        let status = decode(
            &json!({
                "channel": "kernels/notebook-kernel-abc",
                "event": "kernel_status_update_event",
                "data": {"session_id": "s", "kernel": {"name": "python3", "execution_state": "not_started"}}
            })
            .to_string(),
        )
        .unwrap();
        let Event::KernelStatus(status) = status.event else {
            panic!("expected kernel status");
        };
        assert!(!status.is_started());
    }

    #[test]
    fn decodes_error_events() {
        let denied = decode(
            &json!({"transaction_id": Uuid::new_v4(), "channel": "system", "event": "permission_denied",
                    "data": {"message": "nope"}})
            .to_string(),
        )
        .unwrap();
        assert_eq!(
            denied.event,
            Event::Error {
                kind: RtuErrorKind::PermissionDenied,
                message: "nope".into(),
            }
        );
        assert!(denied.event.is_reply());

        let rejected = decode(
            &json!({"channel": "files/f", "event": "delta_rejected", "data": {"cause": "stale"}}).to_string(),
        )
        .unwrap();
        assert!(matches!(rejected.event, Event::Error { kind: RtuErrorKind::DeltaRejected, ref message } if message == "stale"));
    }

    #[test]
    fn heartbeat_reply_aliases() {
        for name in ["ping_reply", "ping_response"] {
            let inbound = decode(&json!({"channel": "system", "event": name}).to_string()).unwrap();
            assert_eq!(inbound.event, Event::PingReply);
        }
    }

    #[test]
    fn unknown_events_are_kept_not_rejected() {
        let inbound = decode(
            &json!({"channel": "files/f", "event": "usage_metrics_event", "data": {"cpu": 1}}).to_string(),
        )
        .unwrap();
        assert_eq!(inbound.event.kind(), EventKind::Unrecognized);
    }

    #[test]
    fn malformed_frames_are_protocol_violations() {
        assert!(matches!(decode("not json"), Err(SessionError::ProtocolViolation(_))));
        assert!(matches!(
            decode(r#"{"channel": "files/f", "event": "new_delta_event", "data": {"bogus": true}}"#),
            Err(SessionError::ProtocolViolation(_))
        ));
        assert!(matches!(
            decode(r#"{"channel": "system", "event": "authenticate_reply", "data": {}}"#),
            Err(SessionError::ProtocolViolation(_))
        ));
    }
}

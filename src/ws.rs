//! WebSocket plumbing for the realtime endpoint.
//!
//! [`open`] performs the handshake and returns the socket already split
//! into the [`FrameSink`] / [`FrameSource`] halves the session task drives.
//! Nothing outside this module names a `tokio-tungstenite` type.

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request as HandshakeRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::transport::{FrameSink, FrameSource, Transport};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Close code for an orderly shutdown.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code reported when the peer's close frame had no status.
pub const CLOSE_NO_STATUS: u16 = 1005;

/// One transport frame, independent of the WebSocket library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    /// UTF-8 text; every protocol envelope travels as one of these.
    Text(String),
    /// Binary payload. The protocol never uses it.
    Binary(Vec<u8>),
    /// Transport ping; answered with a pong carrying the same bytes.
    Ping(Vec<u8>),
    /// Transport pong.
    Pong(Vec<u8>),
    /// Peer is closing.
    Close {
        /// Close status code.
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
    },
}

impl WsMessage {
    /// Library frame to ours. Raw continuation frames have no counterpart.
    fn from_socket(message: Message) -> Option<Self> {
        let converted = match message {
            Message::Text(text) => Self::Text(text.to_string()),
            Message::Binary(data) => Self::Binary(data.to_vec()),
            Message::Ping(data) => Self::Ping(data.to_vec()),
            Message::Pong(data) => Self::Pong(data.to_vec()),
            Message::Close(frame) => match frame {
                Some(frame) => Self::Close {
                    code: frame.code.into(),
                    reason: frame.reason.to_string(),
                },
                None => Self::Close {
                    code: CLOSE_NO_STATUS,
                    reason: String::new(),
                },
            },
            Message::Frame(_) => return None,
        };
        Some(converted)
    }
}

struct SocketWriter {
    sink: SplitSink<Socket, Message>,
}

#[async_trait]
impl FrameSink for SocketWriter {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(Message::Text(text.to_string()))
            .await
            .context("WebSocket text send failed")
    }

    async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(Message::Pong(data))
            .await
            .context("WebSocket pong failed")
    }

    async fn close(&mut self) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "session closed".into(),
        };
        if let Err(e) = self.sink.send(Message::Close(Some(frame))).await {
            log::debug!("[WS] Close frame not sent: {}", e);
        }
        self.sink.close().await.context("WebSocket close failed")
    }
}

struct SocketReader {
    stream: SplitStream<Socket>,
}

#[async_trait]
impl FrameSource for SocketReader {
    async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            match self.stream.next().await? {
                Ok(message) => {
                    if let Some(converted) = WsMessage::from_socket(message) {
                        return Some(Ok(converted));
                    }
                }
                Err(e) => return Some(Err(anyhow::anyhow!("WebSocket read error: {e}"))),
            }
        }
    }
}

/// Handshake request for `url` carrying `headers`.
fn handshake_request(url: &str, headers: &[(String, String)]) -> Result<HandshakeRequest> {
    let mut request = url
        .into_client_request()
        .with_context(|| format!("invalid realtime URL: {url}"))?;
    for (name, value) in headers {
        let name_header = HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name: {name}"))?;
        let value_header = HeaderValue::from_str(value)
            .with_context(|| format!("invalid header value for {name}"))?;
        request.headers_mut().insert(name_header, value_header);
    }
    Ok(request)
}

/// Open a WebSocket to `url` and split it into session halves.
pub async fn open(url: &str, headers: &[(String, String)]) -> Result<Transport> {
    let request = handshake_request(url, headers)?;
    let (socket, response) = tokio_tungstenite::connect_async(request)
        .await
        .with_context(|| format!("WebSocket handshake with {url} failed"))?;
    log::debug!("[WS] Connected to {} ({})", url, response.status());

    let (sink, stream) = socket.split();
    Ok((
        Box::new(SocketWriter { sink }),
        Box::new(SocketReader { stream }),
    ))
}

/// Rewrite an `http(s)://` URL to `ws(s)://`. Other schemes pass through.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    match url.split_once("://") {
        Some(("https", rest)) => format!("wss://{rest}"),
        Some(("http", rest)) => format!("ws://{rest}"),
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_to_ws_scheme() {
        assert_eq!(http_to_ws_scheme("https://app.example.com/gate/api"), "wss://app.example.com/gate/api");
        assert_eq!(http_to_ws_scheme("http://localhost:8000"), "ws://localhost:8000");
        assert_eq!(http_to_ws_scheme("wss://app.example.com/v1/rtu"), "wss://app.example.com/v1/rtu");
        assert_eq!(
            http_to_ws_scheme("https://a.example/next?to=http://b"),
            "wss://a.example/next?to=http://b"
        );
    }

    #[test]
    fn test_handshake_request_carries_headers() {
        let headers = vec![("Origin".to_string(), "https://app.example.com".to_string())];
        let request = handshake_request("wss://app.example.com/v1/rtu", &headers).unwrap();
        assert_eq!(request.headers()["origin"], "https://app.example.com");
    }

    #[test]
    fn test_handshake_request_rejects_bad_input() {
        assert!(handshake_request("not a url", &[]).is_err());
        let bad = vec![("bad header".to_string(), "x".to_string())];
        assert!(handshake_request("ws://localhost/v1/rtu", &bad).is_err());
    }

    #[test]
    fn test_close_without_status_maps_to_no_status() {
        assert_eq!(
            WsMessage::from_socket(Message::Close(None)),
            Some(WsMessage::Close {
                code: CLOSE_NO_STATUS,
                reason: String::new()
            })
        );
        assert_eq!(
            WsMessage::from_socket(Message::Text("{}".into())),
            Some(WsMessage::Text("{}".into()))
        );
    }

    #[tokio::test]
    async fn test_open_unreachable_host_fails() {
        assert!(open("ws://127.0.0.1:1/v1/rtu", &[]).await.is_err());
    }
}

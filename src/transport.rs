//! Connector abstraction over the physical transport.
//!
//! The session task only sees a [`FrameSink`] / [`FrameSource`] pair. A
//! [`Connector`] produces a fresh pair per connection attempt, so the
//! reconnect state machine can be driven by a real WebSocket
//! ([`WsConnector`]) or by the in-process [`memory`] transport.

// Rust guideline compliant 2026-02

use anyhow::Result;
use async_trait::async_trait;

use crate::ws::WsMessage;

/// Outbound half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one UTF-8 text frame.
    async fn send_text(&mut self, text: &str) -> Result<()>;
    /// Answer a transport-level ping.
    async fn send_pong(&mut self, data: Vec<u8>) -> Result<()>;
    /// Orderly close. Errors are informational; the connection is gone either way.
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, `None` once the stream ended. Must be cancel-safe.
    async fn recv(&mut self) -> Option<Result<WsMessage>>;
}

/// One established connection.
pub type Transport = (Box<dyn FrameSink>, Box<dyn FrameSource>);

/// Opens connections to the realtime endpoint.
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    /// Establish a new connection to `url`.
    async fn connect(&self, url: &str) -> Result<Transport>;
}

/// Connects over a real WebSocket.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    headers: Vec<(String, String)>,
}

impl WsConnector {
    /// Connector with no extra handshake headers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a header sent with every WebSocket handshake.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Transport> {
        crate::ws::open(url, &self.headers).await
    }
}

pub mod memory {
    //! In-process transport.
    //!
    //! [`MemoryConnector`] hands each accepted connection's server end to a
    //! [`MemoryListener`], which lets tests (and embedders) play the server
    //! role frame by frame without sockets.

    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex, PoisonError};

    use anyhow::{Context, Result};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::{Connector, FrameSink, FrameSource, Transport};
    use crate::ws::{WsMessage, CLOSE_NORMAL};

    #[derive(Debug, Default)]
    struct ConnectorState {
        attempts: u32,
        urls: Vec<String>,
        /// Scripted failures consumed by upcoming attempts.
        refusals: VecDeque<String>,
    }

    /// Connector whose connections terminate in a [`MemoryListener`].
    #[derive(Debug, Clone)]
    pub struct MemoryConnector {
        state: Arc<Mutex<ConnectorState>>,
        accept_tx: mpsc::UnboundedSender<ServerConnection>,
    }

    /// Receives the server end of every connection the connector opens.
    #[derive(Debug)]
    pub struct MemoryListener {
        accept_rx: mpsc::UnboundedReceiver<ServerConnection>,
    }

    /// Create a connected connector/listener pair.
    pub fn pair() -> (MemoryConnector, MemoryListener) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            MemoryConnector {
                state: Arc::new(Mutex::new(ConnectorState::default())),
                accept_tx,
            },
            MemoryListener { accept_rx },
        )
    }

    impl MemoryConnector {
        /// Make the next connection attempt fail with `reason`.
        pub fn refuse_next(&self, reason: impl Into<String>) {
            self.lock().refusals.push_back(reason.into());
        }

        /// Number of connection attempts so far, refused ones included.
        pub fn attempts(&self) -> u32 {
            self.lock().attempts
        }

        /// URLs passed to each attempt, in order.
        pub fn urls(&self) -> Vec<String> {
            self.lock().urls.clone()
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, ConnectorState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, url: &str) -> Result<Transport> {
            {
                let mut state = self.lock();
                state.attempts += 1;
                state.urls.push(url.to_string());
                if let Some(reason) = state.refusals.pop_front() {
                    anyhow::bail!("connection refused: {reason}");
                }
            }

            let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();
            let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
            self.accept_tx
                .send(ServerConnection {
                    incoming: to_server_rx,
                    outgoing: to_client_tx,
                })
                .ok()
                .context("memory listener dropped")?;

            Ok((
                Box::new(MemorySink { tx: to_server_tx }),
                Box::new(MemorySource { rx: to_client_rx }),
            ))
        }
    }

    impl MemoryListener {
        /// Next accepted connection, `None` once every connector is gone.
        pub async fn accept(&mut self) -> Option<ServerConnection> {
            self.accept_rx.recv().await
        }
    }

    /// Server end of one in-memory connection.
    ///
    /// Dropping it ends the client's stream, which the client sees as an
    /// abnormal closure.
    #[derive(Debug)]
    pub struct ServerConnection {
        incoming: mpsc::UnboundedReceiver<WsMessage>,
        outgoing: mpsc::UnboundedSender<WsMessage>,
    }

    impl ServerConnection {
        /// Next frame from the client, `None` after the client hung up.
        pub async fn recv(&mut self) -> Option<WsMessage> {
            self.incoming.recv().await
        }

        /// Next text frame from the client parsed as JSON, skipping control frames.
        pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
            loop {
                match self.incoming.recv().await? {
                    WsMessage::Text(text) => match serde_json::from_str(&text) {
                        Ok(value) => return Some(value),
                        Err(e) => log::warn!("[Memory] Client sent non-JSON text: {}", e),
                    },
                    WsMessage::Close { .. } => return None,
                    _ => {}
                }
            }
        }

        /// Non-blocking check for a pending client frame.
        pub fn try_recv(&mut self) -> Option<WsMessage> {
            self.incoming.try_recv().ok()
        }

        /// Send any frame to the client. Returns `false` if the client is gone.
        pub fn send(&self, message: WsMessage) -> bool {
            self.outgoing.send(message).is_ok()
        }

        /// Send a JSON text frame to the client.
        pub fn send_json(&self, value: &serde_json::Value) -> bool {
            self.send(WsMessage::Text(value.to_string()))
        }

        /// Send a close frame with `code`.
        pub fn close(&self, code: u16, reason: &str) -> bool {
            self.send(WsMessage::Close {
                code,
                reason: reason.to_string(),
            })
        }
    }

    struct MemorySink {
        tx: mpsc::UnboundedSender<WsMessage>,
    }

    struct MemorySource {
        rx: mpsc::UnboundedReceiver<WsMessage>,
    }

    #[async_trait]
    impl FrameSink for MemorySink {
        async fn send_text(&mut self, text: &str) -> Result<()> {
            self.tx
                .send(WsMessage::Text(text.to_string()))
                .ok()
                .context("memory peer hung up")
        }

        async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
            self.tx
                .send(WsMessage::Pong(data))
                .ok()
                .context("memory peer hung up")
        }

        async fn close(&mut self) -> Result<()> {
            self.tx
                .send(WsMessage::Close {
                    code: CLOSE_NORMAL,
                    reason: "client closing".to_string(),
                })
                .ok()
                .context("memory peer hung up")
        }
    }

    #[async_trait]
    impl FrameSource for MemorySource {
        async fn recv(&mut self) -> Option<Result<WsMessage>> {
            self.rx.recv().await.map(Ok)
        }
    }
}

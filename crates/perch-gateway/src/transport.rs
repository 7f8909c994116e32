//! Duplex message-framed transport
//!
//! The session talks to the wire through the [`Connector`] family of traits;
//! production uses the WebSocket implementation, tests use in-memory pipes.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};
use url::Url;

use crate::protocol::Payload;

/// Transport faults, carrying their resume classification where the wire
/// provides one.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("connection closed (code {code:?}): {reason}")]
    Closed {
        resumable: bool,
        code: Option<u16>,
        reason: String,
    },
    #[error("failed to decode frame: {0}")]
    Decode(String),
    #[error("transport i/o failure: {0}")]
    Io(String),
}

/// Sole writer half of a connection.
#[async_trait]
pub trait FrameSender: Send {
    async fn send(&mut self, payload: &Payload) -> Result<(), TransportError>;
    async fn close(&mut self);
}

/// Reader half of a connection.
#[async_trait]
pub trait FrameReceiver: Send {
    async fn recv(&mut self) -> Result<Payload, TransportError>;
}

/// Opens duplex connections to a fixed endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Tx: FrameSender + 'static;
    type Rx: FrameReceiver + 'static;

    async fn connect(&self, endpoint: &Url) -> Result<(Self::Tx, Self::Rx), TransportError>;
}

// ── WebSocket implementation ────────────────────────────────────

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close codes after which the gateway refuses to resume the session:
/// authentication failure and the sharding/intents family. Everything else
/// abnormal permits a resume attempt.
fn close_permits_resume(code: u16) -> bool {
    match code {
        // Normal closure invalidates the session.
        1000 | 1001 => false,
        4004 => false,
        4010..=4014 => false,
        _ => true,
    }
}

pub struct WsConnector;

pub struct WsSender(SplitSink<WsStream, Message>);

pub struct WsReceiver(SplitStream<WsStream>);

#[async_trait]
impl Connector for WsConnector {
    type Tx = WsSender;
    type Rx = WsReceiver;

    async fn connect(&self, endpoint: &Url) -> Result<(Self::Tx, Self::Rx), TransportError> {
        debug!("connecting to {endpoint}");
        let (stream, _resp) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (tx, rx) = stream.split();
        Ok((WsSender(tx), WsReceiver(rx)))
    }
}

#[async_trait]
impl FrameSender for WsSender {
    async fn send(&mut self, payload: &Payload) -> Result<(), TransportError> {
        let raw = serde_json::to_string(payload)
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        self.0
            .send(Message::text(raw))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.0.close().await {
            debug!("error closing transport: {e}");
        }
    }
}

#[async_trait]
impl FrameReceiver for WsReceiver {
    async fn recv(&mut self) -> Result<Payload, TransportError> {
        loop {
            let message = match self.0.next().await {
                None => {
                    return Err(TransportError::Closed {
                        resumable: true,
                        code: None,
                        reason: "connection dropped without a close frame".to_string(),
                    });
                }
                Some(Err(e)) => return Err(TransportError::Io(e.to_string())),
                Some(Ok(message)) => message,
            };
            match message {
                Message::Text(text) => {
                    return serde_json::from_str(text.as_str())
                        .map_err(|e| TransportError::Decode(e.to_string()));
                }
                Message::Binary(bytes) => {
                    return serde_json::from_slice(&bytes)
                        .map_err(|e| TransportError::Decode(e.to_string()));
                }
                Message::Close(frame) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                        None => (None, String::new()),
                    };
                    let resumable = code.map(close_permits_resume).unwrap_or(true);
                    warn!("connection closed by peer (code {code:?}): {reason}");
                    return Err(TransportError::Closed {
                        resumable,
                        code,
                        reason,
                    });
                }
                // Ping/pong is handled by the WebSocket layer itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }
}

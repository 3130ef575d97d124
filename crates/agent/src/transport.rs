//! WebSocket transport
//!
//! The session logic talks to the server through the [`Transport`] trait
//! so tests can drive it with an in-memory fake. The real implementation
//! wraps a tokio-tungstenite stream and reduces it to text frames:
//! pings are answered inline, binary frames are dropped, and a close
//! frame (or EOF) surfaces as end of stream.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

/// Transport-level failure; always transient from the session's point
/// of view.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self(e.to_string())
    }
}

/// A bidirectional stream of text frames.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next text frame, or `None` once the peer has closed.
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;

    async fn close(&mut self);
}

/// Establishes transports; one call per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, TransportError>;
}

/// Connects over WebSocket (ws or wss).
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, TransportError> {
        let (stream, response) = connect_async(url.as_str()).await?;
        debug!("WebSocket handshake completed: {}", response.status());
        Ok(Box::new(WsTransport { stream }))
    }
}

struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        while let Some(frame) = self.stream.next().await {
            match frame? {
                Message::Text(text) => return Ok(Some(text.to_string())),
                Message::Ping(payload) => {
                    self.stream.send(Message::Pong(payload)).await?;
                }
                Message::Pong(_) => {}
                Message::Binary(_) => {
                    warn!("Ignoring unexpected binary frame");
                }
                Message::Close(_) => return Ok(None),
                Message::Frame(_) => {}
            }
        }
        Ok(None)
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

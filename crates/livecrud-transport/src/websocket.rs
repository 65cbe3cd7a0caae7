//! WebSocket transport for the realtime endpoint.

use async_trait::async_trait;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use crate::connection::{Connector, Incoming, Transport, TransportError};

/// Connects to a `ws://` or `wss://` URL.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        tracing::debug!(url = %self.url, "Opening realtime connection");
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Box::new(WsTransport { stream }))
    }
}

/// One open WebSocket.
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn recv(&mut self) -> Result<Incoming, TransportError> {
        loop {
            let Some(message) = self.stream.next().await else {
                return Ok(Incoming::Closed { was_clean: false });
            };
            match message.map_err(|e| TransportError::Io(e.to_string()))? {
                Message::Text(text) => return Ok(Incoming::Text(text)),
                Message::Binary(data) => return Ok(Incoming::Binary(data)),
                Message::Close(frame) => {
                    tracing::debug!(?frame, "Server sent close frame");
                    return Ok(Incoming::Closed { was_clean: true });
                }
                // Pings are answered by the stream itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!("Error closing realtime connection: {e}");
        }
    }
}

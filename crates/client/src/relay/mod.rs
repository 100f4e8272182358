// Relay connection: one WebSocket carrying protocol envelopes.
//
// Reconnection is the runtime's job; this module only knows how to open,
// use and close a single connection.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tandem_common::error::SyncError;
use tandem_common::protocol::ws::Envelope;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

/// Current state of the relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Fixed-delay reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { delay: Duration::from_secs(10) }
    }
}

impl ReconnectPolicy {
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

/// Parse a relay URL, accepting only `ws` and `wss`.
pub fn validate_relay_url(raw: &str) -> Result<Url, SyncError> {
    let url = Url::parse(raw)
        .map_err(|e| SyncError::connection_lost(format!("invalid relay url `{raw}`: {e}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(SyncError::connection_lost(format!(
            "relay url must use ws or wss, got `{other}`"
        ))),
    }
}

pub struct RelayConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RelayConnection {
    pub async fn connect(url: &Url) -> Result<Self, SyncError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| SyncError::connection_lost(format!("connect to {url}: {e}")))?;
        debug!(url = %url, "relay connected");
        Ok(Self { stream })
    }

    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), SyncError> {
        let text = envelope.encode()?;
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| SyncError::connection_lost(format!("send failed: {e}")))
    }

    /// Next envelope from the relay. `None` once the connection is closed;
    /// `Some(Err(MalformedMessage))` for frames that do not decode, after
    /// which the connection is still usable.
    pub async fn recv(&mut self) -> Option<Result<Envelope, SyncError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(SyncError::connection_lost(e.to_string()))),
            };
            match message {
                Message::Text(text) => return Some(Envelope::decode(text.as_str())),
                Message::Binary(_) => {
                    warn!("ignoring binary frame from relay");
                }
                Message::Ping(payload) => {
                    if let Err(e) = self.stream.send(Message::Pong(payload)).await {
                        return Some(Err(SyncError::connection_lost(format!("pong failed: {e}"))));
                    }
                }
                Message::Close(frame) => {
                    debug!(frame = ?frame, "relay closed connection");
                    return None;
                }
                Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    pub async fn close(mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "relay close failed");
        }
    }
}

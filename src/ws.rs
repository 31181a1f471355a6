//! WebSocket connection wrapper for the streaming transport.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::error::ChatClientError;

/// WebSocket message types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    /// Text message.
    Text(String),
    /// Binary message.
    Binary(Vec<u8>),
    /// Ping message.
    Ping(Vec<u8>),
    /// Pong message.
    Pong(Vec<u8>),
    /// Close message with an optional reason.
    Close(Option<String>),
}

impl WsMessage {
    /// Check if this is a close message.
    #[must_use]
    pub const fn is_close(&self) -> bool {
        matches!(self, Self::Close(_))
    }
}

impl From<Message> for WsMessage {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Text(s) => Self::Text(s.to_string()),
            Message::Binary(b) => Self::Binary(b.to_vec()),
            Message::Ping(b) => Self::Ping(b.to_vec()),
            Message::Pong(b) => Self::Pong(b.to_vec()),
            Message::Close(frame) => Self::Close(frame.map(|f| f.reason.to_string())),
            Message::Frame(_) => Self::Binary(vec![]),
        }
    }
}

impl From<WsMessage> for Message {
    fn from(msg: WsMessage) -> Self {
        match msg {
            WsMessage::Text(s) => Self::Text(s.into()),
            WsMessage::Binary(b) => Self::Binary(b.into()),
            WsMessage::Ping(b) => Self::Ping(b.into()),
            WsMessage::Pong(b) => Self::Pong(b.into()),
            WsMessage::Close(_) => Self::Close(None),
        }
    }
}

/// WebSocket connection settings.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Headers attached to the handshake request.
    pub headers: HashMap<String, String>,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            headers: HashMap::new(),
        }
    }
}

impl WsConfig {
    /// Add a handshake header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// WebSocket client bound to one endpoint.
#[derive(Debug, Clone)]
pub struct WsClient {
    url: String,
    config: WsConfig,
}

impl WsClient {
    /// Create a client with configuration.
    #[must_use]
    pub fn with_config(url: impl Into<String>, config: WsConfig) -> Self {
        Self {
            url: url.into(),
            config,
        }
    }

    /// Connect to the WebSocket server.
    ///
    /// # Errors
    /// Returns an error if the URL or a header is invalid, or if the
    /// connection attempt fails or times out.
    pub async fn connect(&self) -> Result<WsConnection, ChatClientError> {
        let url = Url::parse(&self.url).map_err(|e| ChatClientError::Config {
            message: format!("invalid WebSocket URL {}: {e}", self.url),
        })?;

        let mut request =
            url.as_str()
                .into_client_request()
                .map_err(|e| ChatClientError::Config {
                    message: format!("invalid WebSocket request: {e}"),
                })?;
        for (key, value) in &self.config.headers {
            let name =
                HeaderName::from_bytes(key.as_bytes()).map_err(|e| ChatClientError::Config {
                    message: format!("invalid handshake header name {key}: {e}"),
                })?;
            let value = HeaderValue::from_str(value).map_err(|e| ChatClientError::Config {
                message: format!("invalid handshake header value for {key}: {e}"),
            })?;
            request.headers_mut().insert(name, value);
        }

        let connect_result =
            tokio::time::timeout(self.config.connect_timeout, connect_async(request)).await;

        let Ok(ws_result) = connect_result else {
            return Err(ChatClientError::Subscription {
                message: format!(
                    "connect timed out after {:?}",
                    self.config.connect_timeout
                ),
            });
        };

        let (ws_stream, _response) = ws_result.map_err(|e| ChatClientError::Subscription {
            message: format!("connect failed: {e}"),
        })?;

        Ok(WsConnection::new(ws_stream))
    }

    /// Get the URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Active WebSocket connection.
pub struct WsConnection {
    inner: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    closed: bool,
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl WsConnection {
    const fn new(stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>) -> Self {
        Self {
            inner: stream,
            closed: false,
        }
    }

    /// Send a message.
    ///
    /// # Errors
    /// Returns an error if the connection is closed or the send fails.
    pub async fn send(&mut self, message: WsMessage) -> Result<(), ChatClientError> {
        if self.closed {
            return Err(ChatClientError::Subscription {
                message: "connection is closed".into(),
            });
        }

        self.inner
            .send(message.into())
            .await
            .map_err(|e| ChatClientError::Subscription {
                message: format!("send failed: {e}"),
            })
    }

    /// Serialize a value as JSON and send it as a text message.
    ///
    /// # Errors
    /// Returns an error if serialization or the send fails.
    pub async fn send_json<T: serde::Serialize + Sync>(
        &mut self,
        data: &T,
    ) -> Result<(), ChatClientError> {
        let json = serde_json::to_string(data)?;
        self.send(WsMessage::Text(json)).await
    }

    /// Receive the next message. `None` means the peer ended the stream.
    ///
    /// # Errors
    /// Returns an error if the underlying socket fails.
    pub async fn recv(&mut self) -> Result<Option<WsMessage>, ChatClientError> {
        if self.closed {
            return Ok(None);
        }

        match self.inner.next().await {
            Some(Ok(msg)) => {
                let ws_msg: WsMessage = msg.into();
                if ws_msg.is_close() {
                    self.closed = true;
                }
                Ok(Some(ws_msg))
            }
            Some(Err(e)) => Err(ChatClientError::Subscription {
                message: format!("receive failed: {e}"),
            }),
            None => {
                self.closed = true;
                Ok(None)
            }
        }
    }

    /// Close the connection.
    ///
    /// # Errors
    /// Returns an error if the close frame fails to send.
    pub async fn close(&mut self) -> Result<(), ChatClientError> {
        if !self.closed {
            self.closed = true;
            self.inner
                .close(None)
                .await
                .map_err(|e| ChatClientError::Subscription {
                    message: format!("close failed: {e}"),
                })?;
        }
        Ok(())
    }

    /// Check if the connection is closed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_roundtrip_text() {
        let msg = WsMessage::Text("hello".into());
        let wire: Message = msg.clone().into();
        assert_eq!(WsMessage::from(wire), msg);
    }

    #[test]
    fn close_detection() {
        assert!(WsMessage::Close(None).is_close());
        assert!(!WsMessage::Text(String::new()).is_close());
    }

    #[test]
    fn config_header_builder() {
        let config = WsConfig::default().with_header("Sec-WebSocket-Protocol", "graphql-transport-ws");
        assert_eq!(
            config.headers.get("Sec-WebSocket-Protocol").map(String::as_str),
            Some("graphql-transport-ws")
        );
    }

    #[tokio::test]
    async fn connect_rejects_invalid_url() {
        let client = WsClient::with_config("not a url", WsConfig::default());
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ChatClientError::Config { .. }));
    }
}

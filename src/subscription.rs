//! GraphQL subscriptions over WebSocket (graphql-transport-ws).
//!
//! One connection per subscription: `connection_init` (carrying the
//! connection params) -> `connection_ack` -> `subscribe`, then a pump task
//! forwards `next` payloads until `error` or `complete`. Dropped connections
//! are re-established with backoff and the subscription is replayed.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::error::{ChatClientError, GraphqlError};
use crate::operation::{GraphqlOperation, GraphqlResponse};
use crate::reconnect::{ReconnectConfig, ReconnectHandler};
use crate::ws::{WsClient, WsConfig, WsConnection, WsMessage};

/// Connection-params header carrying the streaming admin secret.
pub const ADMIN_SECRET_HEADER: &str = "x-hasura-admin-secret";

/// graphql-transport-ws message envelope.
#[derive(Debug, Serialize, Deserialize)]
struct GraphqlWsMessage {
    #[serde(rename = "type")]
    message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
}

/// Stream of subscription responses.
pub type SubscriptionStream<T> = ReceiverStream<Result<GraphqlResponse<T>, ChatClientError>>;

/// GraphQL subscription client bound to one WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct SubscriptionClient {
    url: String,
    init_payload: Option<Value>,
    headers: HashMap<String, String>,
    connect_timeout: Duration,
    ack_timeout: Duration,
    reconnect: ReconnectConfig,
}

impl SubscriptionClient {
    /// Create a new subscription client.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        let mut headers = HashMap::new();
        headers.insert(
            "Sec-WebSocket-Protocol".to_string(),
            "graphql-transport-ws".to_string(),
        );
        Self {
            url: url.into(),
            init_payload: None,
            headers,
            connect_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Carry the admin secret in the connection params, established once at
    /// connection time.
    #[must_use]
    pub fn with_admin_secret(mut self, secret: impl Into<String>) -> Self {
        self.init_payload = Some(serde_json::json!({
            "headers": { ADMIN_SECRET_HEADER: secret.into() }
        }));
        self
    }

    /// Set an arbitrary `connection_init` payload.
    #[must_use]
    pub fn with_init_payload(mut self, payload: Value) -> Self {
        self.init_payload = Some(payload);
        self
    }

    /// Add a header to the WebSocket handshake.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Set connect and ack timeouts.
    #[must_use]
    pub const fn with_timeouts(mut self, connect: Duration, ack: Duration) -> Self {
        self.connect_timeout = connect;
        self.ack_timeout = ack;
        self
    }

    /// Set the reconnect policy.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Subscribe to a typed GraphQL operation.
    ///
    /// # Errors
    /// Returns an error if the initial connection or protocol handshake
    /// fails. Later failures surface through the stream.
    pub async fn subscribe<O: GraphqlOperation>(
        &self,
        variables: O::Variables,
    ) -> Result<SubscriptionStream<O::ResponseData>, ChatClientError>
    where
        O::ResponseData: 'static,
    {
        self.subscribe_with_headers::<O>(variables, HashMap::new())
            .await
    }

    /// Subscribe with extra handshake headers (per-request auth).
    ///
    /// # Errors
    /// Returns an error if the initial connection or protocol handshake
    /// fails. Later failures surface through the stream.
    pub async fn subscribe_with_headers<O: GraphqlOperation>(
        &self,
        variables: O::Variables,
        extra_headers: HashMap<String, String>,
    ) -> Result<SubscriptionStream<O::ResponseData>, ChatClientError>
    where
        O::ResponseData: 'static,
    {
        let mut headers = self.headers.clone();
        headers.extend(extra_headers);
        // Extra headers must not clobber the subprotocol.
        headers.insert(
            "Sec-WebSocket-Protocol".to_string(),
            "graphql-transport-ws".to_string(),
        );

        let ws_config = WsConfig {
            connect_timeout: self.connect_timeout,
            headers,
        };

        let setup = ConnectionSetup {
            ws: WsClient::with_config(self.url.clone(), ws_config),
            init_payload: self.init_payload.clone(),
            ack_timeout: self.ack_timeout,
            subscribe_payload: serde_json::json!({
                "query": O::QUERY,
                "operationName": O::OPERATION_NAME,
                "variables": serde_json::to_value(variables)?,
            }),
        };

        let connection = establish(&setup).await?;

        let (tx, rx) = mpsc::channel(16);
        let reconnect = self.reconnect.clone();

        tokio::spawn(run_subscription::<O::ResponseData>(
            connection, setup, reconnect, tx,
        ));

        Ok(ReceiverStream::new(rx))
    }
}

/// Everything needed to (re-)establish a subscription connection.
struct ConnectionSetup {
    ws: WsClient,
    init_payload: Option<Value>,
    ack_timeout: Duration,
    subscribe_payload: Value,
}

/// Connect, init, await ack, subscribe.
async fn establish(setup: &ConnectionSetup) -> Result<WsConnection, ChatClientError> {
    let mut connection = setup.ws.connect().await?;

    let init = GraphqlWsMessage {
        message_type: "connection_init".to_string(),
        id: None,
        payload: setup.init_payload.clone(),
    };
    connection.send_json(&init).await?;

    match tokio::time::timeout(setup.ack_timeout, connection.recv()).await {
        Ok(Ok(Some(message))) => {
            let ack = decode_ws_message(message)?;
            if ack.message_type != "connection_ack" {
                return Err(ChatClientError::Protocol {
                    message: format!("expected connection_ack, got {}", ack.message_type),
                });
            }
        }
        Ok(Ok(None)) => {
            return Err(ChatClientError::Subscription {
                message: "connection closed before ack".to_string(),
            });
        }
        Ok(Err(err)) => return Err(err),
        Err(_) => {
            return Err(ChatClientError::Subscription {
                message: "connection_ack timeout".to_string(),
            });
        }
    }

    let subscribe = GraphqlWsMessage {
        message_type: "subscribe".to_string(),
        id: Some("1".to_string()),
        payload: Some(setup.subscribe_payload.clone()),
    };
    connection.send_json(&subscribe).await?;

    Ok(connection)
}

/// Why the pump loop stopped reading a connection.
enum PumpExit {
    /// Server completed or terminally rejected the subscription.
    Finished,
    /// The consumer dropped the stream.
    ReceiverDropped,
    /// The connection dropped; eligible for reconnection.
    Disconnected(String),
}

async fn run_subscription<T>(
    mut connection: WsConnection,
    setup: ConnectionSetup,
    reconnect: ReconnectConfig,
    tx: mpsc::Sender<Result<GraphqlResponse<T>, ChatClientError>>,
) where
    T: for<'de> Deserialize<'de> + Send + Sync + 'static,
{
    let mut handler = ReconnectHandler::new(reconnect);

    loop {
        match pump(&mut connection, &tx).await {
            PumpExit::Finished | PumpExit::ReceiverDropped => {
                let _ = connection.close().await;
                return;
            }
            PumpExit::Disconnected(reason) => {
                warn!(reason = %reason, "subscription connection lost");
                loop {
                    if let Err(err) = handler.wait_for_reconnect().await {
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                    match establish(&setup).await {
                        Ok(fresh) => {
                            connection = fresh;
                            handler.reset();
                            info!("subscription re-established");
                            break;
                        }
                        Err(err) => {
                            warn!(error = %err, "reconnect attempt failed");
                        }
                    }
                }
            }
        }
    }
}

async fn pump<T>(
    connection: &mut WsConnection,
    tx: &mpsc::Sender<Result<GraphqlResponse<T>, ChatClientError>>,
) -> PumpExit
where
    T: for<'de> Deserialize<'de>,
{
    loop {
        let message = match connection.recv().await {
            Ok(Some(message)) => message,
            Ok(None) => return PumpExit::Disconnected("connection ended".into()),
            Err(err) => return PumpExit::Disconnected(err.to_string()),
        };

        match message {
            WsMessage::Ping(payload) => {
                if connection.send(WsMessage::Pong(payload)).await.is_err() {
                    return PumpExit::Disconnected("pong failed".into());
                }
                continue;
            }
            WsMessage::Pong(_) => continue,
            WsMessage::Close(reason) => {
                return PumpExit::Disconnected(reason.unwrap_or_else(|| "closed".into()));
            }
            WsMessage::Text(_) | WsMessage::Binary(_) => {}
        }

        let ws_msg = match decode_ws_message(message) {
            Ok(ws_msg) => ws_msg,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return PumpExit::Finished;
            }
        };

        match ws_msg.message_type.as_str() {
            "next" => {
                let Some(payload) = ws_msg.payload else {
                    continue;
                };
                match serde_json::from_value::<GraphqlResponse<T>>(payload) {
                    Ok(response) => {
                        if tx.send(Ok(response)).await.is_err() {
                            return PumpExit::ReceiverDropped;
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(Err(ChatClientError::Json(err.to_string()))).await;
                        return PumpExit::Finished;
                    }
                }
            }
            "error" => {
                let errors = ws_msg
                    .payload
                    .and_then(|value| {
                        if value.is_array() {
                            serde_json::from_value::<Vec<GraphqlError>>(value).ok()
                        } else {
                            serde_json::from_value::<GraphqlError>(value)
                                .ok()
                                .map(|err| vec![err])
                        }
                    })
                    .unwrap_or_default();
                let _ = tx.send(Err(ChatClientError::GraphqlErrors { errors })).await;
                return PumpExit::Finished;
            }
            "complete" => return PumpExit::Finished,
            "ping" => {
                let pong = GraphqlWsMessage {
                    message_type: "pong".to_string(),
                    id: ws_msg.id,
                    payload: ws_msg.payload,
                };
                if connection.send_json(&pong).await.is_err() {
                    return PumpExit::Disconnected("pong failed".into());
                }
            }
            other => {
                // Keep-alive and protocol extensions are not ours to reject.
                debug!(message_type = %other, "ignoring websocket message");
            }
        }
    }
}

fn decode_ws_message(message: WsMessage) -> Result<GraphqlWsMessage, ChatClientError> {
    match message {
        WsMessage::Text(text) => {
            serde_json::from_str(&text).map_err(|err| ChatClientError::Json(err.to_string()))
        }
        WsMessage::Binary(binary) => {
            serde_json::from_slice(&binary).map_err(|err| ChatClientError::Json(err.to_string()))
        }
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Close(_) => {
            Err(ChatClientError::Protocol {
                message: "unexpected websocket control message".to_string(),
            })
        }
    }
}

//! Client side of the relay connection.
//!
//! [`SignalingSink`] is how sessions hand envelopes to the relay.
//! [`RelayClient`] is the WebSocket implementation: it performs the
//! `hello`/`welcome` handshake, then runs a background task that writes
//! queued envelopes and forwards everything the relay sends as
//! [`RelayEvent`]s.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parley_common::{CallError, ClientMessage, EndpointId, ParleyError, ServerMessage};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound path to the relay.
pub trait SignalingSink: Send + Sync {
    fn send(&self, msg: ClientMessage) -> Result<(), CallError>;
}

impl SignalingSink for mpsc::UnboundedSender<ClientMessage> {
    fn send(&self, msg: ClientMessage) -> Result<(), CallError> {
        mpsc::UnboundedSender::send(self, msg).map_err(|_| CallError::SignalingClosed)
    }
}

/// What the relay connection reports.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Message(ServerMessage),
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    pub url: String,
    pub username: String,
    pub connect_timeout: Duration,
}

impl RelayClientConfig {
    pub fn new(url: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: username.into(),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// A live, identified connection to the relay.
pub struct RelayClient {
    endpoint_id: EndpointId,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    task: JoinHandle<()>,
}

impl RelayClient {
    /// Connect, send `hello`, and wait for `welcome`.
    pub async fn connect(
        config: RelayClientConfig,
    ) -> Result<(Self, mpsc::Receiver<RelayEvent>), ParleyError> {
        info!(url = %config.url, username = %config.username, "Connecting to relay");

        let (mut ws, _) = tokio::time::timeout(
            config.connect_timeout,
            tokio_tungstenite::connect_async(config.url.as_str()),
        )
        .await
        .map_err(|_| {
            ParleyError::Network(format!(
                "connection timed out after {}s",
                config.connect_timeout.as_secs()
            ))
        })?
        .map_err(|e| ParleyError::Network(format!("connection failed: {e}")))?;

        let hello = serde_json::to_string(&ClientMessage::Hello {
            username: config.username.clone(),
        })?;
        ws.send(WsMessage::Text(hello.into()))
            .await
            .map_err(|e| ParleyError::Network(e.to_string()))?;

        let endpoint_id = tokio::time::timeout(config.connect_timeout, async {
            while let Some(frame) = ws.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        return match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(ServerMessage::Welcome { endpoint_id }) => Ok(endpoint_id),
                            Ok(ServerMessage::Error { message, .. }) => {
                                Err(ParleyError::Network(format!("relay refused hello: {message}")))
                            }
                            Ok(other) => Err(ParleyError::Network(format!(
                                "expected welcome, got {other:?}"
                            ))),
                            Err(e) => Err(e.into()),
                        };
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => return Err(ParleyError::Network(e.to_string())),
                }
            }
            Err(ParleyError::Network("relay closed before welcome".into()))
        })
        .await
        .map_err(|_| ParleyError::Network("timed out waiting for welcome".into()))??;

        info!(endpoint = %endpoint_id, "Relay handshake complete");

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(256);
        let task = tokio::spawn(connection_loop(ws, outbound_rx, event_tx));

        Ok((
            Self {
                endpoint_id,
                outbound,
                task,
            },
            event_rx,
        ))
    }

    pub fn endpoint_id(&self) -> &EndpointId {
        &self.endpoint_id
    }

    /// A sink that queues envelopes onto this connection.
    pub fn sink(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.outbound.clone()
    }

    pub fn close(&self) {
        self.task.abort();
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn connection_loop(
    ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    event_tx: mpsc::Sender<RelayEvent>,
) {
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                match serde_json::to_string(&msg) {
                    Ok(json) => {
                        if let Err(e) = write.send(WsMessage::Text(json.into())).await {
                            warn!(error = %e, "Failed to write to relay");
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to serialize envelope"),
                }
            }

            frame = read.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(msg) => {
                                if event_tx.send(RelayEvent::Message(msg)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => debug!(error = %e, "Unrecognized message from relay"),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!("Relay closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Relay connection error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let _ = event_tx.send(RelayEvent::Disconnected).await;
}

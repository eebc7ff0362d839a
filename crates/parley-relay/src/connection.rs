//! Per-connection handler: read `hello`, register, then route frames.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parley_common::{ClientMessage, ErrorCode, ServerMessage};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::hub::Relay;
use crate::server::ConnectionSettings;

type WsSink = futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = futures_util::stream::SplitStream<WebSocketStream<TcpStream>>;

/// Handle a single WebSocket connection until it closes.
pub async fn handle_connection(
    ws: WebSocketStream<TcpStream>,
    addr: SocketAddr,
    relay: Relay,
    settings: ConnectionSettings,
) {
    let (mut sink, mut stream) = ws.split();

    // 1. The first frame must identify the user.
    let username = match read_hello(&mut stream, addr, settings.hello_timeout).await {
        Ok(name) => name,
        Err(reason) => {
            let _ = send_message(
                &mut sink,
                &ServerMessage::error(ErrorCode::MalformedEnvelope, reason),
            )
            .await;
            return;
        }
    };

    // 2. Register; the relay queues our welcome.
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(settings.queue_capacity);
    let endpoint = relay.connect(&username, tx).await;
    let endpoint_id = endpoint.id;

    tracing::info!(peer = %addr, endpoint = %endpoint_id, username = %username, "Client registered");

    // 3. Forwarding loop. Frames from this client are handled one at a time,
    //    which keeps per-sender delivery order.
    loop {
        tokio::select! {
            Some(msg) = rx.recv() => {
                if send_message(&mut sink, &msg).await.is_err() {
                    break;
                }
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        relay.handle_text(&endpoint_id, &text).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let _ = send_message(
                            &mut sink,
                            &ServerMessage::error(ErrorCode::MalformedEnvelope, "binary frames are not supported"),
                        )
                        .await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(peer = %addr, error = %e, "WS error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    // 4. Cleanup.
    tracing::info!(peer = %addr, endpoint = %endpoint_id, "Client disconnected");
    relay.disconnect(&endpoint_id).await;
}

/// Read and parse the first message as a `hello`.
async fn read_hello(
    stream: &mut WsStream,
    addr: SocketAddr,
    timeout: Duration,
) -> Result<String, String> {
    let frame = tokio::time::timeout(timeout, stream.next()).await;

    match frame {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Hello { username }) if !username.trim().is_empty() => Ok(username),
            Ok(ClientMessage::Hello { .. }) => Err("username must not be empty".into()),
            Ok(_) => {
                tracing::warn!(peer = %addr, "Expected hello as first message");
                Err("expected hello as first message".into())
            }
            Err(e) => {
                tracing::warn!(peer = %addr, error = %e, "Invalid hello message");
                Err(format!("invalid hello: {e}"))
            }
        },
        Ok(Some(Ok(_))) => {
            tracing::warn!(peer = %addr, "Expected text hello, got non-text frame");
            Err("expected text hello".into())
        }
        Ok(Some(Err(e))) => {
            tracing::warn!(peer = %addr, error = %e, "WS error during hello");
            Err(e.to_string())
        }
        Ok(None) => {
            tracing::debug!(peer = %addr, "Connection closed before hello");
            Err("closed before hello".into())
        }
        Err(_) => {
            tracing::warn!(peer = %addr, "Hello timeout ({}s)", timeout.as_secs());
            Err("hello timeout".into())
        }
    }
}

/// Send a `ServerMessage` as a JSON text frame.
async fn send_message(
    sink: &mut WsSink,
    msg: &ServerMessage,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    match serde_json::to_string(msg) {
        Ok(json) => sink.send(Message::Text(json.into())).await,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize relay message");
            Ok(())
        }
    }
}

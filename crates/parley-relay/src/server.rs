//! TCP accept loop.

use std::time::Duration;

use parley_config::RelayConfig;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;

use crate::connection::handle_connection;
use crate::hub::Relay;

/// Per-connection limits.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub hello_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for ConnectionSettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            hello_timeout: Duration::from_secs(u64::from(config.hello_timeout_secs)),
            queue_capacity: config.queue_capacity as usize,
        }
    }
}

/// Accept connections forever, one task per client.
pub async fn serve(listener: TcpListener, relay: Relay, settings: ConnectionSettings) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let relay = relay.clone();
                tokio::spawn(async move {
                    match accept_async(stream).await {
                        Ok(ws) => handle_connection(ws, addr, relay, settings).await,
                        Err(e) => {
                            tracing::warn!(peer = %addr, error = %e, "WS handshake failed");
                        }
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "TCP accept error");
            }
        }
    }
}

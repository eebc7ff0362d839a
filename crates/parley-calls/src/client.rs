//! A complete calling endpoint.
//!
//! [`connect`] opens the relay connection, builds the call and screen
//! share sessions on top of it, and spawns one task that owns both. That
//! task processes relay messages, transport events and user commands one
//! at a time. The returned [`ClientHandle`] is the only way in.

use std::collections::HashMap;
use std::sync::Arc;

use parley_common::{
    CallError, CallId, CallKind, ConnectionState, Endpoint, EndpointId, Namespace, ParleyError,
    ServerMessage,
};
use parley_config::ParleyConfig;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::history::CallLogStore;
use crate::media::MediaDevices;
use crate::quality::QualitySample;
use crate::screen_share::{ScreenShareEvent, ScreenShareSession};
use crate::session::{CallEvent, CallSession, CallState, SessionDeps};
use crate::signaling::{RelayClient, RelayClientConfig, RelayEvent};
use crate::transport::{PeerEvent, TransportFactory};

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

/// Requests from the handle to the client task.
enum Command {
    StartCall {
        target: Endpoint,
        kind: CallKind,
        reply: Reply<CallId>,
    },
    Answer(Reply<()>),
    Reject(Reply<()>),
    EndCall(Reply<()>),
    ToggleMute(Reply<bool>),
    ToggleVideo(Reply<bool>),
    StartScreenShare(Reply<()>),
    StopScreenShare(Reply<()>),
    ViewScreenShare {
        sharer: EndpointId,
        reply: Reply<()>,
    },
    Snapshot(oneshot::Sender<CallSnapshot>),
}

/// Point-in-time view of the client.
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub call: Option<CallState>,
    pub connection: ConnectionState,
    pub quality: HashMap<EndpointId, QualitySample>,
    pub remote_streams: usize,
    pub sharing: bool,
    pub screen_streams: Vec<EndpointId>,
}

/// UI-facing event streams.
pub struct ClientEvents {
    pub calls: mpsc::Receiver<CallEvent>,
    pub screen_share: mpsc::Receiver<ScreenShareEvent>,
}

/// Local hardware and storage the client runs on.
pub struct ClientResources {
    pub devices: Arc<dyn MediaDevices>,
    pub transports: Arc<dyn TransportFactory>,
    pub history: Arc<dyn CallLogStore>,
}

#[derive(Clone)]
pub struct ClientHandle {
    endpoint_id: EndpointId,
    commands: mpsc::Sender<Command>,
    connection: watch::Receiver<ConnectionState>,
}

/// Connect to the relay at `config.relay.url` as `username` and start the
/// client task.
pub async fn connect(
    config: &ParleyConfig,
    username: &str,
    resources: ClientResources,
) -> Result<(ClientHandle, ClientEvents, JoinHandle<()>), ParleyError> {
    let (relay, relay_events) =
        RelayClient::connect(RelayClientConfig::new(config.relay.url.clone(), username)).await?;
    let endpoint_id = relay.endpoint_id().clone();

    let deps = SessionDeps {
        devices: resources.devices,
        transports: resources.transports,
        signaling: Arc::new(relay.sink()),
        history: resources.history,
    };
    let (share, share_events, share_peers) = ScreenShareSession::new(
        Arc::clone(&deps.devices),
        Arc::clone(&deps.transports),
        Arc::clone(&deps.signaling),
        config.ice.clone(),
    );
    let (call, call_events, call_peers) =
        CallSession::new(deps, config.ice.clone(), config.quality.clone());

    let connection = call.watch_connection();
    let (command_tx, command_rx) = mpsc::channel(64);

    let driver = Driver {
        relay,
        call,
        share,
    };
    let task = tokio::spawn(driver.run(relay_events, command_rx, call_peers, share_peers));

    info!(endpoint = %endpoint_id, username, "Calling client started");
    Ok((
        ClientHandle {
            endpoint_id,
            commands: command_tx,
            connection,
        },
        ClientEvents {
            calls: call_events,
            screen_share: share_events,
        },
        task,
    ))
}

impl ClientHandle {
    pub fn endpoint_id(&self) -> &EndpointId {
        &self.endpoint_id
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    pub async fn start_call(&self, target: Endpoint, kind: CallKind) -> Result<CallId, CallError> {
        self.request(|reply| Command::StartCall {
            target,
            kind,
            reply,
        })
        .await
    }

    pub async fn answer(&self) -> Result<(), CallError> {
        self.request(Command::Answer).await
    }

    pub async fn reject(&self) -> Result<(), CallError> {
        self.request(Command::Reject).await
    }

    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(Command::EndCall).await
    }

    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.request(Command::ToggleMute).await
    }

    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.request(Command::ToggleVideo).await
    }

    pub async fn start_screen_share(&self) -> Result<(), CallError> {
        self.request(Command::StartScreenShare).await
    }

    pub async fn stop_screen_share(&self) -> Result<(), CallError> {
        self.request(Command::StopScreenShare).await
    }

    pub async fn view_screen_share(&self, sharer: EndpointId) -> Result<(), CallError> {
        self.request(|reply| Command::ViewScreenShare { sharer, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<CallSnapshot, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(tx))
            .await
            .map_err(|_| CallError::SignalingClosed)?;
        rx.await.map_err(|_| CallError::SignalingClosed)
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| CallError::SignalingClosed)?;
        rx.await.map_err(|_| CallError::SignalingClosed)?
    }
}

// ---------------------------------------------------------------------------
// Client task
// ---------------------------------------------------------------------------

struct Driver {
    /// Held so the connection stays open for the life of the task.
    relay: RelayClient,
    call: CallSession,
    share: ScreenShareSession,
}

impl Driver {
    async fn run(
        mut self,
        mut relay_events: mpsc::Receiver<RelayEvent>,
        mut commands: mpsc::Receiver<Command>,
        mut call_peers: mpsc::UnboundedReceiver<PeerEvent>,
        mut share_peers: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        loop {
            tokio::select! {
                event = relay_events.recv() => match event {
                    Some(RelayEvent::Message(msg)) => self.route(msg).await,
                    Some(RelayEvent::Disconnected) | None => {
                        warn!(endpoint = %self.relay.endpoint_id(), "Relay connection lost, ending sessions");
                        break;
                    }
                },

                Some(ev) = call_peers.recv() => self.call.handle_peer_event(ev).await,

                Some(ev) = share_peers.recv() => self.share.handle_peer_event(ev).await,

                command = commands.recv() => match command {
                    Some(command) => self.execute(command).await,
                    None => {
                        debug!("All client handles dropped");
                        break;
                    }
                },
            }
        }

        if let Err(e) = self.call.end_call().await {
            warn!(error = %e, "Failed to end call during shutdown");
        }
        self.share.shutdown().await;
        self.relay.close();
    }

    async fn route(&mut self, msg: ServerMessage) {
        match msg.namespace() {
            Some(Namespace::Call) => self.call.handle_signal(msg).await,
            Some(Namespace::ScreenShare) => self.share.handle_signal(msg).await,
            None => match msg {
                ServerMessage::Error { code, message, .. } => {
                    warn!(?code, %message, "Relay reported an error");
                }
                other => debug!(?other, "Ignoring connection-level message"),
            },
        }
    }

    async fn execute(&mut self, command: Command) {
        // A dropped reply receiver only means the caller stopped waiting.
        match command {
            Command::StartCall {
                target,
                kind,
                reply,
            } => {
                let _ = reply.send(self.call.start_call(target, kind).await);
            }
            Command::Answer(reply) => {
                let _ = reply.send(self.call.answer().await);
            }
            Command::Reject(reply) => {
                let _ = reply.send(self.call.reject().await);
            }
            Command::EndCall(reply) => {
                let _ = reply.send(self.call.end_call().await);
            }
            Command::ToggleMute(reply) => {
                let _ = reply.send(self.call.toggle_mute());
            }
            Command::ToggleVideo(reply) => {
                let _ = reply.send(self.call.toggle_video());
            }
            Command::StartScreenShare(reply) => {
                let _ = reply.send(self.share.start().await);
            }
            Command::StopScreenShare(reply) => {
                self.share.stop().await;
                let _ = reply.send(Ok(()));
            }
            Command::ViewScreenShare { sharer, reply } => {
                let _ = reply.send(self.share.request_view(&sharer));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(CallSnapshot {
                    call: self.call.call().cloned(),
                    connection: self.call.connection_state(),
                    quality: self.call.quality_samples().await,
                    remote_streams: self.call.remote_streams().len(),
                    sharing: self.share.is_sharing(),
                    screen_streams: self.share.peers().streams().keys().cloned().collect(),
                });
            }
        }
    }
}

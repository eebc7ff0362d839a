//! Screen sharing sessions.
//!
//! Runs beside the call session on its own signaling namespace. The
//! sharer captures the display (video only, never the microphone),
//! announces itself, and offers a one-way transport to every viewer that
//! asks to watch. Viewers answer with no local tracks. There is no quality
//! monitoring here.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parley_common::{CallError, ClientMessage, EndpointId, Namespace, ServerMessage};
use parley_config::IceConfig;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::media::{LocalMedia, MediaDevices};
use crate::peer::PeerConnectionManager;
use crate::signaling::SignalingSink;
use crate::transport::{PeerEvent, RemoteStream, TransportFactory, TransportState};

/// Events emitted by the screen share system.
#[derive(Debug, Clone, PartialEq)]
pub enum ScreenShareEvent {
    /// Another endpoint began sharing.
    SharerAvailable {
        user_id: EndpointId,
        username: String,
    },
    SharerStopped {
        user_id: EndpointId,
    },
    ViewerJoined {
        viewer_id: EndpointId,
        username: String,
    },
    ViewerLeft {
        viewer_id: EndpointId,
    },
    /// The shared screen from `sharer` is now flowing.
    StreamReady {
        sharer: EndpointId,
    },
    Error(CallError),
}

pub struct ScreenShareSession {
    devices: Arc<dyn MediaDevices>,
    signaling: Arc<dyn SignalingSink>,
    peers: PeerConnectionManager,
    media: LocalMedia,
    sharing: bool,
    /// Endpoints watching our screen.
    viewers: HashSet<EndpointId>,
    /// Sharers we asked to watch.
    watching: HashSet<EndpointId>,
    /// Everyone currently announcing a share, user_id → username.
    sharers: HashMap<EndpointId, String>,
    event_tx: mpsc::Sender<ScreenShareEvent>,
}

impl ScreenShareSession {
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        transports: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingSink>,
        ice: IceConfig,
    ) -> (
        Self,
        mpsc::Receiver<ScreenShareEvent>,
        mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (peers, peer_rx) = PeerConnectionManager::new(
            Namespace::ScreenShare,
            ice,
            transports,
            Arc::clone(&signaling),
        );
        let session = Self {
            devices,
            signaling,
            peers,
            media: LocalMedia::default(),
            sharing: false,
            viewers: HashSet::new(),
            watching: HashSet::new(),
            sharers: HashMap::new(),
            event_tx,
        };
        (session, event_rx, peer_rx)
    }

    pub fn is_sharing(&self) -> bool {
        self.sharing
    }

    pub fn viewers(&self) -> &HashSet<EndpointId> {
        &self.viewers
    }

    pub fn sharers(&self) -> &HashMap<EndpointId, String> {
        &self.sharers
    }

    pub fn media(&self) -> &LocalMedia {
        &self.media
    }

    pub fn peers(&self) -> &PeerConnectionManager {
        &self.peers
    }

    pub fn stream(&self, sharer: &EndpointId) -> Option<&RemoteStream> {
        self.peers.stream(sharer)
    }

    /// Start sharing the display.
    pub async fn start(&mut self) -> Result<(), CallError> {
        if self.sharing {
            return Err(CallError::InvalidState {
                operation: "start sharing",
                phase: "already sharing".into(),
            });
        }

        self.media = LocalMedia::acquire_display(self.devices.as_ref()).await?;
        if let Err(e) = self.signaling.send(ClientMessage::ScreenShareStart) {
            self.media.stop_all();
            return Err(e);
        }
        self.sharing = true;
        info!("Screen share started");
        Ok(())
    }

    /// Stop sharing and drop every viewer. A no-op when not sharing.
    pub async fn stop(&mut self) {
        if !self.sharing {
            return;
        }
        if let Err(e) = self.signaling.send(ClientMessage::ScreenShareStop) {
            warn!(error = %e, "Could not announce screen share stop");
        }
        for viewer in std::mem::take(&mut self.viewers) {
            self.peers.close(&viewer).await;
        }
        self.media.stop_all();
        self.sharing = false;
        info!("Screen share stopped");
    }

    /// Ask `sharer` to send us their screen.
    pub fn request_view(&mut self, sharer: &EndpointId) -> Result<(), CallError> {
        self.signaling.send(ClientMessage::ScreenShareJoin {
            target_id: sharer.clone(),
        })?;
        self.watching.insert(sharer.clone());
        debug!(sharer = %sharer, "Requested screen share");
        Ok(())
    }

    pub async fn stop_viewing(&mut self, sharer: &EndpointId) {
        self.watching.remove(sharer);
        self.peers.close(sharer).await;
    }

    /// Stop sharing and viewing everything.
    pub async fn shutdown(&mut self) {
        self.stop().await;
        self.watching.clear();
        self.peers.close_all().await;
    }

    pub async fn handle_signal(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::ScreenShareStarted { user_id, username } => {
                info!(user_id = %user_id, username = %username, "Screen share available");
                self.sharers.insert(user_id.clone(), username.clone());
                self.emit(ScreenShareEvent::SharerAvailable { user_id, username });
            }

            ServerMessage::ScreenShareStopped { user_id } => {
                if self.sharers.remove(&user_id).is_some() {
                    self.emit(ScreenShareEvent::SharerStopped {
                        user_id: user_id.clone(),
                    });
                }
                if self.watching.remove(&user_id) {
                    self.peers.close(&user_id).await;
                }
                if self.viewers.remove(&user_id) {
                    self.peers.close(&user_id).await;
                    self.emit(ScreenShareEvent::ViewerLeft { viewer_id: user_id });
                }
            }

            ServerMessage::ScreenShareViewerJoined { from, username } => {
                if !self.sharing {
                    debug!(viewer = %from, "Viewer joined but we are not sharing");
                    return;
                }
                info!(viewer = %from, username = %username, "Viewer joined screen share");
                self.viewers.insert(from.clone());
                self.emit(ScreenShareEvent::ViewerJoined {
                    viewer_id: from.clone(),
                    username,
                });
                if let Err(e) = self.peers.connect_offer(&from, self.media.tracks()).await {
                    self.viewers.remove(&from);
                    self.emit(ScreenShareEvent::Error(e));
                }
            }

            other => {
                if other.namespace() != Some(Namespace::ScreenShare) {
                    return;
                }
                let Some((from, step)) = other.negotiation() else {
                    return;
                };
                if !self.watching.contains(&from) && !self.viewers.contains(&from) {
                    debug!(from = %from, "Ignoring screen share negotiation from stranger");
                    return;
                }
                if let Err(e) = self.peers.negotiate(&from, step).await {
                    self.watching.remove(&from);
                    self.viewers.remove(&from);
                    self.emit(ScreenShareEvent::Error(e));
                }
            }
        }
    }

    pub async fn handle_peer_event(&mut self, ev: PeerEvent) {
        let Some((remote, state)) = self.peers.handle_transport_event(ev) else {
            return;
        };
        match state {
            TransportState::Connected if self.watching.contains(&remote) => {
                info!(sharer = %remote, "Screen share stream ready");
                self.emit(ScreenShareEvent::StreamReady { sharer: remote });
            }
            TransportState::Disconnected | TransportState::Failed => {
                warn!(remote = %remote, %state, "Screen share transport lost");
            }
            _ => {}
        }
    }

    fn emit(&self, event: ScreenShareEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            debug!(error = %e, "Dropping screen share event");
        }
    }
}

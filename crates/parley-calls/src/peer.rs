//! One negotiated transport per remote endpoint.
//!
//! The manager owns every peer record for one signaling namespace. It
//! attaches local tracks when a transport is created, buffers remote ICE
//! candidates until the remote description is in place, forwards local
//! candidates to the relay, and keeps a registry of the streams each
//! remote is sending us.

use std::collections::HashMap;
use std::sync::Arc;

use parley_common::{
    CallError, EndpointId, IceCandidate, Namespace, Negotiation, SessionDescription,
};
use parley_config::IceConfig;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::media::MediaTrack;
use crate::signaling::SignalingSink;
use crate::transport::{
    PeerEvent, PeerTransport, RemoteStream, TransportError, TransportEvent, TransportEvents,
    TransportFactory, TransportState,
};

struct PeerRecord {
    transport_id: u64,
    transport: Arc<dyn PeerTransport>,
    remote_description_set: bool,
    /// Candidates received before the remote description, in arrival order.
    pending: Vec<IceCandidate>,
}

/// Owns the peer records of one namespace.
pub struct PeerConnectionManager {
    namespace: Namespace,
    ice: IceConfig,
    factory: Arc<dyn TransportFactory>,
    signaling: Arc<dyn SignalingSink>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    records: HashMap<EndpointId, PeerRecord>,
    /// Candidates for remotes that have no record yet.
    early: HashMap<EndpointId, Vec<IceCandidate>>,
    streams: HashMap<EndpointId, RemoteStream>,
    next_transport_id: u64,
}

fn negotiation_error(remote: &EndpointId, step: &str, e: TransportError) -> CallError {
    CallError::Negotiation(format!("{step} with {remote} failed: {e}"))
}

impl PeerConnectionManager {
    pub fn new(
        namespace: Namespace,
        ice: IceConfig,
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingSink>,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mgr = Self {
            namespace,
            ice,
            factory,
            signaling,
            events_tx,
            records: HashMap::new(),
            early: HashMap::new(),
            streams: HashMap::new(),
            next_transport_id: 1,
        };
        (mgr, events_rx)
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// Create the transport for `remote` with `tracks` attached, replacing
    /// any previous one.
    pub async fn prepare(
        &mut self,
        remote: &EndpointId,
        tracks: &[MediaTrack],
    ) -> Result<Arc<dyn PeerTransport>, CallError> {
        self.close(remote).await;

        let transport_id = self.next_transport_id;
        self.next_transport_id += 1;

        let events = TransportEvents::new(remote.clone(), transport_id, self.events_tx.clone());
        let transport = self
            .factory
            .create(&self.ice, events)
            .await
            .map_err(|e| negotiation_error(remote, "creating transport", e))?;

        for track in tracks {
            if let Err(e) = transport.add_track(track.clone()).await {
                transport.close().await;
                return Err(negotiation_error(remote, "attaching track", e));
            }
        }

        let pending = self.early.remove(remote).unwrap_or_default();
        self.records.insert(
            remote.clone(),
            PeerRecord {
                transport_id,
                transport: Arc::clone(&transport),
                remote_description_set: false,
                pending,
            },
        );
        debug!(namespace = ?self.namespace, remote = %remote, transport_id, "Peer record created");
        Ok(transport)
    }

    /// Offering side: create the transport, then send an offer.
    pub async fn connect_offer(
        &mut self,
        remote: &EndpointId,
        tracks: &[MediaTrack],
    ) -> Result<(), CallError> {
        let transport = self.prepare(remote, tracks).await?;
        let result = async {
            let offer = transport
                .create_offer()
                .await
                .map_err(|e| negotiation_error(remote, "creating offer", e))?;
            transport
                .set_local_description(offer.clone())
                .await
                .map_err(|e| negotiation_error(remote, "applying local offer", e))?;
            self.send(remote, Negotiation::Offer(offer))
        }
        .await;
        self.close_on_error(remote, result).await
    }

    /// Answering side: apply a remote offer and reply with an answer. Uses
    /// the prepared record if there is one, otherwise creates a receive-only
    /// transport.
    pub async fn accept_offer(
        &mut self,
        remote: &EndpointId,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        if !self.records.contains_key(remote) {
            self.prepare(remote, &[]).await?;
        }
        let result = async {
            self.apply_remote_description(remote, offer).await?;
            let transport = self.transport(remote).ok_or_else(|| {
                CallError::Negotiation(format!("peer {remote} closed during negotiation"))
            })?;
            let answer = transport
                .create_answer()
                .await
                .map_err(|e| negotiation_error(remote, "creating answer", e))?;
            transport
                .set_local_description(answer.clone())
                .await
                .map_err(|e| negotiation_error(remote, "applying local answer", e))?;
            self.send(remote, Negotiation::Answer(answer))
        }
        .await;
        self.close_on_error(remote, result).await
    }

    /// Offering side: apply the remote answer.
    pub async fn apply_answer(
        &mut self,
        remote: &EndpointId,
        answer: SessionDescription,
    ) -> Result<(), CallError> {
        if !self.records.contains_key(remote) {
            return Err(CallError::Negotiation(format!(
                "answer from {remote} without a pending offer"
            )));
        }
        let result = self.apply_remote_description(remote, answer).await;
        self.close_on_error(remote, result).await
    }

    /// Apply a remote candidate now, or buffer it until the remote
    /// description is set.
    pub async fn add_remote_candidate(&mut self, remote: &EndpointId, candidate: IceCandidate) {
        let Some(record) = self.records.get_mut(remote) else {
            debug!(remote = %remote, "Buffering ICE candidate for unknown peer");
            self.early.entry(remote.clone()).or_default().push(candidate);
            return;
        };

        if !record.remote_description_set {
            record.pending.push(candidate);
            return;
        }

        if let Err(e) = record.transport.add_ice_candidate(candidate).await {
            warn!(remote = %remote, error = %e, "Failed to add ICE candidate");
        }
    }

    /// Route a delivered negotiation step to the right operation.
    pub async fn negotiate(&mut self, from: &EndpointId, step: Negotiation) -> Result<(), CallError> {
        match step {
            Negotiation::Offer(offer) => self.accept_offer(from, offer).await,
            Negotiation::Answer(answer) => self.apply_answer(from, answer).await,
            Negotiation::IceCandidate(candidate) => {
                self.add_remote_candidate(from, candidate).await;
                Ok(())
            }
        }
    }

    /// Digest a transport event. Returns the new state when the link state
    /// of a live record changed; events from closed or replaced transports
    /// are dropped.
    pub fn handle_transport_event(&mut self, ev: PeerEvent) -> Option<(EndpointId, TransportState)> {
        let live = self
            .records
            .get(&ev.remote)
            .is_some_and(|r| r.transport_id == ev.transport_id);
        if !live {
            debug!(remote = %ev.remote, transport_id = ev.transport_id, "Ignoring stale transport event");
            return None;
        }

        match ev.event {
            TransportEvent::IceCandidate(candidate) => {
                if let Err(e) = self.send(&ev.remote, Negotiation::IceCandidate(candidate)) {
                    warn!(remote = %ev.remote, error = %e, "Failed to forward ICE candidate");
                }
                None
            }
            TransportEvent::Track(stream) => {
                info!(namespace = ?self.namespace, remote = %ev.remote, stream = %stream.id, "Remote stream added");
                self.streams.insert(ev.remote, stream);
                None
            }
            TransportEvent::StateChanged(state) => Some((ev.remote, state)),
        }
    }

    /// Close and forget the record for `remote`. Returns whether there was
    /// one; closing an unknown peer is a no-op.
    pub async fn close(&mut self, remote: &EndpointId) -> bool {
        self.early.remove(remote);
        self.streams.remove(remote);
        match self.records.remove(remote) {
            Some(record) => {
                record.transport.close().await;
                debug!(namespace = ?self.namespace, remote = %remote, "Peer record closed");
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&mut self) {
        let remotes: Vec<EndpointId> = self.records.keys().cloned().collect();
        for remote in remotes {
            self.close(&remote).await;
        }
        self.early.clear();
        self.streams.clear();
    }

    pub fn transport(&self, remote: &EndpointId) -> Option<Arc<dyn PeerTransport>> {
        self.records.get(remote).map(|r| Arc::clone(&r.transport))
    }

    pub fn has_peer(&self, remote: &EndpointId) -> bool {
        self.records.contains_key(remote)
    }

    pub fn peer_count(&self) -> usize {
        self.records.len()
    }

    pub fn peers(&self) -> Vec<EndpointId> {
        self.records.keys().cloned().collect()
    }

    pub fn stream(&self, remote: &EndpointId) -> Option<&RemoteStream> {
        self.streams.get(remote)
    }

    pub fn streams(&self) -> &HashMap<EndpointId, RemoteStream> {
        &self.streams
    }

    async fn apply_remote_description(
        &mut self,
        remote: &EndpointId,
        desc: SessionDescription,
    ) -> Result<(), CallError> {
        let record = self.records.get_mut(remote).ok_or_else(|| {
            CallError::Negotiation(format!("no peer connection for {remote}"))
        })?;
        record
            .transport
            .set_remote_description(desc)
            .await
            .map_err(|e| negotiation_error(remote, "applying remote description", e))?;
        record.remote_description_set = true;

        let pending = std::mem::take(&mut record.pending);
        if !pending.is_empty() {
            debug!(remote = %remote, count = pending.len(), "Flushing buffered ICE candidates");
        }
        for candidate in pending {
            if let Err(e) = record.transport.add_ice_candidate(candidate).await {
                warn!(remote = %remote, error = %e, "Failed to add buffered ICE candidate");
            }
        }
        Ok(())
    }

    fn send(&self, remote: &EndpointId, step: Negotiation) -> Result<(), CallError> {
        self.signaling
            .send(self.namespace.envelope(remote.clone(), step))
    }

    async fn close_on_error(
        &mut self,
        remote: &EndpointId,
        result: Result<(), CallError>,
    ) -> Result<(), CallError> {
        if let Err(e) = &result {
            warn!(namespace = ?self.namespace, remote = %remote, error = %e, "Negotiation failed, closing peer");
            self.close(remote).await;
        }
        result
    }
}

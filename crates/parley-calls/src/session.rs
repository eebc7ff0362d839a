//! The call session state machine.
//!
//! One [`CallSession`] per local endpoint. It owns the call lifecycle:
//! acquiring local media, emitting control envelopes, driving the peer
//! connection manager through negotiation, starting quality monitoring
//! once the link is up, and keeping the call log in step. Everything runs
//! on the caller's task; the session holds no locks across calls.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parley_common::{
    CallError, CallId, CallKind, ClientMessage, ConnectionState, Endpoint, EndpointId, ErrorCode,
    Namespace, RejectReason, ServerMessage,
};
use parley_config::{IceConfig, QualityConfig};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::history::{
    CallDirection, CallLogEntry, CallLogStore, CallLogUpdate, CallOutcome,
};
use crate::media::{LocalMedia, MediaDevices};
use crate::peer::PeerConnectionManager;
use crate::quality::{QualityMonitor, QualitySample};
use crate::signaling::SignalingSink;
use crate::transport::{PeerEvent, RemoteStream, TransportFactory, TransportState};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    OutgoingRinging,
    IncomingRinging,
    Connecting,
    Active,
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::OutgoingRinging => "ringing (outgoing)",
            Self::IncomingRinging => "ringing (incoming)",
            Self::Connecting => "connecting",
            Self::Active => "active",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Initiator,
    Receiver,
}

/// The current call, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct CallState {
    pub call_id: CallId,
    pub role: CallRole,
    pub kind: CallKind,
    pub phase: CallPhase,
    pub remote: Endpoint,
}

/// Notifications for the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Incoming {
        call_id: CallId,
        caller: Endpoint,
        kind: CallKind,
    },
    /// An invitation arrived while busy and was turned down automatically.
    BusyRejected {
        call_id: CallId,
        caller: Endpoint,
    },
    PhaseChanged {
        call_id: CallId,
        phase: CallPhase,
    },
    Ended {
        call_id: CallId,
        outcome: CallOutcome,
    },
    Error(CallError),
}

/// Collaborators a session is built from.
#[derive(Clone)]
pub struct SessionDeps {
    pub devices: Arc<dyn MediaDevices>,
    pub transports: Arc<dyn TransportFactory>,
    pub signaling: Arc<dyn SignalingSink>,
    pub history: Arc<dyn CallLogStore>,
}

/// The history row this call writes to.
struct OpenLogEntry {
    id: String,
    started_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Call Session
// ---------------------------------------------------------------------------

pub struct CallSession {
    devices: Arc<dyn MediaDevices>,
    signaling: Arc<dyn SignalingSink>,
    history: Arc<dyn CallLogStore>,
    peers: PeerConnectionManager,
    monitor: QualityMonitor,
    media: LocalMedia,
    call: Option<CallState>,
    log_entry: Option<OpenLogEntry>,
    /// Whether the transport reached `connected` during this call.
    connected: bool,
    connection_tx: watch::Sender<ConnectionState>,
    event_tx: mpsc::Sender<CallEvent>,
}

impl CallSession {
    /// Build a session. Returns the UI event stream and the transport event
    /// stream, which must be fed back through [`Self::handle_peer_event`].
    pub fn new(
        deps: SessionDeps,
        ice: IceConfig,
        quality: QualityConfig,
    ) -> (
        Self,
        mpsc::Receiver<CallEvent>,
        mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (peers, peer_rx) = PeerConnectionManager::new(
            Namespace::Call,
            ice,
            deps.transports,
            Arc::clone(&deps.signaling),
        );
        let (connection_tx, _) = watch::channel(ConnectionState::Idle);
        let session = Self {
            devices: deps.devices,
            signaling: deps.signaling,
            history: deps.history,
            peers,
            monitor: QualityMonitor::new(quality),
            media: LocalMedia::default(),
            call: None,
            log_entry: None,
            connected: false,
            connection_tx,
            event_tx,
        };
        (session, event_rx, peer_rx)
    }

    // -- accessors ----------------------------------------------------------

    pub fn call(&self) -> Option<&CallState> {
        self.call.as_ref()
    }

    pub fn phase(&self) -> CallPhase {
        self.call.as_ref().map_or(CallPhase::Idle, |c| c.phase)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection_tx.borrow()
    }

    /// Observe the link state of the current call.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection_tx.subscribe()
    }

    pub fn media(&self) -> &LocalMedia {
        &self.media
    }

    pub fn peers(&self) -> &PeerConnectionManager {
        &self.peers
    }

    pub fn remote_streams(&self) -> &HashMap<EndpointId, RemoteStream> {
        self.peers.streams()
    }

    pub async fn quality(&self, remote: &EndpointId) -> Option<QualitySample> {
        self.monitor.sample(remote).await
    }

    pub async fn quality_samples(&self) -> HashMap<EndpointId, QualitySample> {
        self.monitor.samples().await
    }

    pub fn history(&self) -> &Arc<dyn CallLogStore> {
        &self.history
    }

    // -- user actions -------------------------------------------------------

    /// Place a call. Only valid while idle.
    pub async fn start_call(&mut self, target: Endpoint, kind: CallKind) -> Result<CallId, CallError> {
        self.require_idle("start a call")?;

        self.media = LocalMedia::acquire(self.devices.as_ref(), kind)
            .await
            .map_err(|e| {
                warn!(callee = %target.id, error = %e, "Media acquisition failed");
                CallError::from(e)
            })?;

        let call_id = CallId::new();
        info!(call_id = %call_id, callee = %target.id, ?kind, "Starting call");

        self.open_log(CallLogEntry::new(
            target.username.clone(),
            CallDirection::Outgoing,
            CallOutcome::Answered,
            kind.is_video(),
        ))
        .await;

        self.call = Some(CallState {
            call_id: call_id.clone(),
            role: CallRole::Initiator,
            kind,
            phase: CallPhase::OutgoingRinging,
            remote: target.clone(),
        });
        self.connected = false;
        self.set_connection(ConnectionState::Connecting);
        self.emit_phase();

        if let Err(e) = self.signaling.send(ClientMessage::CallInitiate {
            call_id: call_id.clone(),
            target_id: target.id,
            kind,
        }) {
            self.finish(CallOutcome::Failed).await;
            return Err(e);
        }
        Ok(call_id)
    }

    /// Accept the ringing invitation.
    pub async fn answer(&mut self) -> Result<(), CallError> {
        let (call_id, kind, remote) = match &self.call {
            Some(c) if c.phase == CallPhase::IncomingRinging => {
                (c.call_id.clone(), c.kind, c.remote.clone())
            }
            _ => return Err(self.invalid_state("answer")),
        };

        match LocalMedia::acquire(self.devices.as_ref(), kind).await {
            Ok(media) => self.media = media,
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "Media acquisition failed, rejecting call");
                let _ = self.signaling.send(ClientMessage::CallReject {
                    call_id: call_id.clone(),
                    reason: RejectReason::Unavailable,
                });
                self.reset();
                return Err(e.into());
            }
        }

        info!(call_id = %call_id, caller = %remote.id, "Answering call");
        self.open_log(CallLogEntry::new(
            remote.username.clone(),
            CallDirection::Incoming,
            CallOutcome::Answered,
            kind.is_video(),
        ))
        .await;

        if let Err(e) = self.peers.prepare(&remote.id, self.media.tracks()).await {
            self.fail(e.clone()).await;
            return Err(e);
        }

        self.set_phase(CallPhase::Connecting);
        if let Err(e) = self.signaling.send(ClientMessage::CallAccept { call_id }) {
            self.finish(CallOutcome::Failed).await;
            return Err(e);
        }
        Ok(())
    }

    /// Decline the ringing invitation.
    pub async fn reject(&mut self) -> Result<(), CallError> {
        let Some(call) = self
            .call
            .as_ref()
            .filter(|c| c.phase == CallPhase::IncomingRinging)
            .cloned()
        else {
            return Err(self.invalid_state("reject"));
        };

        info!(call_id = %call.call_id, caller = %call.remote.id, "Rejecting call");
        self.append_closed(&call.remote, CallOutcome::Declined, call.kind)
            .await;
        if let Err(e) = self.signaling.send(ClientMessage::CallReject {
            call_id: call.call_id.clone(),
            reason: RejectReason::Declined,
        }) {
            warn!(call_id = %call.call_id, error = %e, "Could not send reject");
        }
        self.reset();
        self.emit(CallEvent::Ended {
            call_id: call.call_id,
            outcome: CallOutcome::Declined,
        });
        Ok(())
    }

    /// Hang up. A no-op while idle; while an invitation is ringing this
    /// declines it.
    pub async fn end_call(&mut self) -> Result<(), CallError> {
        let Some(call) = self.call.clone() else {
            debug!("end_call while idle");
            return Ok(());
        };
        if call.phase == CallPhase::IncomingRinging {
            return self.reject().await;
        }

        info!(call_id = %call.call_id, phase = %call.phase, "Ending call");
        if let Err(e) = self.signaling.send(ClientMessage::CallEnd {
            call_id: call.call_id,
        }) {
            warn!(error = %e, "Could not send call end");
        }
        let outcome = self.ended_outcome();
        self.finish(outcome).await;
        Ok(())
    }

    /// Flip the microphone. Returns whether it is now muted.
    pub fn toggle_mute(&mut self) -> Result<bool, CallError> {
        self.media
            .toggle_mute()
            .ok_or_else(|| self.invalid_state("toggle mute"))
    }

    /// Flip the camera. Returns whether it is now off.
    pub fn toggle_video(&mut self) -> Result<bool, CallError> {
        self.media
            .toggle_video()
            .ok_or_else(|| self.invalid_state("toggle video"))
    }

    // -- inbound ------------------------------------------------------------

    /// React to a relay message in the call namespace. Anything that does
    /// not belong to the current call is ignored.
    pub async fn handle_signal(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::CallIncoming {
                call_id,
                caller,
                kind,
            } => self.on_incoming(call_id, caller, kind).await,

            ServerMessage::CallAccepted { call_id, from } => {
                if !self.matches(&call_id, &from, &[CallPhase::OutgoingRinging]) {
                    debug!(call_id = %call_id, "Ignoring stray accept");
                    return;
                }
                info!(call_id = %call_id, "Call accepted, sending offer");
                self.set_phase(CallPhase::Connecting);
                if let Err(e) = self.peers.connect_offer(&from, self.media.tracks()).await {
                    self.fail(e).await;
                }
            }

            ServerMessage::CallRejected {
                call_id,
                from,
                reason,
            } => {
                if !self.matches(&call_id, &from, &[CallPhase::OutgoingRinging]) {
                    debug!(call_id = %call_id, "Ignoring stray reject");
                    return;
                }
                info!(call_id = %call_id, ?reason, "Call rejected");
                if reason == RejectReason::Busy {
                    self.emit(CallEvent::Error(CallError::Busy));
                }
                self.finish(CallOutcome::Declined).await;
            }

            ServerMessage::CallEnded { call_id, from } => self.on_remote_end(call_id, from).await,

            ServerMessage::Error {
                code,
                message,
                call_id: Some(call_id),
            } => {
                let ours = self.call.as_ref().is_some_and(|c| c.call_id == call_id);
                if !ours {
                    return;
                }
                match code {
                    ErrorCode::UserNotFound | ErrorCode::InvalidTarget => {
                        warn!(call_id = %call_id, %message, "Call target unavailable");
                        self.emit(CallEvent::Error(CallError::UnknownEndpoint(message)));
                        self.finish(CallOutcome::Failed).await;
                    }
                    _ => warn!(call_id = %call_id, ?code, %message, "Relay error"),
                }
            }

            other => {
                let Some((from, step)) = other.negotiation() else {
                    return;
                };
                if other.namespace() != Some(Namespace::Call) {
                    return;
                }
                let expected = self.call.as_ref().is_some_and(|c| {
                    c.remote.id == from
                        && matches!(c.phase, CallPhase::Connecting | CallPhase::Active)
                });
                if !expected {
                    debug!(from = %from, "Ignoring negotiation outside a call");
                    return;
                }
                if let Err(e) = self.peers.negotiate(&from, step).await {
                    self.fail(e).await;
                }
            }
        }
    }

    /// Feed a transport event from the receiver returned by [`Self::new`].
    pub async fn handle_peer_event(&mut self, ev: PeerEvent) {
        let Some((remote, state)) = self.peers.handle_transport_event(ev) else {
            return;
        };
        let Some(call) = self.call.as_ref().filter(|c| c.remote.id == remote) else {
            return;
        };
        debug!(call_id = %call.call_id, remote = %remote, %state, "Transport state changed");

        match state {
            TransportState::Connected => {
                self.connected = true;
                self.set_connection(ConnectionState::Connected);
                if self.phase() == CallPhase::Connecting {
                    self.set_phase(CallPhase::Active);
                }
                if let Some(transport) = self.peers.transport(&remote) {
                    self.monitor.start(&remote, transport).await;
                }
            }
            TransportState::Connecting => self.set_connection(ConnectionState::Connecting),
            TransportState::Disconnected => {
                warn!(remote = %remote, "Transport disconnected");
                self.monitor.stop(&remote).await;
                self.set_connection(ConnectionState::Disconnected);
            }
            TransportState::Failed => {
                warn!(remote = %remote, "Transport failed");
                self.monitor.stop(&remote).await;
                self.set_connection(ConnectionState::Failed);
            }
            TransportState::New | TransportState::Closed => {}
        }
    }

    async fn on_incoming(&mut self, call_id: CallId, caller: Endpoint, kind: CallKind) {
        if let Some(current) = &self.call {
            if current.call_id == call_id {
                debug!(call_id = %call_id, "Duplicate incoming notice for current call");
                return;
            }
            info!(
                call_id = %call_id,
                caller = %caller.id,
                current = %current.call_id,
                "Busy, rejecting incoming call"
            );
            if let Err(e) = self.signaling.send(ClientMessage::CallReject {
                call_id: call_id.clone(),
                reason: RejectReason::Busy,
            }) {
                warn!(error = %e, "Could not send busy reject");
            }
            self.append_closed(&caller, CallOutcome::Missed, kind).await;
            self.emit(CallEvent::BusyRejected { call_id, caller });
            return;
        }

        info!(call_id = %call_id, caller = %caller.id, ?kind, "Incoming call");
        self.call = Some(CallState {
            call_id: call_id.clone(),
            role: CallRole::Receiver,
            kind,
            phase: CallPhase::IncomingRinging,
            remote: caller.clone(),
        });
        self.connected = false;
        self.emit(CallEvent::Incoming {
            call_id,
            caller,
            kind,
        });
    }

    async fn on_remote_end(&mut self, call_id: Option<CallId>, from: EndpointId) {
        let Some(call) = self.call.clone() else {
            return;
        };
        let ours = match &call_id {
            Some(id) => *id == call.call_id,
            None => from == call.remote.id,
        };
        if !ours || from != call.remote.id {
            debug!(from = %from, "Ignoring stray end");
            return;
        }

        info!(call_id = %call.call_id, phase = %call.phase, "Remote ended call");
        if call.phase == CallPhase::IncomingRinging {
            self.append_closed(&call.remote, CallOutcome::Missed, call.kind)
                .await;
            self.reset();
            self.emit(CallEvent::Ended {
                call_id: call.call_id,
                outcome: CallOutcome::Missed,
            });
            return;
        }
        let outcome = self.ended_outcome();
        self.finish(outcome).await;
    }

    // -- internals ----------------------------------------------------------

    fn matches(&self, call_id: &CallId, from: &EndpointId, phases: &[CallPhase]) -> bool {
        self.call.as_ref().is_some_and(|c| {
            c.call_id == *call_id && c.remote.id == *from && phases.contains(&c.phase)
        })
    }

    /// Outcome for a call that ends now without a rejection or error.
    fn ended_outcome(&self) -> CallOutcome {
        if self.connected {
            CallOutcome::Answered
        } else {
            CallOutcome::Missed
        }
    }

    fn require_idle(&self, operation: &'static str) -> Result<(), CallError> {
        match self.call {
            None => Ok(()),
            Some(_) => Err(self.invalid_state(operation)),
        }
    }

    fn invalid_state(&self, operation: &'static str) -> CallError {
        CallError::InvalidState {
            operation,
            phase: self.phase().to_string(),
        }
    }

    /// A negotiation step failed: close out the call as failed.
    async fn fail(&mut self, error: CallError) {
        warn!(error = %error, "Call failed");
        if let Some(call) = &self.call {
            let _ = self.signaling.send(ClientMessage::CallEnd {
                call_id: call.call_id.clone(),
            });
        }
        self.emit(CallEvent::Error(error));
        self.finish(CallOutcome::Failed).await;
    }

    /// Tear everything down, finalize the log entry, and go idle.
    async fn finish(&mut self, outcome: CallOutcome) {
        let call_id = self.call.as_ref().map(|c| c.call_id.clone());
        self.teardown().await;

        if let Some(entry) = self.log_entry.take() {
            let update = CallLogUpdate::finished(entry.started_at, outcome);
            if let Err(e) = self.history.update(&entry.id, update).await {
                warn!(error = %e, "Failed to finalize call log entry");
            }
        }

        self.reset();
        if let Some(call_id) = call_id {
            info!(call_id = %call_id, ?outcome, "Call finished");
            self.emit(CallEvent::Ended { call_id, outcome });
        }
    }

    async fn teardown(&mut self) {
        self.media.stop_all();
        self.monitor.stop_all().await;
        self.peers.close_all().await;
    }

    fn reset(&mut self) {
        self.media.stop_all();
        self.call = None;
        self.log_entry = None;
        self.connected = false;
        self.set_connection(ConnectionState::Idle);
    }

    async fn open_log(&mut self, entry: CallLogEntry) {
        let open = OpenLogEntry {
            id: entry.id.clone(),
            started_at: entry.started_at,
        };
        match self.history.append(entry).await {
            Ok(()) => self.log_entry = Some(open),
            Err(e) => warn!(error = %e, "Failed to write call log entry"),
        }
    }

    async fn append_closed(&self, remote: &Endpoint, outcome: CallOutcome, kind: CallKind) {
        let entry = CallLogEntry::new(
            remote.username.clone(),
            CallDirection::Incoming,
            outcome,
            kind.is_video(),
        )
        .closed();
        if let Err(e) = self.history.append(entry).await {
            warn!(error = %e, "Failed to write call log entry");
        }
    }

    fn set_phase(&mut self, phase: CallPhase) {
        if let Some(call) = &mut self.call {
            call.phase = phase;
        }
        self.emit_phase();
    }

    fn emit_phase(&self) {
        if let Some(call) = &self.call {
            self.emit(CallEvent::PhaseChanged {
                call_id: call.call_id.clone(),
                phase: call.phase,
            });
        }
    }

    fn set_connection(&self, state: ConnectionState) {
        self.connection_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn emit(&self, event: CallEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            debug!(error = %e, "Dropping call event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryCallLog;
    use crate::loopback::{LoopbackDevices, LoopbackFactory};
    use crate::media::TrackKind;
    use parley_common::{DeviceError, SessionDescription};

    struct Harness {
        session: CallSession,
        events: mpsc::Receiver<CallEvent>,
        peer_events: mpsc::UnboundedReceiver<PeerEvent>,
        outbox: mpsc::UnboundedReceiver<ClientMessage>,
        devices: Arc<LoopbackDevices>,
        factory: LoopbackFactory,
        history: Arc<MemoryCallLog>,
    }

    fn harness() -> Harness {
        let devices = Arc::new(LoopbackDevices::new());
        let factory = LoopbackFactory::new();
        let history = Arc::new(MemoryCallLog::default());
        let (tx, outbox) = mpsc::unbounded_channel();
        let deps = SessionDeps {
            devices: devices.clone(),
            transports: Arc::new(factory.clone()),
            signaling: Arc::new(tx),
            history: history.clone(),
        };
        let (session, events, peer_events) =
            CallSession::new(deps, IceConfig::default(), QualityConfig::default());
        Harness {
            session,
            events,
            peer_events,
            outbox,
            devices,
            factory,
            history,
        }
    }

    fn sent(h: &mut Harness) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(m) = h.outbox.try_recv() {
            out.push(m);
        }
        out
    }

    fn events(h: &mut Harness) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while let Ok(e) = h.events.try_recv() {
            out.push(e);
        }
        out
    }

    async fn pump_peer(h: &mut Harness) {
        while let Ok(ev) = h.peer_events.try_recv() {
            h.session.handle_peer_event(ev).await;
        }
    }

    fn bob() -> Endpoint {
        Endpoint::new("bob", "Bob")
    }

    fn alice() -> Endpoint {
        Endpoint::new("alice", "Alice")
    }

    async fn ring_in(h: &mut Harness, kind: CallKind) -> CallId {
        let call_id = CallId::new();
        h.session
            .handle_signal(ServerMessage::CallIncoming {
                call_id: call_id.clone(),
                caller: alice(),
                kind,
            })
            .await;
        call_id
    }

    #[tokio::test]
    async fn start_call_rings_and_logs_optimistically() {
        let mut h = harness();
        let call_id = h.session.start_call(bob(), CallKind::Video).await.unwrap();

        assert_eq!(h.session.phase(), CallPhase::OutgoingRinging);
        assert_eq!(h.session.media().tracks().len(), 2);
        assert_eq!(h.session.connection_state(), ConnectionState::Connecting);
        assert!(matches!(
            &sent(&mut h)[..],
            [ClientMessage::CallInitiate { call_id: id, kind: CallKind::Video, .. }] if *id == call_id
        ));

        let log = h.history.list().await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].direction, CallDirection::Outgoing);
        assert_eq!(log[0].outcome, CallOutcome::Answered);
        assert!(log[0].is_video);
    }

    #[tokio::test]
    async fn start_call_device_failure_stays_idle_and_clean() {
        let mut h = harness();
        h.devices.fail(TrackKind::Video, DeviceError::PermissionDenied);

        let err = h.session.start_call(bob(), CallKind::Video).await.unwrap_err();
        assert_eq!(
            err,
            CallError::DeviceAcquisition(DeviceError::PermissionDenied)
        );
        assert_eq!(h.session.phase(), CallPhase::Idle);
        assert_eq!(h.devices.live(), 0);
        assert!(h.history.list().await.unwrap().is_empty());
        assert!(sent(&mut h).is_empty());
    }

    #[tokio::test]
    async fn start_call_while_busy_is_invalid() {
        let mut h = harness();
        h.session.start_call(bob(), CallKind::Voice).await.unwrap();
        let err = h.session.start_call(alice(), CallKind::Voice).await.unwrap_err();
        assert!(matches!(err, CallError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn accepted_call_sends_offer() {
        let mut h = harness();
        let call_id = h.session.start_call(bob(), CallKind::Voice).await.unwrap();
        sent(&mut h);

        h.session
            .handle_signal(ServerMessage::CallAccepted {
                call_id,
                from: bob().id,
            })
            .await;
        assert_eq!(h.session.phase(), CallPhase::Connecting);
        assert!(matches!(sent(&mut h)[0], ClientMessage::CallOffer { .. }));
        assert_eq!(h.session.peers().peer_count(), 1);
    }

    #[tokio::test]
    async fn rejected_outgoing_call_is_declined() {
        let mut h = harness();
        let call_id = h.session.start_call(bob(), CallKind::Voice).await.unwrap();
        h.session
            .handle_signal(ServerMessage::CallRejected {
                call_id: call_id.clone(),
                from: bob().id,
                reason: RejectReason::Declined,
            })
            .await;

        assert_eq!(h.session.phase(), CallPhase::Idle);
        assert_eq!(h.devices.live(), 0);
        let log = h.history.list().await.unwrap();
        assert_eq!(log[0].outcome, CallOutcome::Declined);
        assert!(events(&mut h).contains(&CallEvent::Ended {
            call_id,
            outcome: CallOutcome::Declined
        }));
    }

    #[tokio::test]
    async fn unknown_target_fails_the_call() {
        let mut h = harness();
        let call_id = h.session.start_call(bob(), CallKind::Voice).await.unwrap();
        h.session
            .handle_signal(ServerMessage::Error {
                code: ErrorCode::UserNotFound,
                message: "user not found".into(),
                call_id: Some(call_id),
            })
            .await;

        assert_eq!(h.session.phase(), CallPhase::Idle);
        assert_eq!(h.history.list().await.unwrap()[0].outcome, CallOutcome::Failed);
        assert!(events(&mut h)
            .iter()
            .any(|e| matches!(e, CallEvent::Error(CallError::UnknownEndpoint(_)))));
    }

    #[tokio::test]
    async fn ending_before_connect_is_missed() {
        let mut h = harness();
        h.session.start_call(bob(), CallKind::Voice).await.unwrap();
        h.session.end_call().await.unwrap();

        assert_eq!(h.history.list().await.unwrap()[0].outcome, CallOutcome::Missed);
        assert!(matches!(
            sent(&mut h).last(),
            Some(ClientMessage::CallEnd { .. })
        ));
    }

    #[tokio::test]
    async fn end_call_twice_finalizes_once() {
        let mut h = harness();
        h.session.start_call(bob(), CallKind::Voice).await.unwrap();
        h.session.end_call().await.unwrap();
        h.session.end_call().await.unwrap();

        let ends = sent(&mut h)
            .into_iter()
            .filter(|m| matches!(m, ClientMessage::CallEnd { .. }))
            .count();
        assert_eq!(ends, 1);
        let ended_events = events(&mut h)
            .into_iter()
            .filter(|e| matches!(e, CallEvent::Ended { .. }))
            .count();
        assert_eq!(ended_events, 1);
        assert_eq!(h.history.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn end_call_while_idle_is_noop() {
        let mut h = harness();
        h.session.end_call().await.unwrap();
        assert!(sent(&mut h).is_empty());
    }

    #[tokio::test]
    async fn incoming_call_rings_without_media() {
        let mut h = harness();
        let call_id = ring_in(&mut h, CallKind::Video).await;

        assert_eq!(h.session.phase(), CallPhase::IncomingRinging);
        assert!(h.devices.issued().is_empty());
        assert!(events(&mut h).contains(&CallEvent::Incoming {
            call_id,
            caller: alice(),
            kind: CallKind::Video
        }));
    }

    #[tokio::test]
    async fn reject_logs_declined_with_zero_duration() {
        let mut h = harness();
        let call_id = ring_in(&mut h, CallKind::Voice).await;
        h.session.reject().await.unwrap();

        assert_eq!(h.session.phase(), CallPhase::Idle);
        assert!(h.devices.issued().is_empty());
        assert_eq!(h.factory.transports().len(), 0);
        assert!(matches!(
            &sent(&mut h)[..],
            [ClientMessage::CallReject { call_id: id, reason: RejectReason::Declined }] if *id == call_id
        ));
        let log = h.history.list().await.unwrap();
        assert_eq!(log[0].direction, CallDirection::Incoming);
        assert_eq!(log[0].outcome, CallOutcome::Declined);
        assert_eq!(log[0].duration_seconds, Some(0));
    }

    #[tokio::test]
    async fn end_call_while_ringing_rejects() {
        let mut h = harness();
        ring_in(&mut h, CallKind::Voice).await;
        h.session.end_call().await.unwrap();
        assert!(matches!(sent(&mut h)[0], ClientMessage::CallReject { .. }));
        assert_eq!(h.history.list().await.unwrap()[0].outcome, CallOutcome::Declined);
    }

    #[tokio::test]
    async fn answer_prepares_peer_and_accepts() {
        let mut h = harness();
        let call_id = ring_in(&mut h, CallKind::Video).await;
        h.session.answer().await.unwrap();

        assert_eq!(h.session.phase(), CallPhase::Connecting);
        assert!(h.session.peers().has_peer(&alice().id));
        assert_eq!(
            h.factory.transport_for(&alice().id).unwrap().local_tracks().len(),
            2
        );
        assert!(matches!(
            &sent(&mut h)[..],
            [ClientMessage::CallAccept { call_id: id }] if *id == call_id
        ));
        let log = h.history.list().await.unwrap();
        assert_eq!(log[0].direction, CallDirection::Incoming);
        assert_eq!(log[0].outcome, CallOutcome::Answered);
    }

    #[tokio::test]
    async fn answer_device_failure_rejects_as_unavailable() {
        let mut h = harness();
        h.devices.fail(TrackKind::Audio, DeviceError::NotFound);
        ring_in(&mut h, CallKind::Voice).await;

        let err = h.session.answer().await.unwrap_err();
        assert_eq!(err, CallError::DeviceAcquisition(DeviceError::NotFound));
        assert_eq!(h.session.phase(), CallPhase::Idle);
        assert!(matches!(
            sent(&mut h)[0],
            ClientMessage::CallReject {
                reason: RejectReason::Unavailable,
                ..
            }
        ));
        assert!(h.history.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn answer_when_not_ringing_is_invalid() {
        let mut h = harness();
        assert!(matches!(
            h.session.answer().await,
            Err(CallError::InvalidState { .. })
        ));
        assert!(matches!(
            h.session.reject().await,
            Err(CallError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn busy_session_auto_rejects_and_keeps_call() {
        let mut h = harness();
        let first = h.session.start_call(bob(), CallKind::Voice).await.unwrap();
        sent(&mut h);

        let second = ring_in(&mut h, CallKind::Video).await;
        assert_eq!(h.session.call().unwrap().call_id, first);
        assert_eq!(h.session.phase(), CallPhase::OutgoingRinging);
        assert!(matches!(
            &sent(&mut h)[..],
            [ClientMessage::CallReject { call_id, reason: RejectReason::Busy }] if *call_id == second
        ));
        assert!(events(&mut h)
            .iter()
            .any(|e| matches!(e, CallEvent::BusyRejected { .. })));
    }

    #[tokio::test]
    async fn repeated_incoming_notice_is_ignored() {
        let mut h = harness();
        let call_id = ring_in(&mut h, CallKind::Voice).await;
        events(&mut h);

        h.session
            .handle_signal(ServerMessage::CallIncoming {
                call_id: call_id.clone(),
                caller: alice(),
                kind: CallKind::Voice,
            })
            .await;

        assert_eq!(h.session.call().unwrap().call_id, call_id);
        assert_eq!(h.session.phase(), CallPhase::IncomingRinging);
        assert!(sent(&mut h).is_empty());
        assert!(events(&mut h).is_empty());
        assert!(h.history.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn busy_reject_reports_busy_before_ending() {
        let mut h = harness();
        let call_id = h.session.start_call(bob(), CallKind::Voice).await.unwrap();
        events(&mut h);
        h.session
            .handle_signal(ServerMessage::CallRejected {
                call_id: call_id.clone(),
                from: bob().id,
                reason: RejectReason::Busy,
            })
            .await;

        assert_eq!(
            events(&mut h),
            vec![
                CallEvent::Error(CallError::Busy),
                CallEvent::Ended {
                    call_id,
                    outcome: CallOutcome::Declined
                },
            ]
        );
        assert_eq!(h.session.phase(), CallPhase::Idle);
    }

    #[tokio::test]
    async fn caller_hangs_up_while_ringing_is_missed() {
        let mut h = harness();
        let call_id = ring_in(&mut h, CallKind::Voice).await;
        h.session
            .handle_signal(ServerMessage::CallEnded {
                call_id: Some(call_id),
                from: alice().id,
            })
            .await;
        assert_eq!(h.session.phase(), CallPhase::Idle);
        assert_eq!(h.history.list().await.unwrap()[0].outcome, CallOutcome::Missed);
    }

    #[tokio::test]
    async fn stray_end_is_ignored() {
        let mut h = harness();
        h.session.start_call(bob(), CallKind::Voice).await.unwrap();
        h.session
            .handle_signal(ServerMessage::CallEnded {
                call_id: Some(CallId::new()),
                from: bob().id,
            })
            .await;
        assert_eq!(h.session.phase(), CallPhase::OutgoingRinging);
    }

    #[tokio::test]
    async fn connected_transport_activates_and_monitors() {
        let mut h = harness();
        ring_in(&mut h, CallKind::Video).await;
        h.session.answer().await.unwrap();
        h.session
            .handle_signal(ServerMessage::CallOffer {
                from: alice().id,
                offer: SessionDescription::offer("loopback 500 audio,video"),
            })
            .await;
        pump_peer(&mut h).await;

        assert_eq!(h.session.phase(), CallPhase::Active);
        assert_eq!(h.session.connection_state(), ConnectionState::Connected);
        assert!(h.session.quality(&alice().id).await.is_some());
        assert!(h.session.remote_streams().contains_key(&alice().id));

        // Disconnect does not end the call.
        h.factory
            .transport_for(&alice().id)
            .unwrap()
            .simulate_state(TransportState::Disconnected);
        pump_peer(&mut h).await;
        assert_eq!(h.session.phase(), CallPhase::Active);
        assert_eq!(h.session.connection_state(), ConnectionState::Disconnected);
        assert!(h.session.quality(&alice().id).await.is_none());

        h.session.end_call().await.unwrap();
        assert_eq!(h.devices.live(), 0);
        assert_eq!(h.session.peers().peer_count(), 0);
        assert_eq!(h.history.list().await.unwrap()[0].outcome, CallOutcome::Answered);
    }

    #[tokio::test]
    async fn negotiation_failure_fails_call() {
        let mut h = harness();
        h.factory.fail_negotiation(true);
        ring_in(&mut h, CallKind::Voice).await;
        h.session.answer().await.unwrap();
        sent(&mut h);

        h.session
            .handle_signal(ServerMessage::CallOffer {
                from: alice().id,
                offer: SessionDescription::offer("loopback 501 audio"),
            })
            .await;

        assert_eq!(h.session.phase(), CallPhase::Idle);
        assert_eq!(h.devices.live(), 0);
        assert!(matches!(sent(&mut h).last(), Some(ClientMessage::CallEnd { .. })));
        assert_eq!(h.history.list().await.unwrap()[0].outcome, CallOutcome::Failed);
    }

    #[tokio::test]
    async fn toggles_require_media() {
        let mut h = harness();
        assert!(h.session.toggle_mute().is_err());
        h.session.start_call(bob(), CallKind::Voice).await.unwrap();
        assert_eq!(h.session.toggle_mute(), Ok(true));
        assert!(h.session.toggle_video().is_err());
    }

    #[tokio::test]
    async fn connection_watch_sees_changes() {
        let mut h = harness();
        let mut rx = h.session.watch_connection();
        h.session.start_call(bob(), CallKind::Voice).await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connecting);
        h.session.end_call().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Idle);
    }
}

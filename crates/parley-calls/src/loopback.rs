//! In-process transport and fake capture devices.
//!
//! Test double for [`crate::rtc::WebRtcTransport`]. The loopback transport
//! walks through the same offer/answer/ICE steps and enforces the same
//! ordering rules (no candidates before the remote description), but never
//! touches the network. Session
//! descriptions are plain text naming the sending transport and the kinds
//! of tracks it carries, so the answering side can surface matching remote
//! streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use parley_common::{DeviceError, EndpointId, IceCandidate, SdpType, SessionDescription};
use parley_config::IceConfig;
use tracing::debug;

use crate::media::{MediaDevices, MediaTrack, TrackKind, TrackSource};
use crate::transport::{
    PeerTransport, RemoteStream, StatsEntry, TransportError, TransportEvent, TransportEvents,
    TransportFactory, TransportState,
};

/// Unique across every loopback factory in the process.
static NEXT_LOOPBACK_ID: AtomicU64 = AtomicU64::new(1);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Session description format
// ---------------------------------------------------------------------------

fn encode_sdp(id: u64, tracks: &[MediaTrack]) -> String {
    let kinds: Vec<String> = tracks.iter().map(|t| t.kind().to_string()).collect();
    if kinds.is_empty() {
        format!("loopback {id} -")
    } else {
        format!("loopback {id} {}", kinds.join(","))
    }
}

fn decode_sdp(sdp: &str) -> Option<(u64, Vec<TrackKind>)> {
    let mut parts = sdp.split_whitespace();
    if parts.next()? != "loopback" {
        return None;
    }
    let id = parts.next()?.parse().ok()?;
    let kinds = match parts.next()? {
        "-" => Vec::new(),
        list => list
            .split(',')
            .map(|k| match k {
                "audio" => Some(TrackKind::Audio),
                "video" => Some(TrackKind::Video),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?,
    };
    Some((id, kinds))
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LoopbackInner {
    state: TransportState,
    tracks: Vec<MediaTrack>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    stats: Vec<StatsEntry>,
    stats_failures: u32,
    fail_negotiation: bool,
}

pub struct LoopbackTransport {
    id: u64,
    ice: IceConfig,
    events: TransportEvents,
    inner: Mutex<LoopbackInner>,
}

impl LoopbackTransport {
    fn new(ice: IceConfig, events: TransportEvents, fail_negotiation: bool) -> Self {
        Self {
            id: NEXT_LOOPBACK_ID.fetch_add(1, Ordering::Relaxed),
            ice,
            events,
            inner: Mutex::new(LoopbackInner {
                fail_negotiation,
                ..Default::default()
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote(&self) -> &EndpointId {
        self.events.remote()
    }

    pub fn ice(&self) -> &IceConfig {
        &self.ice
    }

    /// Remote candidates in the order they were applied.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.inner).applied.clone()
    }

    pub fn local_tracks(&self) -> Vec<MediaTrack> {
        lock(&self.inner).tracks.clone()
    }

    pub fn has_remote_description(&self) -> bool {
        lock(&self.inner).remote.is_some()
    }

    /// Replace the report returned by `stats()`.
    pub fn set_stats(&self, stats: Vec<StatsEntry>) {
        lock(&self.inner).stats = stats;
    }

    /// Make the next `times` calls to `stats()` fail.
    pub fn fail_stats(&self, times: u32) {
        lock(&self.inner).stats_failures = times;
    }

    /// Force a state change as if the network had moved it.
    pub fn simulate_state(&self, state: TransportState) {
        lock(&self.inner).state = state;
        self.events.emit(TransportEvent::StateChanged(state));
    }

    fn ensure_open(inner: &LoopbackInner) -> Result<(), TransportError> {
        if inner.state == TransportState::Closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    /// Connect once both descriptions are in place.
    fn maybe_connect(&self, inner: &mut LoopbackInner) {
        let (Some(_), Some(remote)) = (&inner.local, &inner.remote) else {
            return;
        };
        if inner.state == TransportState::Connected {
            return;
        }
        if let Some((peer_id, kinds)) = decode_sdp(&remote.sdp) {
            if !kinds.is_empty() {
                self.events.emit(TransportEvent::Track(RemoteStream {
                    id: format!("loopback-stream-{peer_id}"),
                    kinds,
                }));
            }
        }
        inner.state = TransportState::Connected;
        self.events
            .emit(TransportEvent::StateChanged(TransportState::Connected));
        debug!(transport = self.id, remote = %self.events.remote(), "Loopback connected");
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn add_track(&self, track: MediaTrack) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        Self::ensure_open(&inner)?;
        inner.tracks.push(track);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let inner = lock(&self.inner);
        Self::ensure_open(&inner)?;
        Ok(SessionDescription::offer(encode_sdp(self.id, &inner.tracks)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let inner = lock(&self.inner);
        Self::ensure_open(&inner)?;
        match &inner.remote {
            Some(desc) if desc.sdp_type == SdpType::Offer => {
                Ok(SessionDescription::answer(encode_sdp(self.id, &inner.tracks)))
            }
            _ => Err(TransportError::InvalidState(
                "no remote offer to answer".into(),
            )),
        }
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        Self::ensure_open(&inner)?;
        inner.local = Some(desc);
        if inner.state == TransportState::New {
            inner.state = TransportState::Connecting;
            self.events
                .emit(TransportEvent::StateChanged(TransportState::Connecting));
        }
        self.events.emit(TransportEvent::IceCandidate(IceCandidate::new(format!(
            "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
            self.id,
            40000 + self.id % 20000
        ))));
        self.maybe_connect(&mut inner);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        Self::ensure_open(&inner)?;
        if inner.fail_negotiation {
            return Err(TransportError::Other("remote description rejected".into()));
        }
        if decode_sdp(&desc.sdp).is_none() {
            return Err(TransportError::Other(format!(
                "unparseable session description: {}",
                desc.sdp
            )));
        }
        inner.remote = Some(desc);
        self.maybe_connect(&mut inner);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        Self::ensure_open(&inner)?;
        if inner.remote.is_none() {
            return Err(TransportError::InvalidState(
                "remote description not set".into(),
            ));
        }
        inner.applied.push(candidate);
        Ok(())
    }

    async fn stats(&self) -> Result<Vec<StatsEntry>, TransportError> {
        let mut inner = lock(&self.inner);
        Self::ensure_open(&inner)?;
        if inner.stats_failures > 0 {
            inner.stats_failures -= 1;
            return Err(TransportError::Other("stats report unavailable".into()));
        }
        Ok(inner.stats.clone())
    }

    fn state(&self) -> TransportState {
        lock(&self.inner).state
    }

    async fn close(&self) {
        let mut inner = lock(&self.inner);
        if inner.state != TransportState::Closed {
            inner.state = TransportState::Closed;
            self.events
                .emit(TransportEvent::StateChanged(TransportState::Closed));
        }
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FactoryInner {
    created: Vec<Arc<LoopbackTransport>>,
    fail_negotiation: bool,
}

/// Creates loopback transports and remembers every one it handed out.
#[derive(Clone, Default)]
pub struct LoopbackFactory {
    inner: Arc<Mutex<FactoryInner>>,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every transport created from now on reject remote descriptions.
    pub fn fail_negotiation(&self, fail: bool) {
        lock(&self.inner).fail_negotiation = fail;
    }

    /// All transports in creation order.
    pub fn transports(&self) -> Vec<Arc<LoopbackTransport>> {
        lock(&self.inner).created.clone()
    }

    /// The most recent transport created for `remote`.
    pub fn transport_for(&self, remote: &EndpointId) -> Option<Arc<LoopbackTransport>> {
        lock(&self.inner)
            .created
            .iter()
            .rev()
            .find(|t| t.remote() == remote)
            .cloned()
    }
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    async fn create(
        &self,
        ice: &IceConfig,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let mut inner = lock(&self.inner);
        let transport = Arc::new(LoopbackTransport::new(
            ice.clone(),
            events,
            inner.fail_negotiation,
        ));
        inner.created.push(Arc::clone(&transport));
        Ok(transport)
    }
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DevicesInner {
    failures: HashMap<TrackKind, DeviceError>,
    display_failure: Option<DeviceError>,
    issued: Vec<MediaTrack>,
}

/// Fake capture devices that record every track they open.
#[derive(Default)]
pub struct LoopbackDevices {
    inner: Mutex<DevicesInner>,
}

impl LoopbackDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make acquiring `kind` fail with `error` until cleared.
    pub fn fail(&self, kind: TrackKind, error: DeviceError) {
        lock(&self.inner).failures.insert(kind, error);
    }

    pub fn fail_display(&self, error: DeviceError) {
        lock(&self.inner).display_failure = Some(error);
    }

    pub fn clear_failures(&self) {
        let mut inner = lock(&self.inner);
        inner.failures.clear();
        inner.display_failure = None;
    }

    /// Every track ever handed out.
    pub fn issued(&self) -> Vec<MediaTrack> {
        lock(&self.inner).issued.clone()
    }

    /// Tracks handed out and not yet stopped.
    pub fn live(&self) -> usize {
        lock(&self.inner)
            .issued
            .iter()
            .filter(|t| !t.is_stopped())
            .count()
    }

    fn issue(&self, kind: TrackKind, source: TrackSource) -> MediaTrack {
        let track = MediaTrack::new(kind, source);
        lock(&self.inner).issued.push(track.clone());
        track
    }
}

#[async_trait]
impl MediaDevices for LoopbackDevices {
    async fn acquire(&self, kind: TrackKind) -> Result<MediaTrack, DeviceError> {
        if let Some(err) = lock(&self.inner).failures.get(&kind).cloned() {
            return Err(err);
        }
        let source = match kind {
            TrackKind::Audio => TrackSource::Microphone,
            TrackKind::Video => TrackSource::Camera,
        };
        Ok(self.issue(kind, source))
    }

    async fn acquire_display(&self) -> Result<MediaTrack, DeviceError> {
        if let Some(err) = lock(&self.inner).display_failure.clone() {
            return Err(err);
        }
        Ok(self.issue(TrackKind::Video, TrackSource::Display))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn make(
        factory: &LoopbackFactory,
        remote: &str,
    ) -> (Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<crate::transport::PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = TransportEvents::new(EndpointId::from(remote), 1, tx);
        (
            factory.create(&IceConfig::default(), events).await.unwrap(),
            rx,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<crate::transport::PeerEvent>) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev.event);
        }
        out
    }

    #[test]
    fn sdp_round_trip() {
        let tracks = vec![
            MediaTrack::new(TrackKind::Audio, TrackSource::Microphone),
            MediaTrack::new(TrackKind::Video, TrackSource::Camera),
        ];
        let sdp = encode_sdp(9, &tracks);
        assert_eq!(decode_sdp(&sdp), Some((9, vec![TrackKind::Audio, TrackKind::Video])));
        assert_eq!(decode_sdp(&encode_sdp(3, &[])), Some((3, vec![])));
        assert_eq!(decode_sdp("v=0"), None);
    }

    #[tokio::test]
    async fn offer_answer_connects_both_sides() {
        let factory = LoopbackFactory::new();
        let (a, mut a_rx) = make(&factory, "b").await;
        let (b, mut b_rx) = make(&factory, "a").await;

        a.add_track(MediaTrack::new(TrackKind::Audio, TrackSource::Microphone))
            .await
            .unwrap();

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert_eq!(a.state(), TransportState::Connected);
        assert_eq!(b.state(), TransportState::Connected);

        let b_events = drain(&mut b_rx);
        assert!(b_events.iter().any(|e| matches!(
            e,
            TransportEvent::Track(stream) if stream.kinds == vec![TrackKind::Audio]
        )));
        // b sent nothing, so a sees no remote track.
        let a_events = drain(&mut a_rx);
        assert!(!a_events.iter().any(|e| matches!(e, TransportEvent::Track(_))));
        assert!(a_events
            .iter()
            .any(|e| matches!(e, TransportEvent::IceCandidate(_))));
    }

    #[tokio::test]
    async fn candidate_before_remote_description_is_rejected() {
        let factory = LoopbackFactory::new();
        let (t, _rx) = make(&factory, "b").await;
        let err = t
            .add_ice_candidate(IceCandidate::new("candidate:1"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidState(_)));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_further_use() {
        let factory = LoopbackFactory::new();
        let (t, mut rx) = make(&factory, "b").await;
        t.close().await;
        t.close().await;
        let closes = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, TransportEvent::StateChanged(TransportState::Closed)))
            .count();
        assert_eq!(closes, 1);
        assert_eq!(t.stats().await.unwrap_err(), TransportError::Closed);
    }

    #[tokio::test]
    async fn factory_tracks_transports_per_remote() {
        let factory = LoopbackFactory::new();
        let _ = make(&factory, "b").await;
        let _ = make(&factory, "c").await;
        assert_eq!(factory.transports().len(), 2);
        assert!(factory.transport_for(&EndpointId::from("c")).is_some());
        assert!(factory.transport_for(&EndpointId::from("z")).is_none());
    }

    #[tokio::test]
    async fn devices_record_and_fail() {
        let devices = LoopbackDevices::new();
        devices.fail(TrackKind::Audio, DeviceError::PermissionDenied);
        assert_eq!(
            devices.acquire(TrackKind::Audio).await.unwrap_err(),
            DeviceError::PermissionDenied
        );
        devices.clear_failures();
        let track = devices.acquire(TrackKind::Audio).await.unwrap();
        assert_eq!(devices.live(), 1);
        track.stop();
        assert_eq!(devices.live(), 0);

        let display = devices.acquire_display().await.unwrap();
        assert_eq!(display.source(), TrackSource::Display);
        assert_eq!(display.kind(), TrackKind::Video);
    }
}

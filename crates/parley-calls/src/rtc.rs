//! [`PeerTransport`] on top of webrtc-rs.
//!
//! One [`WebRtcFactory`] owns a configured webrtc `API` (default codecs and
//! interceptors) and builds one `RTCPeerConnection` per remote endpoint.
//! Capture and playback stay outside the transport: every attached
//! [`MediaTrack`] gets a `TrackLocalStaticSample` that a capture pipeline
//! writes into, and every incoming track is kept for a playback pipeline
//! to read from.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use parley_common::{IceCandidate, SdpType, SessionDescription};
use parley_config::IceConfig;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice::candidate::CandidatePairState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::media::{MediaTrack, TrackKind};
use crate::transport::{
    PeerTransport, RemoteStream, StatsEntry, TransportError, TransportEvent, TransportEvents,
    TransportFactory, TransportState,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn rtc_error(step: &str, e: webrtc::Error) -> TransportError {
    TransportError::Other(format!("{step}: {e}"))
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

pub(crate) fn ice_servers(ice: &IceConfig) -> Vec<RTCIceServer> {
    ice.servers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            username: s.username.clone().unwrap_or_default(),
            credential: s.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

/// `None` for the pseudo-state webrtc reports before the first transition.
pub(crate) fn map_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn map_kind(kind: RTPCodecType) -> Option<TrackKind> {
    match kind {
        RTPCodecType::Audio => Some(TrackKind::Audio),
        RTPCodecType::Video => Some(TrackKind::Video),
        _ => None,
    }
}

pub(crate) fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

pub(crate) fn to_rtc_description(
    desc: SessionDescription,
) -> Result<RTCSessionDescription, TransportError> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|e| rtc_error("parsing session description", e))
}

pub(crate) fn from_rtc_description(
    desc: RTCSessionDescription,
) -> Result<SessionDescription, TransportError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(TransportError::InvalidState(format!(
            "unsupported description type {other}"
        ))),
    }
}

pub(crate) fn to_candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_m_line_index,
        ..Default::default()
    }
}

pub(crate) fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
    }
}

fn convert_stats(reports: impl IntoIterator<Item = StatsReportType>) -> Vec<StatsEntry> {
    let mut out = Vec::new();
    for report in reports {
        match report {
            // Loss as reported back by the remote side for our stream.
            // webrtc-rs does not surface receiver jitter.
            StatsReportType::RemoteInboundRTP(r) => {
                let kind = if r.kind == "video" {
                    TrackKind::Video
                } else {
                    TrackKind::Audio
                };
                out.push(StatsEntry::InboundRtp {
                    kind,
                    packets_lost: r.packets_lost,
                    jitter: 0.0,
                });
            }
            StatsReportType::CandidatePair(p) => {
                out.push(StatsEntry::CandidatePair {
                    succeeded: p.state == CandidatePairState::Succeeded,
                    current_round_trip_time: (p.current_round_trip_time > 0.0)
                        .then_some(p.current_round_trip_time),
                });
            }
            _ => {}
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Remote tracks seen so far, grouped by the stream they belong to.
#[derive(Default)]
struct RemoteTracks {
    kinds: HashMap<String, Vec<TrackKind>>,
    tracks: Vec<Arc<TrackRemote>>,
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    events: TransportEvents,
    local: Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>,
    remote: Arc<Mutex<RemoteTracks>>,
    closed: AtomicBool,
}

impl WebRtcTransport {
    fn wire(pc: Arc<RTCPeerConnection>, events: TransportEvents) -> Self {
        let remote = Arc::new(Mutex::new(RemoteTracks::default()));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            // close() reports Closed itself.
            if let Some(state) = map_state(s).filter(|st| *st != TransportState::Closed) {
                debug!(remote = %state_events.remote(), %state, "Peer connection state");
                state_events.emit(TransportEvent::StateChanged(state));
            }
            Box::pin(async {})
        }));

        let ice_events = events.clone();
        pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let events = ice_events.clone();
            Box::pin(async move {
                let Some(c) = c else { return };
                match c.to_json() {
                    Ok(init) => {
                        events.emit(TransportEvent::IceCandidate(from_candidate_init(init)));
                    }
                    Err(e) => warn!(remote = %events.remote(), error = %e, "Dropping local candidate"),
                }
            })
        }));

        let track_events = events.clone();
        let track_registry = Arc::clone(&remote);
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                if let Some(kind) = map_kind(track.kind()) {
                    let stream_id = track.stream_id();
                    let mut registry = lock(&track_registry);
                    let kinds = registry.kinds.entry(stream_id.clone()).or_default();
                    if !kinds.contains(&kind) {
                        kinds.push(kind);
                    }
                    let stream = RemoteStream {
                        id: stream_id,
                        kinds: kinds.clone(),
                    };
                    registry.tracks.push(track);
                    drop(registry);
                    track_events.emit(TransportEvent::Track(stream));
                }
                Box::pin(async {})
            },
        ));

        Self {
            pc,
            events,
            local: Mutex::new(HashMap::new()),
            remote,
            closed: AtomicBool::new(false),
        }
    }

    /// Sample sink for the local track with this id, for a capture
    /// pipeline to write encoded media into.
    pub fn local_sample_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        lock(&self.local).get(track_id).cloned()
    }

    /// Every remote track received so far.
    pub fn remote_tracks(&self) -> Vec<Arc<TrackRemote>> {
        lock(&self.remote).tracks.clone()
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn add_track(&self, track: MediaTrack) -> Result<(), TransportError> {
        self.ensure_open()?;
        let sample = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_owned(),
            format!("parley-{}", self.events.transport_id()),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&sample) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| rtc_error("adding track", e))?;

        // RTCP has to be drained for interceptors such as NACK to run.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        lock(&self.local).insert(track.id().to_owned(), sample);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| rtc_error("creating offer", e))?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_open()?;
        if self.pc.remote_description().await.is_none() {
            return Err(TransportError::InvalidState(
                "no remote offer to answer".into(),
            ));
        }
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| rtc_error("creating answer", e))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(|e| rtc_error("setting local description", e))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(|e| rtc_error("setting remote description", e))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.ensure_open()?;
        if self.pc.remote_description().await.is_none() {
            return Err(TransportError::InvalidState(
                "remote description not set".into(),
            ));
        }
        self.pc
            .add_ice_candidate(to_candidate_init(candidate))
            .await
            .map_err(|e| rtc_error("adding candidate", e))
    }

    async fn stats(&self) -> Result<Vec<StatsEntry>, TransportError> {
        self.ensure_open()?;
        let report = self.pc.get_stats().await;
        Ok(convert_stats(report.reports.into_values()))
    }

    fn state(&self) -> TransportState {
        if self.closed.load(Ordering::Acquire) {
            return TransportState::Closed;
        }
        map_state(self.pc.connection_state()).unwrap_or_default()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.pc.close().await {
            warn!(remote = %self.events.remote(), error = %e, "Error closing peer connection");
        }
        self.events
            .emit(TransportEvent::StateChanged(TransportState::Closed));
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Builds webrtc-rs peer connections that share one media engine.
#[derive(Clone)]
pub struct WebRtcFactory {
    api: Arc<API>,
}

impl WebRtcFactory {
    pub fn new() -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| rtc_error("registering codecs", e))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| rtc_error("registering interceptors", e))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api: Arc::new(api) })
    }

    /// Like [`TransportFactory::create`] but keeps the concrete type, for
    /// callers that need the sample sinks and remote tracks.
    pub async fn create_transport(
        &self,
        ice: &IceConfig,
        events: TransportEvents,
    ) -> Result<Arc<WebRtcTransport>, TransportError> {
        let config = RTCConfiguration {
            ice_servers: ice_servers(ice),
            ..Default::default()
        };
        let pc = self
            .api
            .new_peer_connection(config)
            .await
            .map_err(|e| rtc_error("creating peer connection", e))?;
        debug!(
            remote = %events.remote(),
            transport = events.transport_id(),
            servers = ice.servers.len(),
            "Created peer connection"
        );
        Ok(Arc::new(WebRtcTransport::wire(Arc::new(pc), events)))
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create(
        &self,
        ice: &IceConfig,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport: Arc<dyn PeerTransport> = self.create_transport(ice, events).await?;
        Ok(transport)
    }
}

//! The peer-to-peer media transport seam.
//!
//! A [`PeerTransport`] is one negotiated media channel to a single remote
//! endpoint. [`crate::rtc`] implements it on top of webrtc-rs; the in-process
//! loopback in [`crate::loopback`] stands in for it in tests and demos.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parley_common::{EndpointId, IceCandidate, SessionDescription};
use parley_config::IceConfig;
use tokio::sync::mpsc;

use crate::media::{MediaTrack, TrackKind};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Link state as reported by the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        })
    }
}

/// Media arriving from the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
    pub kinds: Vec<TrackKind>,
}

/// One entry of a stats report.
#[derive(Debug, Clone, PartialEq)]
pub enum StatsEntry {
    InboundRtp {
        kind: TrackKind,
        /// Cumulative; some stacks report negative values after
        /// duplicate packets.
        packets_lost: i64,
        jitter: f64,
    },
    CandidatePair {
        succeeded: bool,
        current_round_trip_time: Option<f64>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("{0}")]
    Other(String),
}

/// Something the transport reports asynchronously.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A locally gathered candidate to forward to the remote side.
    IceCandidate(IceCandidate),
    StateChanged(TransportState),
    Track(RemoteStream),
}

/// A transport event tagged with the peer record that produced it.
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub remote: EndpointId,
    /// Distinguishes a replaced transport from its successor.
    pub transport_id: u64,
    pub event: TransportEvent,
}

/// Where a transport pushes its events.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    remote: EndpointId,
    transport_id: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl TransportEvents {
    pub fn new(remote: EndpointId, transport_id: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            remote,
            transport_id,
            tx,
        }
    }

    pub fn remote(&self) -> &EndpointId {
        &self.remote
    }

    pub fn transport_id(&self) -> u64 {
        self.transport_id
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(PeerEvent {
            remote: self.remote.clone(),
            transport_id: self.transport_id,
            event,
        });
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: MediaTrack) -> Result<(), TransportError>;
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
    async fn stats(&self) -> Result<Vec<StatsEntry>, TransportError>;
    fn state(&self) -> TransportState;
    /// Release the transport. Closing twice is a no-op.
    async fn close(&self);
}

/// Builds transports configured with the given ICE servers.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        ice: &IceConfig,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

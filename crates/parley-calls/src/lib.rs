//! Client side of Parley: call sessions, screen sharing, peer connection
//! management and connection quality monitoring.
//!
//! The relay only ever sees signaling. Media flows over a [`PeerTransport`]
//! per remote endpoint. [`rtc`] implements it with webrtc-rs and
//! [`loopback`] provides an in-process stand-in for tests.

pub mod client;
pub mod history;
pub mod loopback;
pub mod media;
pub mod peer;
pub mod quality;
pub mod rtc;
pub mod screen_share;
pub mod session;
pub mod signaling;
pub mod transport;

pub use client::{connect, CallSnapshot, ClientEvents, ClientHandle, ClientResources};
pub use history::{
    CallDirection, CallLogEntry, CallLogStore, CallLogUpdate, CallOutcome, JsonFileCallLog,
    MemoryCallLog,
};
pub use loopback::{LoopbackDevices, LoopbackFactory, LoopbackTransport};
pub use media::{LocalMedia, MediaDevices, MediaTrack, TrackKind, TrackSource};
pub use peer::PeerConnectionManager;
pub use quality::{classify, summarize, LinkMetrics, QualityLevel, QualityMonitor, QualitySample};
pub use rtc::{WebRtcFactory, WebRtcTransport};
pub use screen_share::{ScreenShareEvent, ScreenShareSession};
pub use session::{CallEvent, CallPhase, CallRole, CallSession, CallState, SessionDeps};
pub use signaling::{RelayClient, RelayClientConfig, RelayEvent, SignalingSink};
pub use transport::{
    PeerEvent, PeerTransport, RemoteStream, StatsEntry, TransportError, TransportEvent,
    TransportEvents, TransportFactory, TransportState,
};

//! Wire protocol spoken between endpoints and the signaling relay.
//!
//! Every frame is a JSON object tagged by `type`. Call and screen-share
//! traffic use separate event namespaces (`call:*`, `screen-share:*`) so an
//! endpoint can be in a call and share its screen at the same time. The
//! relay reads the envelope (`targetId`, `callId`) and forwards session
//! descriptions and ICE candidates untouched.

use serde::{Deserialize, Serialize};

use crate::id::{CallId, EndpointId};
use crate::types::{CallKind, Endpoint};

// ---------------------------------------------------------------------------
// Negotiation payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// An SDP offer or answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate for NAT traversal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }
    }
}

/// One negotiation step, independent of the namespace it travels in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiation {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
}

/// Independent signaling namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Call,
    ScreenShare,
}

impl Namespace {
    /// Build the outbound envelope for a negotiation step addressed to `target_id`.
    pub fn envelope(self, target_id: EndpointId, step: Negotiation) -> ClientMessage {
        match (self, step) {
            (Self::Call, Negotiation::Offer(offer)) => ClientMessage::CallOffer { target_id, offer },
            (Self::Call, Negotiation::Answer(answer)) => {
                ClientMessage::CallAnswer { target_id, answer }
            }
            (Self::Call, Negotiation::IceCandidate(candidate)) => {
                ClientMessage::CallIceCandidate {
                    target_id,
                    candidate,
                }
            }
            (Self::ScreenShare, Negotiation::Offer(offer)) => {
                ClientMessage::ScreenShareOffer { target_id, offer }
            }
            (Self::ScreenShare, Negotiation::Answer(answer)) => {
                ClientMessage::ScreenShareAnswer { target_id, answer }
            }
            (Self::ScreenShare, Negotiation::IceCandidate(candidate)) => {
                ClientMessage::ScreenShareIceCandidate {
                    target_id,
                    candidate,
                }
            }
        }
    }

    /// Build the delivered form of a negotiation step, tagged with its sender.
    pub fn delivery(self, from: EndpointId, step: Negotiation) -> ServerMessage {
        match (self, step) {
            (Self::Call, Negotiation::Offer(offer)) => ServerMessage::CallOffer { from, offer },
            (Self::Call, Negotiation::Answer(answer)) => ServerMessage::CallAnswer { from, answer },
            (Self::Call, Negotiation::IceCandidate(candidate)) => {
                ServerMessage::CallIceCandidate { from, candidate }
            }
            (Self::ScreenShare, Negotiation::Offer(offer)) => {
                ServerMessage::ScreenShareOffer { from, offer }
            }
            (Self::ScreenShare, Negotiation::Answer(answer)) => {
                ServerMessage::ScreenShareAnswer { from, answer }
            }
            (Self::ScreenShare, Negotiation::IceCandidate(candidate)) => {
                ServerMessage::ScreenShareIceCandidate { from, candidate }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Shared enums
// ---------------------------------------------------------------------------

/// Why an invitation was turned down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    #[default]
    Declined,
    /// The callee was already in a call.
    Busy,
    /// The callee accepted but could not open its media devices.
    Unavailable,
}

/// Error codes the relay reports back to the sender of a bad message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    MalformedEnvelope,
    UserNotFound,
    UnknownCall,
    NotParticipant,
    InvalidTarget,
}

// ---------------------------------------------------------------------------
// Client → relay
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// First frame on a new connection.
    #[serde(rename = "hello")]
    Hello { username: String },

    #[serde(rename = "call:initiate")]
    CallInitiate {
        call_id: CallId,
        target_id: EndpointId,
        kind: CallKind,
    },

    #[serde(rename = "call:accept")]
    CallAccept { call_id: CallId },

    #[serde(rename = "call:reject")]
    CallReject {
        call_id: CallId,
        #[serde(default)]
        reason: RejectReason,
    },

    #[serde(rename = "call:end")]
    CallEnd { call_id: CallId },

    #[serde(rename = "call:offer")]
    CallOffer {
        target_id: EndpointId,
        offer: SessionDescription,
    },

    #[serde(rename = "call:answer")]
    CallAnswer {
        target_id: EndpointId,
        answer: SessionDescription,
    },

    #[serde(rename = "call:ice-candidate")]
    CallIceCandidate {
        target_id: EndpointId,
        candidate: IceCandidate,
    },

    #[serde(rename = "screen-share:start")]
    ScreenShareStart,

    #[serde(rename = "screen-share:stop")]
    ScreenShareStop,

    /// Ask a sharer to send its screen to us.
    #[serde(rename = "screen-share:join")]
    ScreenShareJoin { target_id: EndpointId },

    #[serde(rename = "screen-share:offer")]
    ScreenShareOffer {
        target_id: EndpointId,
        offer: SessionDescription,
    },

    #[serde(rename = "screen-share:answer")]
    ScreenShareAnswer {
        target_id: EndpointId,
        answer: SessionDescription,
    },

    #[serde(rename = "screen-share:ice-candidate")]
    ScreenShareIceCandidate {
        target_id: EndpointId,
        candidate: IceCandidate,
    },
}

impl ClientMessage {
    /// Split a negotiation envelope into its namespace, target and step.
    pub fn into_negotiation(self) -> Result<(Namespace, EndpointId, Negotiation), Self> {
        match self {
            Self::CallOffer { target_id, offer } => {
                Ok((Namespace::Call, target_id, Negotiation::Offer(offer)))
            }
            Self::CallAnswer { target_id, answer } => {
                Ok((Namespace::Call, target_id, Negotiation::Answer(answer)))
            }
            Self::CallIceCandidate {
                target_id,
                candidate,
            } => Ok((
                Namespace::Call,
                target_id,
                Negotiation::IceCandidate(candidate),
            )),
            Self::ScreenShareOffer { target_id, offer } => {
                Ok((Namespace::ScreenShare, target_id, Negotiation::Offer(offer)))
            }
            Self::ScreenShareAnswer { target_id, answer } => {
                Ok((Namespace::ScreenShare, target_id, Negotiation::Answer(answer)))
            }
            Self::ScreenShareIceCandidate {
                target_id,
                candidate,
            } => Ok((
                Namespace::ScreenShare,
                target_id,
                Negotiation::IceCandidate(candidate),
            )),
            other => Err(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Relay → client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Reply to `hello` carrying the id the relay assigned to this connection.
    #[serde(rename = "welcome")]
    Welcome { endpoint_id: EndpointId },

    #[serde(rename = "call:incoming")]
    CallIncoming {
        call_id: CallId,
        caller: Endpoint,
        kind: CallKind,
    },

    #[serde(rename = "call:accepted")]
    CallAccepted { call_id: CallId, from: EndpointId },

    #[serde(rename = "call:rejected")]
    CallRejected {
        call_id: CallId,
        from: EndpointId,
        #[serde(default)]
        reason: RejectReason,
    },

    /// `call_id` is absent when the relay could not attribute the end to a
    /// specific call.
    #[serde(rename = "call:ended")]
    CallEnded {
        call_id: Option<CallId>,
        from: EndpointId,
    },

    #[serde(rename = "call:offer")]
    CallOffer {
        from: EndpointId,
        offer: SessionDescription,
    },

    #[serde(rename = "call:answer")]
    CallAnswer {
        from: EndpointId,
        answer: SessionDescription,
    },

    #[serde(rename = "call:ice-candidate")]
    CallIceCandidate {
        from: EndpointId,
        candidate: IceCandidate,
    },

    #[serde(rename = "screen-share:started")]
    ScreenShareStarted { user_id: EndpointId, username: String },

    #[serde(rename = "screen-share:stopped")]
    ScreenShareStopped { user_id: EndpointId },

    #[serde(rename = "screen-share:viewer-joined")]
    ScreenShareViewerJoined { from: EndpointId, username: String },

    #[serde(rename = "screen-share:offer")]
    ScreenShareOffer {
        from: EndpointId,
        offer: SessionDescription,
    },

    #[serde(rename = "screen-share:answer")]
    ScreenShareAnswer {
        from: EndpointId,
        answer: SessionDescription,
    },

    #[serde(rename = "screen-share:ice-candidate")]
    ScreenShareIceCandidate {
        from: EndpointId,
        candidate: IceCandidate,
    },

    #[serde(rename = "error")]
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
    },
}

impl ServerMessage {
    /// Which session type should handle this message. `None` for
    /// connection-level frames (`welcome`, uncorrelated errors).
    pub fn namespace(&self) -> Option<Namespace> {
        match self {
            Self::CallIncoming { .. }
            | Self::CallAccepted { .. }
            | Self::CallRejected { .. }
            | Self::CallEnded { .. }
            | Self::CallOffer { .. }
            | Self::CallAnswer { .. }
            | Self::CallIceCandidate { .. } => Some(Namespace::Call),
            Self::ScreenShareStarted { .. }
            | Self::ScreenShareStopped { .. }
            | Self::ScreenShareViewerJoined { .. }
            | Self::ScreenShareOffer { .. }
            | Self::ScreenShareAnswer { .. }
            | Self::ScreenShareIceCandidate { .. } => Some(Namespace::ScreenShare),
            Self::Error {
                call_id: Some(_), ..
            } => Some(Namespace::Call),
            Self::Welcome { .. } | Self::Error { .. } => None,
        }
    }

    /// Split a delivered negotiation message into its sender and step.
    pub fn negotiation(&self) -> Option<(EndpointId, Negotiation)> {
        match self {
            Self::CallOffer { from, offer } | Self::ScreenShareOffer { from, offer } => {
                Some((from.clone(), Negotiation::Offer(offer.clone())))
            }
            Self::CallAnswer { from, answer } | Self::ScreenShareAnswer { from, answer } => {
                Some((from.clone(), Negotiation::Answer(answer.clone())))
            }
            Self::CallIceCandidate { from, candidate }
            | Self::ScreenShareIceCandidate { from, candidate } => {
                Some((from.clone(), Negotiation::IceCandidate(candidate.clone())))
            }
            _ => None,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
            call_id: None,
        }
    }
}

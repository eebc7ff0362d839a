use serde::{Deserialize, Serialize};
use std::fmt;

use crate::id::EndpointId;

/// Media kind requested for a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    #[default]
    Voice,
    Video,
}

impl CallKind {
    pub fn is_video(self) -> bool {
        matches!(self, Self::Video)
    }
}

/// A connected participant as resolved through the user directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: EndpointId,
    pub username: String,
}

impl Endpoint {
    pub fn new(id: impl Into<EndpointId>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
        }
    }
}

/// Observable link state of the current call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&CallKind::Video).unwrap(), "\"video\"");
        assert_eq!(serde_json::to_string(&CallKind::Voice).unwrap(), "\"voice\"");
    }

    #[test]
    fn only_video_is_video() {
        assert!(CallKind::Video.is_video());
        assert!(!CallKind::Voice.is_video());
    }

    #[test]
    fn connection_state_default_is_idle() {
        assert_eq!(ConnectionState::default(), ConnectionState::Idle);
        assert_eq!(ConnectionState::Failed.to_string(), "failed");
    }
}

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ParseError(String),

    #[error("config validation error: {0}")]
    ValidationError(String),
}

/// Why local capture could not be opened.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("permission denied for camera or microphone")]
    PermissionDenied,

    #[error("no camera or microphone found")]
    NotFound,

    #[error("camera or microphone is in use or inaccessible")]
    Busy,

    #[error("media device error: {0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("device acquisition failed: {0}")]
    DeviceAcquisition(#[from] DeviceError),

    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("negotiation error: {0}")]
    Negotiation(String),

    #[error("endpoint is busy")]
    Busy,

    #[error("cannot {operation} while {phase}")]
    InvalidState {
        operation: &'static str,
        phase: String,
    },

    #[error("signaling channel closed")]
    SignalingClosed,
}

#[derive(Debug, thiserror::Error)]
pub enum ParleyError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = ConfigError::FileNotFound(PathBuf::from("/tmp/missing.toml"));
        assert_eq!(err.to_string(), "config file not found: /tmp/missing.toml");

        let err = ConfigError::ValidationError("quality.sample_interval_secs".into());
        assert_eq!(
            err.to_string(),
            "config validation error: quality.sample_interval_secs"
        );
    }

    #[test]
    fn device_error_converts_into_call_error() {
        let err: CallError = DeviceError::PermissionDenied.into();
        assert!(matches!(
            err,
            CallError::DeviceAcquisition(DeviceError::PermissionDenied)
        ));
        assert!(err.to_string().contains("permission denied"));
    }

    #[test]
    fn invalid_state_display() {
        let err = CallError::InvalidState {
            operation: "answer",
            phase: "idle".into(),
        };
        assert_eq!(err.to_string(), "cannot answer while idle");
    }

    #[test]
    fn parley_error_from_call() {
        let err: ParleyError = CallError::Busy.into();
        assert!(matches!(err, ParleyError::Call(CallError::Busy)));
        assert_eq!(err.to_string(), "endpoint is busy");
    }

    #[test]
    fn parley_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "port taken");
        let err: ParleyError = io_err.into();
        assert!(matches!(err, ParleyError::Io(_)));
        assert!(err.to_string().contains("port taken"));
    }

    #[test]
    fn parley_error_other_variants() {
        let err = ParleyError::Network("relay unreachable".into());
        assert_eq!(err.to_string(), "network error: relay unreachable");

        let err = ParleyError::Other("something went wrong".into());
        assert_eq!(err.to_string(), "something went wrong");
    }
}

//! Configuration schema. Each section defaults independently.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    pub relay: RelayConfig,
    pub ice: IceConfig,
    pub quality: QualityConfig,
    pub history: HistoryConfig,
    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// Signaling relay settings, used by both the server and connecting clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address the relay server binds to.
    pub bind_address: String,
    pub port: u32,
    /// WebSocket URL clients connect to.
    pub url: String,
    /// Seconds a new connection has to send its `hello`.
    pub hello_timeout_secs: u32,
    /// Outbound frames buffered per endpoint before new ones are dropped.
    pub queue_capacity: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: 8080,
            url: "ws://127.0.0.1:8080".into(),
            hello_timeout_secs: 10,
            queue_capacity: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// ICE
// ---------------------------------------------------------------------------

/// One STUN or TURN server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    pub fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

/// Fixed ICE server list handed to every transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub servers: Vec<IceServerConfig>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: vec![
                IceServerConfig::stun("stun:stun.l.google.com:19302"),
                IceServerConfig::stun("stun:stun1.l.google.com:19302"),
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Quality
// ---------------------------------------------------------------------------

/// Limits above which a sample is classified at a given level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityThresholds {
    pub packets_lost: u64,
    pub jitter_secs: f64,
    pub round_trip_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub sample_interval_secs: u32,
    pub poor: QualityThresholds,
    pub average: QualityThresholds,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 5,
            poor: QualityThresholds {
                packets_lost: 10,
                jitter_secs: 0.1,
                round_trip_secs: 0.5,
            },
            average: QualityThresholds {
                packets_lost: 2,
                jitter_secs: 0.05,
                round_trip_secs: 0.25,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// History & logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Oldest entries are dropped beyond this count.
    pub max_entries: u32,
    /// JSON file for persistent history. In-memory when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "parley_relay=info".into(),
        }
    }
}

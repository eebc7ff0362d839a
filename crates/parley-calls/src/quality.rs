//! Connection quality monitoring.
//!
//! While a transport is connected, its stats are sampled on a fixed
//! interval and boiled down to a [`QualityLevel`]. One background task per
//! remote endpoint; the latest sample per remote is kept in a shared map.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parley_common::EndpointId;
use parley_config::QualityConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::media::TrackKind;
use crate::transport::{PeerTransport, StatsEntry, TransportState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Good,
    Average,
    Poor,
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Good => "good",
            Self::Average => "average",
            Self::Poor => "poor",
        })
    }
}

/// Latest link health for one remote endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualitySample {
    pub remote: EndpointId,
    pub level: QualityLevel,
    pub packets_lost: u64,
    pub jitter_secs: f64,
    pub round_trip_secs: f64,
    pub sampled_at: DateTime<Utc>,
}

/// Raw figures pulled out of a stats report.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinkMetrics {
    pub packets_lost: u64,
    pub jitter_secs: f64,
    pub round_trip_secs: f64,
}

/// Extract loss and jitter from inbound video and RTT from the succeeded
/// candidate pair. When a category appears more than once the last entry
/// wins; a missing category stays zero.
pub fn summarize(stats: &[StatsEntry]) -> LinkMetrics {
    let mut metrics = LinkMetrics::default();
    for entry in stats {
        match entry {
            StatsEntry::InboundRtp {
                kind: TrackKind::Video,
                packets_lost,
                jitter,
            } => {
                metrics.packets_lost = (*packets_lost).max(0) as u64;
                metrics.jitter_secs = *jitter;
            }
            StatsEntry::CandidatePair {
                succeeded: true,
                current_round_trip_time: Some(rtt),
            } => {
                metrics.round_trip_secs = *rtt;
            }
            _ => {}
        }
    }
    metrics
}

pub fn classify(metrics: &LinkMetrics, config: &QualityConfig) -> QualityLevel {
    let exceeds = |t: &parley_config::QualityThresholds| {
        metrics.packets_lost > t.packets_lost
            || metrics.jitter_secs > t.jitter_secs
            || metrics.round_trip_secs > t.round_trip_secs
    };
    if exceeds(&config.poor) {
        QualityLevel::Poor
    } else if exceeds(&config.average) {
        QualityLevel::Average
    } else {
        QualityLevel::Good
    }
}

type SampleMap = Arc<RwLock<HashMap<EndpointId, QualitySample>>>;

/// Outcome of one sampling tick.
enum Tick {
    Sample(QualitySample),
    /// Stats were unavailable this time; the previous sample stands.
    Skipped,
    /// The transport left `connected`.
    Stopped,
}

async fn sample_once(
    remote: &EndpointId,
    transport: &dyn PeerTransport,
    config: &QualityConfig,
) -> Tick {
    if transport.state() != TransportState::Connected {
        return Tick::Stopped;
    }
    let stats = match transport.stats().await {
        Ok(stats) => stats,
        Err(e) => {
            warn!(remote = %remote, error = %e, "Stats unavailable, keeping previous quality sample");
            return Tick::Skipped;
        }
    };
    let metrics = summarize(&stats);
    Tick::Sample(QualitySample {
        remote: remote.clone(),
        level: classify(&metrics, config),
        packets_lost: metrics.packets_lost,
        jitter_secs: metrics.jitter_secs,
        round_trip_secs: metrics.round_trip_secs,
        sampled_at: Utc::now(),
    })
}

/// Owns the sampling tasks and the latest sample for each remote.
pub struct QualityMonitor {
    config: QualityConfig,
    samples: SampleMap,
    tasks: HashMap<EndpointId, JoinHandle<()>>,
}

impl QualityMonitor {
    pub fn new(config: QualityConfig) -> Self {
        Self {
            config,
            samples: Arc::new(RwLock::new(HashMap::new())),
            tasks: HashMap::new(),
        }
    }

    /// Begin monitoring `remote`. A sample is taken immediately, then on
    /// every interval until the transport leaves `connected`.
    pub async fn start(&mut self, remote: &EndpointId, transport: Arc<dyn PeerTransport>) {
        self.stop(remote).await;

        match sample_once(remote, transport.as_ref(), &self.config).await {
            Tick::Stopped => {
                debug!(remote = %remote, "Transport not connected, quality monitor not started");
                return;
            }
            Tick::Skipped => info!(remote = %remote, "Quality monitoring started"),
            Tick::Sample(first) => {
                info!(remote = %remote, level = %first.level, "Quality monitoring started");
                self.samples.write().await.insert(remote.clone(), first);
            }
        }

        let period = Duration::from_secs(u64::from(self.config.sample_interval_secs.max(1)));
        let config = self.config.clone();
        let samples = Arc::clone(&self.samples);
        let task_remote = remote.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately; that sample is already taken.
            interval.tick().await;
            loop {
                interval.tick().await;
                match sample_once(&task_remote, transport.as_ref(), &config).await {
                    Tick::Sample(sample) => {
                        debug!(
                            remote = %task_remote,
                            level = %sample.level,
                            packets_lost = sample.packets_lost,
                            jitter = sample.jitter_secs,
                            rtt = sample.round_trip_secs,
                            "Quality sample"
                        );
                        samples.write().await.insert(task_remote.clone(), sample);
                    }
                    Tick::Skipped => {}
                    Tick::Stopped => {
                        samples.write().await.remove(&task_remote);
                        debug!(remote = %task_remote, "Transport left connected, quality monitor stopped");
                        break;
                    }
                }
            }
        });
        self.tasks.insert(remote.clone(), handle);
    }

    pub async fn stop(&mut self, remote: &EndpointId) {
        if let Some(handle) = self.tasks.remove(remote) {
            handle.abort();
        }
        self.samples.write().await.remove(remote);
    }

    pub async fn stop_all(&mut self) {
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
        self.samples.write().await.clear();
    }

    pub async fn sample(&self, remote: &EndpointId) -> Option<QualitySample> {
        self.samples.read().await.get(remote).cloned()
    }

    pub async fn samples(&self) -> HashMap<EndpointId, QualitySample> {
        self.samples.read().await.clone()
    }

    /// Whether a sampling task is alive for `remote`.
    pub fn is_monitoring(&self, remote: &EndpointId) -> bool {
        self.tasks.get(remote).is_some_and(|h| !h.is_finished())
    }
}

impl Drop for QualityMonitor {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
    }
}

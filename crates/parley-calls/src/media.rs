//! Local capture devices and the tracks they hand out.
//!
//! A [`MediaTrack`] is a cheap clonable handle; every clone shares the
//! same enabled/stopped flags, so the session can mute a track that is
//! already attached to a transport.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parley_common::{CallKind, DeviceError};
use tracing::debug;

/// What a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Audio => "audio",
            Self::Video => "video",
        })
    }
}

/// Where a track was captured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera,
    Display,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

/// Handle to one captured media track.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, source: TrackSource) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: parley_common::new_id(),
                kind,
                source,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Release the underlying device. Stopping twice is a no-op.
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            debug!(track = %self.inner.id, kind = %self.inner.kind, "Track stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Access to local capture hardware.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open the microphone or camera.
    async fn acquire(&self, kind: TrackKind) -> Result<MediaTrack, DeviceError>;

    /// Open a display capture. Always video-only.
    async fn acquire_display(&self) -> Result<MediaTrack, DeviceError>;
}

/// The tracks owned by the local side of one session.
#[derive(Debug, Default)]
pub struct LocalMedia {
    tracks: Vec<MediaTrack>,
}

impl LocalMedia {
    /// Open audio, plus video for video calls. If a later device fails the
    /// ones already opened are stopped before the error is returned.
    pub async fn acquire(devices: &dyn MediaDevices, kind: CallKind) -> Result<Self, DeviceError> {
        let audio = devices.acquire(TrackKind::Audio).await?;
        let mut tracks = vec![audio];

        if kind.is_video() {
            match devices.acquire(TrackKind::Video).await {
                Ok(video) => tracks.push(video),
                Err(e) => {
                    for track in &tracks {
                        track.stop();
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self { tracks })
    }

    /// Open a display capture for screen sharing.
    pub async fn acquire_display(devices: &dyn MediaDevices) -> Result<Self, DeviceError> {
        let track = devices.acquire_display().await?;
        Ok(Self {
            tracks: vec![track],
        })
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn audio(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    /// Flip the microphone. Returns whether audio is now muted.
    pub fn toggle_mute(&self) -> Option<bool> {
        self.audio().map(|track| {
            track.set_enabled(!track.is_enabled());
            !track.is_enabled()
        })
    }

    /// Flip the camera. Returns whether video is now off.
    pub fn toggle_video(&self) -> Option<bool> {
        self.video().map(|track| {
            track.set_enabled(!track.is_enabled());
            !track.is_enabled()
        })
    }

    pub fn stop_all(&mut self) {
        for track in self.tracks.drain(..) {
            track.stop();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackDevices;

    #[tokio::test]
    async fn voice_call_acquires_audio_only() {
        let devices = LoopbackDevices::new();
        let media = LocalMedia::acquire(&devices, CallKind::Voice).await.unwrap();
        assert_eq!(media.tracks().len(), 1);
        assert!(media.audio().is_some());
        assert!(media.video().is_none());
    }

    #[tokio::test]
    async fn failed_camera_releases_microphone() {
        let devices = LoopbackDevices::new();
        devices.fail(TrackKind::Video, DeviceError::Busy);

        let err = LocalMedia::acquire(&devices, CallKind::Video).await.unwrap_err();
        assert_eq!(err, DeviceError::Busy);

        let issued = devices.issued();
        assert_eq!(issued.len(), 1);
        assert!(issued[0].is_stopped());
    }

    #[tokio::test]
    async fn toggles_flip_the_shared_track() {
        let devices = LoopbackDevices::new();
        let media = LocalMedia::acquire(&devices, CallKind::Video).await.unwrap();
        let attached = media.audio().unwrap().clone();

        assert_eq!(media.toggle_mute(), Some(true));
        assert!(!attached.is_enabled());
        assert_eq!(media.toggle_mute(), Some(false));
        assert!(attached.is_enabled());

        assert_eq!(media.toggle_video(), Some(true));
    }

    #[tokio::test]
    async fn stop_all_is_idempotent() {
        let devices = LoopbackDevices::new();
        let mut media = LocalMedia::acquire(&devices, CallKind::Video).await.unwrap();
        media.stop_all();
        media.stop_all();
        assert!(media.is_empty());
        assert!(devices.issued().iter().all(MediaTrack::is_stopped));
    }

    #[test]
    fn toggle_without_video_is_none() {
        let media = LocalMedia::default();
        assert_eq!(media.toggle_video(), None);
        assert_eq!(media.toggle_mute(), None);
    }
}

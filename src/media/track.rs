use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

const FRAME_FANOUT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// What a track carries, announced to peers alongside every offer and answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackPurpose {
    Camera,
    Microphone,
    Screen,
    ScreenAudio,
}

impl TrackPurpose {
    pub fn kind(&self) -> TrackKind {
        match self {
            TrackPurpose::Camera | TrackPurpose::Screen => TrackKind::Video,
            TrackPurpose::Microphone | TrackPurpose::ScreenAudio => TrackKind::Audio,
        }
    }

    /// Purpose assumed for an incoming track that arrived without a tag.
    pub fn default_for(kind: TrackKind) -> Self {
        match kind {
            TrackKind::Audio => TrackPurpose::Microphone,
            TrackKind::Video => TrackPurpose::Camera,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl VideoConstraints {
    pub const fn new(width: u32, height: u32, frame_rate: u32) -> Self {
        Self {
            width,
            height,
            frame_rate,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA8, `width * height * 4` bytes.
    pub rgba: Bytes,
    pub timestamp: Duration,
}

impl VideoFrame {
    pub fn new(width: u32, height: u32, rgba: impl Into<Bytes>, timestamp: Duration) -> Self {
        Self {
            width,
            height,
            rgba: rgba.into(),
            timestamp,
        }
    }

    pub fn is_well_formed(&self) -> bool {
        self.rgba.len() == (self.width as usize) * (self.height as usize) * 4
    }
}

#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub sample_rate: u32,
    pub channels: u16,
    /// Interleaved samples in `[-1.0, 1.0]`.
    pub samples: Arc<[f32]>,
    pub timestamp: Duration,
}

impl AudioFrame {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let per_channel = self.samples.len() as f64 / self.channels as f64;
        Duration::from_secs_f64(per_channel / self.sample_rate as f64)
    }

    /// First channel only, which is what level analysis looks at.
    pub fn mono(&self) -> impl Iterator<Item = f32> + '_ {
        self.samples
            .iter()
            .step_by(self.channels.max(1) as usize)
            .copied()
    }
}

#[derive(Debug, Clone)]
pub enum MediaFrame {
    Video(VideoFrame),
    Audio(AudioFrame),
}

impl MediaFrame {
    pub fn kind(&self) -> TrackKind {
        match self {
            MediaFrame::Video(_) => TrackKind::Video,
            MediaFrame::Audio(_) => TrackKind::Audio,
        }
    }

    pub fn timestamp(&self) -> Duration {
        match self {
            MediaFrame::Video(v) => v.timestamp,
            MediaFrame::Audio(a) => a.timestamp,
        }
    }
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    stream_id: String,
    device_id: Option<String>,
    remote: bool,
    enabled: AtomicBool,
    frames: broadcast::Sender<MediaFrame>,
    latest: watch::Sender<Option<MediaFrame>>,
    ended: watch::Sender<bool>,
    constraints: watch::Sender<Option<VideoConstraints>>,
}

/// Handle to one live audio or video track.
///
/// Clones share the same underlying track; stopping any clone ends it for all
/// holders. The purpose is carried per handle so a remote track can be
/// re-labelled once its announced tag is known.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
    purpose: TrackPurpose,
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("purpose", &self.purpose)
            .field("stream_id", &self.inner.stream_id)
            .field("remote", &self.inner.remote)
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl MediaTrack {
    fn build(
        id: String,
        purpose: TrackPurpose,
        label: String,
        stream_id: String,
        device_id: Option<String>,
        remote: bool,
    ) -> Self {
        let (frames, _) = broadcast::channel(FRAME_FANOUT);
        let (latest, _) = watch::channel(None);
        let (ended, _) = watch::channel(false);
        let (constraints, _) = watch::channel(None);
        Self {
            inner: Arc::new(TrackInner {
                id,
                kind: purpose.kind(),
                label,
                stream_id,
                device_id,
                remote,
                enabled: AtomicBool::new(true),
                frames,
                latest,
                ended,
                constraints,
            }),
            purpose,
        }
    }

    /// A locally captured track with a fresh id.
    pub fn local(
        purpose: TrackPurpose,
        label: impl Into<String>,
        stream_id: impl Into<String>,
        device_id: Option<String>,
    ) -> Self {
        Self::build(
            Uuid::new_v4().to_string(),
            purpose,
            label.into(),
            stream_id.into(),
            device_id,
            false,
        )
    }

    /// A track received from a peer. Its purpose is the kind default until classified.
    pub fn remote(kind: TrackKind, id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        let id = id.into();
        Self::build(
            id.clone(),
            TrackPurpose::default_for(kind),
            id,
            stream_id.into(),
            None,
            true,
        )
    }

    pub fn with_purpose(&self, purpose: TrackPurpose) -> Self {
        Self {
            inner: self.inner.clone(),
            purpose,
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn purpose(&self) -> TrackPurpose {
        self.purpose
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    pub fn device_id(&self) -> Option<&str> {
        self.inner.device_id.as_deref()
    }

    pub fn is_remote(&self) -> bool {
        self.inner.remote
    }

    /// Publish a frame to every consumer. Frames on a disabled or ended track are dropped.
    pub fn push(&self, frame: MediaFrame) {
        if self.is_ended() || !self.is_enabled() {
            return;
        }
        // No subscribers is fine; the latest frame is still kept.
        let _ = self.inner.frames.send(frame.clone());
        self.inner.latest.send_replace(Some(frame));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MediaFrame> {
        self.inner.frames.subscribe()
    }

    pub fn latest_frame(&self) -> Option<MediaFrame> {
        self.inner.latest.borrow().clone()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.inner.ended.send_if_modified(|ended| {
            let changed = !*ended;
            *ended = true;
            changed
        });
    }

    pub fn is_ended(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// Resolves once the track has ended, whoever ended it.
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        // The sender lives in `inner`, which we hold, so this cannot error.
        let _ = rx.wait_for(|ended| *ended).await;
    }

    pub fn apply_constraints(&self, constraints: VideoConstraints) {
        self.inner.constraints.send_replace(Some(constraints));
    }

    pub fn constraints(&self) -> Option<VideoConstraints> {
        *self.inner.constraints.borrow()
    }
}

/// The local participant's camera capture: zero or one track of each kind.
#[derive(Debug, Clone)]
pub struct LocalStream {
    pub id: String,
    pub audio: Option<MediaTrack>,
    pub video: Option<MediaTrack>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            audio: None,
            video: None,
        }
    }

    pub fn tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.audio.iter().chain(self.video.iter())
    }

    pub fn track(&self, kind: TrackKind) -> Option<&MediaTrack> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    pub fn stop(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_frame(ts_ms: u64) -> MediaFrame {
        MediaFrame::Video(VideoFrame::new(
            2,
            2,
            vec![0u8; 16],
            Duration::from_millis(ts_ms),
        ))
    }

    #[tokio::test]
    async fn test_push_fans_out_and_keeps_latest() {
        let track = MediaTrack::local(TrackPurpose::Camera, "cam", "stream-a", None);
        let mut rx = track.subscribe();

        track.push(video_frame(1));
        track.push(video_frame(2));

        assert_eq!(rx.recv().await.unwrap().timestamp(), Duration::from_millis(1));
        assert_eq!(rx.recv().await.unwrap().timestamp(), Duration::from_millis(2));
        assert_eq!(
            track.latest_frame().unwrap().timestamp(),
            Duration::from_millis(2)
        );
    }

    #[tokio::test]
    async fn test_disabled_and_ended_tracks_drop_frames() {
        let track = MediaTrack::local(TrackPurpose::Camera, "cam", "stream-a", None);
        track.set_enabled(false);
        track.push(video_frame(1));
        assert!(track.latest_frame().is_none());

        track.set_enabled(true);
        track.stop();
        track.push(video_frame(2));
        assert!(track.latest_frame().is_none());
    }

    #[tokio::test]
    async fn test_ended_resolves_for_every_clone() {
        let track = MediaTrack::local(TrackPurpose::Screen, "display", "screen-a", None);
        let watcher = track.clone();
        let handle = tokio::spawn(async move { watcher.ended().await });

        track.stop();
        track.stop();
        handle.await.unwrap();
        assert!(track.is_ended());
    }

    #[test]
    fn test_with_purpose_shares_state() {
        let remote = MediaTrack::remote(TrackKind::Video, "t1", "s1");
        assert_eq!(remote.purpose(), TrackPurpose::Camera);
        assert!(remote.is_remote());
        let screen = remote.with_purpose(TrackPurpose::Screen);
        assert_eq!(screen, remote);
        screen.stop();
        assert!(remote.is_ended());
    }

    #[test]
    fn test_audio_frame_duration() {
        let frame = AudioFrame {
            sample_rate: 48_000,
            channels: 2,
            samples: vec![0.0; 960].into(),
            timestamp: Duration::ZERO,
        };
        assert_eq!(frame.duration(), Duration::from_millis(10));
        assert_eq!(frame.mono().count(), 480);
    }
}

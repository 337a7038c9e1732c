use async_trait::async_trait;

use super::devices::{CaptureBackend, CaptureError, DeviceInfo, DeviceKind};
use super::pattern::spawn_test_pattern;
use super::track::{LocalStream, MediaTrack, TrackPurpose, VideoConstraints};
use crate::audio::CpalAudio;

const PATTERN_DEVICE: &str = "test-pattern";
const DISPLAY_PROFILE: VideoConstraints = VideoConstraints::new(1280, 720, 15);

/// Microphones through cpal; camera and display through the synthetic pattern.
#[derive(Debug, Default, Clone)]
pub struct SystemCaptureBackend {
    audio: CpalAudio,
}

impl SystemCaptureBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CaptureBackend for SystemCaptureBackend {
    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, CaptureError> {
        let mut devices = self.audio.enumerate_inputs()?;
        devices.push(DeviceInfo {
            id: PATTERN_DEVICE.to_string(),
            label: "Test pattern".to_string(),
            kind: DeviceKind::VideoInput,
        });
        Ok(devices)
    }

    async fn open_audio(
        &self,
        device_id: Option<&str>,
        stream_id: &str,
    ) -> Result<MediaTrack, CaptureError> {
        self.audio.open_input(device_id, stream_id).await
    }

    async fn open_video(
        &self,
        device_id: Option<&str>,
        constraints: Option<VideoConstraints>,
        stream_id: &str,
    ) -> Result<MediaTrack, CaptureError> {
        if device_id.is_some_and(|id| id != PATTERN_DEVICE) {
            return Err(CaptureError::DeviceMissing);
        }
        let track = MediaTrack::local(
            TrackPurpose::Camera,
            "Test pattern",
            stream_id,
            Some(PATTERN_DEVICE.to_string()),
        );
        if let Some(constraints) = constraints {
            track.apply_constraints(constraints);
        }
        spawn_test_pattern(track.clone(), 0);
        Ok(track)
    }

    async fn open_display(&self, stream_id: &str) -> Result<LocalStream, CaptureError> {
        let track = MediaTrack::local(TrackPurpose::Screen, "Screen", stream_id, None);
        track.apply_constraints(DISPLAY_PROFILE);
        spawn_test_pattern(track.clone(), 128);
        let mut stream = LocalStream::new(stream_id);
        stream.video = Some(track);
        Ok(stream)
    }
}

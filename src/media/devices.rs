use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::track::{LocalStream, MediaTrack, TrackKind, VideoConstraints};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("permission to use the capture device was denied")]
    PermissionDenied,
    #[error("capture device is in use by another application")]
    DeviceBusy,
    #[error("no matching capture device was found")]
    DeviceMissing,
    #[error("{0}")]
    Other(String),
}

impl CaptureError {
    pub fn other(msg: impl std::fmt::Display) -> Self {
        Self::Other(msg.to_string())
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            CaptureError::PermissionDenied => {
                "Camera or microphone access was denied. Allow access and try again."
            }
            CaptureError::DeviceBusy => {
                "Your camera or microphone is being used by another application. Close it and try again."
            }
            CaptureError::DeviceMissing => {
                "No camera or microphone was found. Connect a device and try again."
            }
            CaptureError::Other(_) => {
                "Your camera or microphone could not be started. Check your devices and try again."
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    AudioInput,
    VideoInput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub label: String,
    pub kind: DeviceKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceList {
    pub audio_devices: Vec<DeviceInfo>,
    pub video_devices: Vec<DeviceInfo>,
}

/// Preferred capture devices. An empty id lets the platform default apply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSelection {
    pub audio_device_id: String,
    pub video_device_id: String,
}

impl DeviceSelection {
    pub fn new(audio_device_id: impl Into<String>, video_device_id: impl Into<String>) -> Self {
        Self {
            audio_device_id: audio_device_id.into(),
            video_device_id: video_device_id.into(),
        }
    }

    pub fn audio(&self) -> Option<&str> {
        non_empty(&self.audio_device_id)
    }

    pub fn video(&self) -> Option<&str> {
        non_empty(&self.video_device_id)
    }
}

fn non_empty(id: &str) -> Option<&str> {
    let id = id.trim();
    (!id.is_empty()).then_some(id)
}

/// Platform capture: microphones, cameras and display surfaces.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn enumerate(&self) -> std::result::Result<Vec<DeviceInfo>, CaptureError>;

    async fn open_audio(
        &self,
        device_id: Option<&str>,
        stream_id: &str,
    ) -> std::result::Result<MediaTrack, CaptureError>;

    async fn open_video(
        &self,
        device_id: Option<&str>,
        constraints: Option<VideoConstraints>,
        stream_id: &str,
    ) -> std::result::Result<MediaTrack, CaptureError>;

    async fn open_display(&self, stream_id: &str)
        -> std::result::Result<LocalStream, CaptureError>;
}

/// Whoever currently sends the local tracks to peers.
#[async_trait]
pub trait TrackReplacer: Send {
    /// Swap `old` for `new` on every sender carrying `old`.
    async fn replace_track(&mut self, old: &MediaTrack, new: &MediaTrack) -> Result<()>;

    /// Start sending a track of a kind that was not captured before.
    async fn add_track(&mut self, track: &MediaTrack) -> Result<()>;

    /// Stop sending a track added by [`add_track`](Self::add_track).
    async fn remove_track(&mut self, track: &MediaTrack) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VideoAttempt<'a> {
    pub device: Option<&'a str>,
    pub constraints: Option<VideoConstraints>,
}

/// Capture attempts from most to least specific.
pub(crate) fn video_ladder(device: Option<&str>, ideal: VideoConstraints) -> Vec<VideoAttempt<'_>> {
    let mut ladder = Vec::with_capacity(4);
    if let Some(device) = device {
        ladder.push(VideoAttempt {
            device: Some(device),
            constraints: Some(ideal),
        });
        ladder.push(VideoAttempt {
            device: Some(device),
            constraints: None,
        });
    }
    ladder.push(VideoAttempt {
        device: None,
        constraints: Some(ideal),
    });
    ladder.push(VideoAttempt {
        device: None,
        constraints: None,
    });
    ladder
}

pub(crate) fn audio_ladder(device: Option<&str>) -> Vec<Option<&str>> {
    match device {
        Some(device) => vec![Some(device), None],
        None => vec![None],
    }
}

/// Owns the local capture stream and serializes every change to it.
pub struct MediaDeviceController {
    backend: Arc<dyn CaptureBackend>,
    stream_id: String,
    constraints: Mutex<VideoConstraints>,
    selection: Mutex<DeviceSelection>,
    current: Mutex<Option<LocalStream>>,
    switching: tokio::sync::Mutex<()>,
}

impl MediaDeviceController {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        stream_id: impl Into<String>,
        ideal: VideoConstraints,
    ) -> Self {
        Self {
            backend,
            stream_id: stream_id.into(),
            constraints: Mutex::new(ideal),
            selection: Mutex::new(DeviceSelection::default()),
            current: Mutex::new(None),
            switching: tokio::sync::Mutex::new(()),
        }
    }

    pub fn backend(&self) -> Arc<dyn CaptureBackend> {
        self.backend.clone()
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub async fn enumerate(&self) -> Result<DeviceList> {
        let devices = self.backend.enumerate().await?;
        let (audio_devices, video_devices) = devices
            .into_iter()
            .partition(|d| d.kind == DeviceKind::AudioInput);
        Ok(DeviceList {
            audio_devices,
            video_devices,
        })
    }

    pub fn current(&self) -> Option<LocalStream> {
        lock(&self.current).clone()
    }

    pub fn selection(&self) -> DeviceSelection {
        lock(&self.selection).clone()
    }

    /// Open the initial local stream.
    pub async fn acquire(&self, selection: DeviceSelection) -> Result<LocalStream> {
        let _guard = self
            .switching
            .try_lock()
            .map_err(|_| Error::SwitchInProgress)?;
        let stream = self.open_stream(&selection).await?;
        let previous = lock(&self.current).replace(stream.clone());
        if let Some(previous) = previous {
            previous.stop();
        }
        *lock(&self.selection) = selection;
        Ok(stream)
    }

    /// Move to new devices mid-session.
    ///
    /// Every sender is handed the new track before any old track is stopped.
    /// A switch requested while another is running is rejected.
    pub async fn switch(
        &self,
        selection: DeviceSelection,
        replacer: &mut dyn TrackReplacer,
    ) -> Result<LocalStream> {
        let _guard = self
            .switching
            .try_lock()
            .map_err(|_| Error::SwitchInProgress)?;
        let old = self
            .current()
            .ok_or_else(|| Error::media("no local stream to switch from"))?;
        let fresh = self.open_stream(&selection).await?;

        let mut merged = LocalStream::new(old.id.clone());
        let mut replaced: Vec<(MediaTrack, MediaTrack)> = Vec::new();
        let mut added: Vec<MediaTrack> = Vec::new();
        for kind in [TrackKind::Audio, TrackKind::Video] {
            let slot = match (old.track(kind), fresh.track(kind)) {
                (Some(previous), Some(next)) => {
                    next.set_enabled(previous.is_enabled());
                    // Recorded first: a failure can leave some senders already moved.
                    replaced.push((previous.clone(), next.clone()));
                    if let Err(e) = replacer.replace_track(previous, next).await {
                        warn!(error = %e, %kind, "track replacement failed, rolling back switch");
                        roll_back(replacer, &replaced, &added).await;
                        fresh.stop();
                        return Err(e);
                    }
                    Some(next.clone())
                }
                (None, Some(next)) => {
                    added.push(next.clone());
                    if let Err(e) = replacer.add_track(next).await {
                        warn!(error = %e, %kind, "adding track failed, rolling back switch");
                        roll_back(replacer, &replaced, &added).await;
                        fresh.stop();
                        return Err(e);
                    }
                    Some(next.clone())
                }
                (Some(previous), None) => Some(previous.clone()),
                (None, None) => None,
            };
            match kind {
                TrackKind::Audio => merged.audio = slot,
                TrackKind::Video => merged.video = slot,
            }
        }

        // Peers already carry the new tracks; only now is it safe to stop the old ones.
        for (previous, _) in &replaced {
            debug!(track = %previous.id(), "stopping replaced track");
            previous.stop();
        }

        *lock(&self.current) = Some(merged.clone());
        *lock(&self.selection) = selection;
        info!(
            audio = ?merged.audio.as_ref().map(|t| t.label().to_string()),
            video = ?merged.video.as_ref().map(|t| t.label().to_string()),
            "switched capture devices"
        );
        Ok(merged)
    }

    pub fn apply_video_constraints(&self, constraints: VideoConstraints) {
        *lock(&self.constraints) = constraints;
        if let Some(video) = self.current().and_then(|s| s.video) {
            video.apply_constraints(constraints);
        }
    }

    pub fn video_constraints(&self) -> VideoConstraints {
        *lock(&self.constraints)
    }

    pub fn set_audio_enabled(&self, enabled: bool) -> bool {
        match self.current().and_then(|s| s.audio) {
            Some(track) => {
                track.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    pub fn set_video_enabled(&self, enabled: bool) -> bool {
        match self.current().and_then(|s| s.video) {
            Some(track) => {
                track.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    pub fn stop(&self) {
        if let Some(stream) = lock(&self.current).take() {
            stream.stop();
        }
    }

    async fn open_stream(&self, selection: &DeviceSelection) -> Result<LocalStream> {
        let mut stream = LocalStream::new(self.stream_id.clone());
        let mut last_error = None;

        for device in audio_ladder(selection.audio()) {
            match self.backend.open_audio(device, &self.stream_id).await {
                Ok(track) => {
                    stream.audio = Some(track);
                    break;
                }
                Err(e) => {
                    debug!(?device, error = %e, "audio capture attempt failed");
                    last_error = Some(e);
                }
            }
        }

        let ideal = self.video_constraints();
        for attempt in video_ladder(selection.video(), ideal) {
            match self
                .backend
                .open_video(attempt.device, attempt.constraints, &self.stream_id)
                .await
            {
                Ok(track) => {
                    if track.constraints().is_none() {
                        track.apply_constraints(ideal);
                    }
                    stream.video = Some(track);
                    break;
                }
                Err(e) => {
                    debug!(device = ?attempt.device, constraints = ?attempt.constraints, error = %e, "video capture attempt failed");
                    last_error = Some(e);
                }
            }
        }

        if stream.audio.is_none() && stream.video.is_none() {
            let error = last_error.unwrap_or(CaptureError::DeviceMissing);
            warn!(error = %error, "every capture attempt failed");
            return Err(error.into());
        }
        if stream.audio.is_none() {
            warn!("no microphone could be opened, continuing with video only");
        }
        if stream.video.is_none() {
            warn!("no camera could be opened, continuing with audio only");
        }
        Ok(stream)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Undo a partial switch. Senders that never moved are left alone.
async fn roll_back(
    replacer: &mut dyn TrackReplacer,
    replaced: &[(MediaTrack, MediaTrack)],
    added: &[MediaTrack],
) {
    for track in added.iter().rev() {
        if let Err(e) = replacer.remove_track(track).await {
            warn!(track = %track.id(), error = %e, "rollback of added track failed");
        }
    }
    for (previous, next) in replaced.iter().rev() {
        if let Err(e) = replacer.replace_track(next, previous).await {
            warn!(track = %previous.id(), error = %e, "rollback of replaced track failed");
        }
    }
}

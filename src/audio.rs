use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::media::{
    AudioFrame, CaptureError, DeviceInfo, DeviceKind, MediaFrame, MediaTrack, TrackKind,
    TrackPurpose,
};

/// Samples buffered for playback before the oldest are dropped (about one second at 48kHz).
const PLAYBACK_BUFFER: usize = 48_000;

/// Microphone capture through the default cpal host.
#[derive(Debug, Default, Clone)]
pub struct CpalAudio;

impl CpalAudio {
    pub fn enumerate_inputs(&self) -> Result<Vec<DeviceInfo>, CaptureError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| classify_backend(&e.to_string()))?;
        Ok(devices
            .filter_map(|device| device.name().ok())
            .map(|name| DeviceInfo {
                id: name.clone(),
                label: name,
                kind: DeviceKind::AudioInput,
            })
            .collect())
    }

    /// Open a microphone. The cpal stream lives on its own thread until the track ends.
    pub async fn open_input(
        &self,
        device_id: Option<&str>,
        stream_id: &str,
    ) -> Result<MediaTrack, CaptureError> {
        let wanted = device_id.map(str::to_string);
        let stream_id = stream_id.to_string();
        let (ready_tx, ready_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("meshmeet-mic".into())
            .spawn(move || {
                let opened = Self::start_input(wanted.as_deref(), &stream_id);
                match opened {
                    Ok((stream, track)) => {
                        if ready_tx.send(Ok(track.clone())).is_err() {
                            return;
                        }
                        futures::executor::block_on(track.ended());
                        drop(stream);
                        debug!(track = %track.id(), "microphone released");
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| CaptureError::other(format!("failed to spawn capture thread: {}", e)))?;

        ready_rx
            .await
            .map_err(|_| CaptureError::other("capture thread exited before opening the device"))?
    }

    fn start_input(
        device_id: Option<&str>,
        stream_id: &str,
    ) -> Result<(cpal::Stream, MediaTrack), CaptureError> {
        let host = cpal::default_host();
        let device = match device_id {
            Some(id) => host
                .input_devices()
                .map_err(|e| classify_backend(&e.to_string()))?
                .find(|d| d.name().map(|n| n == id).unwrap_or(false))
                .ok_or(CaptureError::DeviceMissing)?,
            None => host
                .default_input_device()
                .ok_or(CaptureError::DeviceMissing)?,
        };
        let label = device.name().unwrap_or_else(|_| "microphone".to_string());

        let config = device.default_input_config().map_err(|e| match e {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => CaptureError::DeviceMissing,
            other => classify_backend(&other.to_string()),
        })?;
        debug!(device = %label, ?config, "input config");

        let track = MediaTrack::local(
            TrackPurpose::Microphone,
            label,
            stream_id,
            device_id.map(str::to_string),
        );
        let sample_rate = config.sample_rate().0;
        let channels = config.channels();

        let stream = match config.sample_format() {
            SampleFormat::F32 => Self::build_input_stream::<f32>(
                &device,
                &config.into(),
                track.clone(),
                sample_rate,
                channels,
            )?,
            SampleFormat::I16 => Self::build_input_stream::<i16>(
                &device,
                &config.into(),
                track.clone(),
                sample_rate,
                channels,
            )?,
            SampleFormat::U16 => Self::build_input_stream::<u16>(
                &device,
                &config.into(),
                track.clone(),
                sample_rate,
                channels,
            )?,
            sample_format => {
                return Err(CaptureError::other(format!(
                    "unsupported sample format: {:?}",
                    sample_format
                )))
            }
        };

        stream.play().map_err(|e| match e {
            cpal::PlayStreamError::DeviceNotAvailable => CaptureError::DeviceMissing,
            other => classify_backend(&other.to_string()),
        })?;

        Ok((stream, track))
    }

    fn build_input_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        track: MediaTrack,
        sample_rate: u32,
        channels: u16,
    ) -> Result<cpal::Stream, CaptureError>
    where
        T: SizedSample + Send + 'static,
        f32: FromSample<T>,
    {
        let started = Instant::now();
        let err_fn = |err| error!("an error occurred on the input audio stream: {}", err);

        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    let samples: Vec<f32> = data.iter().map(|s| f32::from_sample(*s)).collect();
                    track.push(MediaFrame::Audio(AudioFrame {
                        sample_rate,
                        channels,
                        samples: samples.into(),
                        timestamp: started.elapsed(),
                    }));
                },
                err_fn,
                None,
            )
            .map_err(|e| match e {
                cpal::BuildStreamError::DeviceNotAvailable => CaptureError::DeviceMissing,
                other => classify_backend(&other.to_string()),
            })
    }
}

/// Map a backend-specific failure onto the capture error categories.
pub(crate) fn classify_backend(message: &str) -> CaptureError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not allowed") {
        CaptureError::PermissionDenied
    } else if lower.contains("busy") || lower.contains("in use") {
        CaptureError::DeviceBusy
    } else if lower.contains("not found") || lower.contains("no such") {
        CaptureError::DeviceMissing
    } else {
        CaptureError::Other(message.to_string())
    }
}

/// Plays a remote audio track on the default output device.
pub struct AudioPlayback {
    track: MediaTrack,
}

impl AudioPlayback {
    pub fn new(track: MediaTrack) -> anyhow::Result<Self> {
        if track.kind() != TrackKind::Audio {
            anyhow::bail!("track {} is not an audio track", track.id());
        }

        let buffer = Arc::new(Mutex::new(VecDeque::<f32>::with_capacity(PLAYBACK_BUFFER)));

        let feeder_buffer = buffer.clone();
        let mut frames = track.subscribe();
        tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(MediaFrame::Audio(frame)) => {
                        let mut queue = feeder_buffer.lock().unwrap_or_else(|e| e.into_inner());
                        queue.extend(frame.mono());
                        let overflow = queue.len().saturating_sub(PLAYBACK_BUFFER);
                        queue.drain(..overflow);
                    }
                    Ok(MediaFrame::Video(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "playback lagged behind remote audio");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let thread_track = track.clone();
        std::thread::Builder::new()
            .name("meshmeet-playback".into())
            .spawn(move || match Self::start_output(buffer) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    futures::executor::block_on(thread_track.ended());
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        ready_rx
            .recv()
            .map_err(|_| anyhow::anyhow!("playback thread exited early"))??;
        info!(track = %track.id(), "playing remote audio");
        Ok(Self { track })
    }

    pub fn track(&self) -> &MediaTrack {
        &self.track
    }

    fn start_output(buffer: Arc<Mutex<VecDeque<f32>>>) -> anyhow::Result<cpal::Stream> {
        let host = cpal::default_host();
        let output_device = host
            .default_output_device()
            .ok_or_else(|| anyhow::anyhow!("No output device available"))?;

        let config = output_device.default_output_config()?;
        debug!(?config, "output config");
        let channels = config.channels() as usize;

        let stream = match config.sample_format() {
            SampleFormat::F32 => {
                Self::build_output_stream::<f32>(&output_device, &config.into(), buffer, channels)?
            }
            SampleFormat::I16 => {
                Self::build_output_stream::<i16>(&output_device, &config.into(), buffer, channels)?
            }
            SampleFormat::U16 => {
                Self::build_output_stream::<u16>(&output_device, &config.into(), buffer, channels)?
            }
            sample_format => {
                return Err(anyhow::anyhow!(
                    "Unsupported sample format: {:?}",
                    sample_format
                ))
            }
        };

        stream.play()?;
        Ok(stream)
    }

    fn build_output_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        buffer: Arc<Mutex<VecDeque<f32>>>,
        channels: usize,
    ) -> anyhow::Result<cpal::Stream>
    where
        T: SizedSample + FromSample<f32> + Send + 'static,
    {
        let err_fn = |err| warn!("an error occurred on the output audio stream: {}", err);

        let stream = device.build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut queue = buffer.lock().unwrap_or_else(|e| e.into_inner());
                for frame in data.chunks_mut(channels.max(1)) {
                    // Output silence if no samples are available
                    let value = T::from_sample(queue.pop_front().unwrap_or(0.0));
                    for sample in frame.iter_mut() {
                        *sample = value;
                    }
                }
            },
            err_fn,
            None,
        )?;

        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_messages_are_classified() {
        assert_eq!(
            classify_backend("Permission denied by the system"),
            CaptureError::PermissionDenied
        );
        assert_eq!(
            classify_backend("Device or resource busy"),
            CaptureError::DeviceBusy
        );
        assert_eq!(
            classify_backend("No such device"),
            CaptureError::DeviceMissing
        );
        assert!(matches!(
            classify_backend("ALSA function failed"),
            CaptureError::Other(_)
        ));
    }
}

//! Wire payloads for media frames.
//!
//! Audio travels as `sample_rate u32 | channels u16 | i16 LE samples` and is
//! split so one payload fits one RTP packet. Video travels as
//! `jpeg length u32 | baseline JPEG`, re-encoded at lower quality and then at
//! half resolution until it fits [`MAX_VIDEO_PAYLOAD`]. Bytes after the JPEG
//! are ignored, so a transport may pad.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ImageFormat, RgbImage};
use tracing::debug;

use super::track::{AudioFrame, MediaFrame, TrackKind, VideoFrame};

/// Largest audio payload; leaves room for the RTP header under a 1200 byte MTU.
pub const MAX_AUDIO_PAYLOAD: usize = 1100;
/// Largest encoded video frame.
pub const MAX_VIDEO_PAYLOAD: usize = 192 * 1024;

const AUDIO_HEADER: usize = 4 + 2;
const VIDEO_HEADER: usize = 4;
const JPEG_QUALITIES: [u8; 3] = [80, 60, 40];
const MIN_DIMENSION: u32 = 16;

/// Turns frames into transport payloads and back.
pub trait FrameCodec: Send + Sync {
    fn encode(&self, frame: &MediaFrame) -> Option<Bytes>;
    fn decode(&self, kind: TrackKind, payload: &[u8], timestamp: Duration) -> Option<MediaFrame>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WireCodec;

/// Most interleaved samples a single audio payload carries for `channels`.
pub fn max_audio_samples(channels: u16) -> usize {
    let channels = channels.max(1) as usize;
    (MAX_AUDIO_PAYLOAD - AUDIO_HEADER) / 2 / channels * channels
}

/// Split audio so every piece encodes within [`MAX_AUDIO_PAYLOAD`]. Video passes through.
pub fn split_for_wire(frame: MediaFrame) -> Vec<MediaFrame> {
    let audio = match frame {
        MediaFrame::Audio(audio) => audio,
        video => return vec![video],
    };
    let limit = max_audio_samples(audio.channels);
    if audio.samples.len() <= limit {
        return vec![MediaFrame::Audio(audio)];
    }
    let channels = audio.channels.max(1) as f64;
    audio
        .samples
        .chunks(limit)
        .scan(0usize, |offset, chunk| {
            let start = *offset;
            *offset += chunk.len();
            let elapsed = if audio.sample_rate == 0 {
                Duration::ZERO
            } else {
                Duration::from_secs_f64(start as f64 / channels / audio.sample_rate as f64)
            };
            Some(MediaFrame::Audio(AudioFrame {
                sample_rate: audio.sample_rate,
                channels: audio.channels,
                samples: chunk.to_vec().into(),
                timestamp: audio.timestamp + elapsed,
            }))
        })
        .collect()
}

impl FrameCodec for WireCodec {
    fn encode(&self, frame: &MediaFrame) -> Option<Bytes> {
        match frame {
            MediaFrame::Audio(audio) => encode_audio(audio),
            MediaFrame::Video(video) => encode_video(video),
        }
    }

    fn decode(&self, kind: TrackKind, payload: &[u8], timestamp: Duration) -> Option<MediaFrame> {
        match kind {
            TrackKind::Audio => decode_audio(payload, timestamp),
            TrackKind::Video => decode_video(payload, timestamp),
        }
    }
}

fn encode_audio(audio: &AudioFrame) -> Option<Bytes> {
    if audio.channels == 0 || audio.samples.len() > max_audio_samples(audio.channels) {
        return None;
    }
    let mut buf = BytesMut::with_capacity(AUDIO_HEADER + audio.samples.len() * 2);
    buf.put_u32(audio.sample_rate);
    buf.put_u16(audio.channels);
    for sample in audio.samples.iter() {
        buf.put_i16_le((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16);
    }
    Some(buf.freeze())
}

fn decode_audio(payload: &[u8], timestamp: Duration) -> Option<MediaFrame> {
    if payload.len() < AUDIO_HEADER || (payload.len() - AUDIO_HEADER) % 2 != 0 {
        return None;
    }
    let mut buf = payload;
    let sample_rate = buf.get_u32();
    let channels = buf.get_u16();
    if sample_rate == 0 || channels == 0 {
        return None;
    }
    let samples: Vec<f32> = buf
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / i16::MAX as f32)
        .collect();
    if samples.len() % channels as usize != 0 {
        return None;
    }
    Some(MediaFrame::Audio(AudioFrame {
        sample_rate,
        channels,
        samples: samples.into(),
        timestamp,
    }))
}

fn encode_video(video: &VideoFrame) -> Option<Bytes> {
    if !video.is_well_formed() || video.width == 0 || video.height == 0 {
        return None;
    }
    let rgb: Vec<u8> = video
        .rgba
        .chunks_exact(4)
        .flat_map(|px| [px[0], px[1], px[2]])
        .collect();
    let mut image = RgbImage::from_raw(video.width, video.height, rgb)?;
    loop {
        for quality in JPEG_QUALITIES {
            let mut jpeg = Vec::new();
            if let Err(e) = JpegEncoder::new_with_quality(&mut jpeg, quality).encode_image(&image) {
                debug!(error = %e, "jpeg encoding failed");
                return None;
            }
            if VIDEO_HEADER + jpeg.len() <= MAX_VIDEO_PAYLOAD {
                let mut buf = BytesMut::with_capacity(VIDEO_HEADER + jpeg.len());
                buf.put_u32(jpeg.len() as u32);
                buf.put_slice(&jpeg);
                return Some(buf.freeze());
            }
        }
        let (width, height) = (image.width() / 2, image.height() / 2);
        if width < MIN_DIMENSION || height < MIN_DIMENSION {
            debug!(width = video.width, height = video.height, "frame does not fit a payload");
            return None;
        }
        image = imageops::resize(&image, width, height, FilterType::Triangle);
    }
}

fn decode_video(payload: &[u8], timestamp: Duration) -> Option<MediaFrame> {
    if payload.len() < VIDEO_HEADER {
        return None;
    }
    let mut header = &payload[..VIDEO_HEADER];
    let len = header.get_u32() as usize;
    let jpeg = payload.get(VIDEO_HEADER..VIDEO_HEADER + len)?;
    let image = image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg)
        .ok()?
        .to_rgba8();
    let frame = VideoFrame::new(image.width(), image.height(), image.into_raw(), timestamp);
    frame.is_well_formed().then_some(MediaFrame::Video(frame))
}

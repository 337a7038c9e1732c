//! Virtual background: a fixed-rate frame loop that blurs the local camera or
//! draws it over a still image, publishing the result as a new camera track.
//!
//! There is no person segmentation. Image mode composites the whole frame
//! over the background, so only transparent pixels let the image through.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use image::imageops::{self, FilterType};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::BackgroundConfig;
use crate::error::{Error, Result};
use crate::media::{MediaFrame, MediaTrack, TrackPurpose, VideoFrame};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundMode {
    #[default]
    None,
    Blur,
    Image,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualBackgroundConfig {
    pub mode: BackgroundMode,
    /// 0 to 100; larger values are treated as 100.
    pub blur_intensity: u8,
    pub background_image: Option<PathBuf>,
}

impl VirtualBackgroundConfig {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn blur(intensity: u8) -> Self {
        Self {
            mode: BackgroundMode::Blur,
            blur_intensity: intensity,
            background_image: None,
        }
    }

    pub fn image(path: impl Into<PathBuf>) -> Self {
        Self {
            mode: BackgroundMode::Image,
            blur_intensity: 0,
            background_image: Some(path.into()),
        }
    }

    pub fn blur_radius(&self) -> u32 {
        u32::from(self.blur_intensity.min(100)) / 10
    }

    pub fn is_active(&self) -> bool {
        self.mode != BackgroundMode::None
    }
}

/// Spatial average over a `(2r+1)` square, as two one-dimensional passes.
pub fn box_blur(frame: &VideoFrame, radius: u32) -> VideoFrame {
    if radius == 0 || !frame.is_well_formed() || frame.width == 0 || frame.height == 0 {
        return frame.clone();
    }
    let (width, height) = (frame.width as usize, frame.height as usize);
    let mut horizontal = vec![0u8; frame.rgba.len()];
    blur_pass(&frame.rgba, &mut horizontal, width, height, radius as usize, true);
    let mut out = vec![0u8; frame.rgba.len()];
    blur_pass(&horizontal, &mut out, width, height, radius as usize, false);
    VideoFrame::new(frame.width, frame.height, out, frame.timestamp)
}

fn blur_pass(src: &[u8], dst: &mut [u8], width: usize, height: usize, radius: usize, rows: bool) {
    let (lines, len) = if rows { (height, width) } else { (width, height) };
    let offset = |line: usize, pos: usize| {
        if rows {
            (line * width + pos) * 4
        } else {
            (pos * width + line) * 4
        }
    };
    let window = (2 * radius + 1) as u32;
    let last = len - 1;

    for line in 0..lines {
        for channel in 0..4 {
            let mut sum: u32 = (0..=2 * radius)
                .map(|k| {
                    let pos = (k as isize - radius as isize).clamp(0, last as isize) as usize;
                    u32::from(src[offset(line, pos) + channel])
                })
                .sum();
            for pos in 0..len {
                dst[offset(line, pos) + channel] = ((sum + window / 2) / window) as u8;
                let incoming = (pos + radius + 1).min(last);
                let outgoing = pos.saturating_sub(radius);
                sum += u32::from(src[offset(line, incoming) + channel]);
                sum -= u32::from(src[offset(line, outgoing) + channel]);
            }
        }
    }
}

/// Draw `frame` over `background` using the frame's alpha. Both must share dimensions.
pub fn composite_over(frame: &VideoFrame, background: &RgbaImage) -> VideoFrame {
    if !frame.is_well_formed() || background.dimensions() != (frame.width, frame.height) {
        return frame.clone();
    }
    let mut out = Vec::with_capacity(frame.rgba.len());
    for (fg, bg) in frame.rgba.chunks_exact(4).zip(background.as_raw().chunks_exact(4)) {
        let alpha = u32::from(fg[3]);
        for channel in 0..3 {
            let blended =
                u32::from(fg[channel]) * alpha + u32::from(bg[channel]) * (255 - alpha);
            out.push(((blended + 127) / 255) as u8);
        }
        out.push(255);
    }
    VideoFrame::new(frame.width, frame.height, out, frame.timestamp)
}

pub fn load_background(path: &Path) -> Result<RgbaImage> {
    let decoded = image::open(path)
        .map_err(|e| Error::media(format!("cannot load background {}: {}", path.display(), e)))?;
    Ok(decoded.to_rgba8())
}

/// The decoded background plus its most recent resize.
struct BackgroundImage {
    original: RgbaImage,
    fitted: Option<RgbaImage>,
}

impl BackgroundImage {
    fn new(original: RgbaImage) -> Self {
        Self {
            original,
            fitted: None,
        }
    }

    fn fitted(&mut self, width: u32, height: u32) -> &RgbaImage {
        let stale = self
            .fitted
            .as_ref()
            .map_or(true, |img| img.dimensions() != (width, height));
        if stale {
            debug!(width, height, "resizing background image");
            self.fitted = Some(imageops::resize(
                &self.original,
                width,
                height,
                FilterType::Triangle,
            ));
        }
        self.fitted.get_or_insert_with(|| RgbaImage::new(width, height))
    }
}

struct Pipeline {
    config: VirtualBackgroundConfig,
    image: Option<BackgroundImage>,
}

impl Pipeline {
    fn apply(&mut self, frame: &VideoFrame) -> VideoFrame {
        match self.config.mode {
            BackgroundMode::None => frame.clone(),
            BackgroundMode::Blur => box_blur(frame, self.config.blur_radius()),
            BackgroundMode::Image => match self.image.as_mut() {
                Some(image) => composite_over(frame, image.fitted(frame.width, frame.height)),
                None => frame.clone(),
            },
        }
    }
}

/// Owns the frame loop. Reads the local camera, never mutates it.
pub struct VirtualBackgroundProcessor {
    frame_rate: u32,
    pipeline: Arc<Mutex<Pipeline>>,
    source: Arc<Mutex<Option<MediaTrack>>>,
    output: Option<MediaTrack>,
    task: Option<JoinHandle<()>>,
}

impl VirtualBackgroundProcessor {
    pub fn new(config: &BackgroundConfig) -> Self {
        Self {
            frame_rate: config.frame_rate.max(1),
            pipeline: Arc::new(Mutex::new(Pipeline {
                config: VirtualBackgroundConfig::default(),
                image: None,
            })),
            source: Arc::new(Mutex::new(None)),
            output: None,
            task: None,
        }
    }

    pub fn config(&self) -> VirtualBackgroundConfig {
        lock(&self.pipeline).config.clone()
    }

    /// Switch mode live. Image mode decodes the background before anything changes.
    pub fn set_config(&mut self, config: VirtualBackgroundConfig) -> Result<()> {
        let image = match (config.mode, config.background_image.as_deref()) {
            (BackgroundMode::Image, Some(path)) => Some(BackgroundImage::new(load_background(path)?)),
            (BackgroundMode::Image, None) => {
                return Err(Error::media("image mode needs a background image"));
            }
            _ => None,
        };
        let mut pipeline = lock(&self.pipeline);
        info!(mode = ?config.mode, radius = config.blur_radius(), "virtual background configured");
        pipeline.config = config;
        pipeline.image = image;
        Ok(())
    }

    /// Start the frame loop over `source`, or return the running output.
    pub fn start(&mut self, source: &MediaTrack) -> MediaTrack {
        *lock(&self.source) = Some(source.clone());
        if let (Some(output), Some(task)) = (&self.output, &self.task) {
            if !output.is_ended() && !task.is_finished() {
                return output.clone();
            }
        }

        let output = MediaTrack::local(
            TrackPurpose::Camera,
            format!("{} (background)", source.label()),
            source.stream_id(),
            source.device_id().map(str::to_string),
        );
        if let Some(constraints) = source.constraints() {
            output.apply_constraints(constraints);
        }
        let period = Duration::from_secs_f64(1.0 / self.frame_rate as f64);
        self.task = Some(tokio::spawn(render_loop(
            self.pipeline.clone(),
            self.source.clone(),
            output.clone(),
            period,
        )));
        info!(source = %source.id(), output = %output.id(), fps = self.frame_rate, "virtual background started");
        self.output = Some(output.clone());
        output
    }

    /// Re-point the loop after the camera changed.
    pub fn set_source(&mut self, source: &MediaTrack) {
        if let Some(constraints) = source.constraints() {
            if let Some(output) = &self.output {
                output.apply_constraints(constraints);
            }
        }
        *lock(&self.source) = Some(source.clone());
    }

    pub fn source(&self) -> Option<MediaTrack> {
        lock(&self.source).clone()
    }

    /// Stop the loop and end the output track. Returns `false` if it was not running.
    pub fn stop(&mut self) -> bool {
        let Some(task) = self.task.take() else {
            return false;
        };
        task.abort();
        if let Some(output) = self.output.take() {
            output.stop();
        }
        lock(&self.source).take();
        info!("virtual background stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn output(&self) -> Option<&MediaTrack> {
        self.output.as_ref()
    }

    /// Run the current transform on one frame outside the loop.
    pub fn process(&self, frame: &VideoFrame) -> VideoFrame {
        lock(&self.pipeline).apply(frame)
    }
}

impl Drop for VirtualBackgroundProcessor {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn render_loop(
    pipeline: Arc<Mutex<Pipeline>>,
    source: Arc<Mutex<Option<MediaTrack>>>,
    output: MediaTrack,
    period: Duration,
) {
    let started = Instant::now();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Source id and timestamp of the last processed frame, with the result.
    let mut cached: Option<(String, Duration, VideoFrame)> = None;

    loop {
        tokio::select! {
            _ = output.ended() => break,
            _ = ticker.tick() => {}
        }
        let Some(input) = lock(&source).clone() else {
            continue;
        };
        let frame = match input.latest_frame() {
            Some(MediaFrame::Video(frame)) => frame,
            Some(MediaFrame::Audio(_)) => {
                warn!(track = %input.id(), "background source is not a video track");
                continue;
            }
            None => continue,
        };

        let fresh = cached
            .as_ref()
            .map_or(true, |(id, ts, _)| id != input.id() || *ts != frame.timestamp);
        if fresh {
            let processed = lock(&pipeline).apply(&frame);
            cached = Some((input.id().to_string(), frame.timestamp, processed));
        }
        if let Some((_, _, processed)) = &cached {
            let mut out = processed.clone();
            out.timestamp = started.elapsed();
            output.push(MediaFrame::Video(out));
        }
    }
    debug!(output = %output.id(), "background frame loop finished");
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn solid(width: u32, height: u32, px: [u8; 4]) -> VideoFrame {
        let rgba: Vec<u8> = (0..width * height).flat_map(|_| px).collect();
        VideoFrame::new(width, height, rgba, Duration::ZERO)
    }

    fn pixel(frame: &VideoFrame, x: u32, y: u32) -> [u8; 4] {
        let i = ((y * frame.width + x) * 4) as usize;
        [frame.rgba[i], frame.rgba[i + 1], frame.rgba[i + 2], frame.rgba[i + 3]]
    }

    #[test]
    fn test_blur_radius_scales_with_intensity() {
        assert_eq!(VirtualBackgroundConfig::blur(0).blur_radius(), 0);
        assert_eq!(VirtualBackgroundConfig::blur(55).blur_radius(), 5);
        assert_eq!(VirtualBackgroundConfig::blur(100).blur_radius(), 10);
        assert_eq!(VirtualBackgroundConfig::blur(250).blur_radius(), 10);
    }

    #[test]
    fn test_blur_keeps_uniform_frames_and_spreads_points() {
        let grey = solid(9, 7, [90, 90, 90, 255]);
        assert_eq!(box_blur(&grey, 2).rgba, grey.rgba);

        let mut dot = solid(9, 9, [0, 0, 0, 255]);
        let mut rgba = dot.rgba.to_vec();
        let centre = ((4 * 9 + 4) * 4) as usize;
        rgba[centre] = 255;
        dot.rgba = rgba.into();

        let blurred = box_blur(&dot, 1);
        // 255 averaged over a 3x3 window, rounded.
        assert_eq!(pixel(&blurred, 4, 4)[0], 28);
        assert_eq!(pixel(&blurred, 3, 3)[0], 28);
        assert_eq!(pixel(&blurred, 2, 2)[0], 0);
        assert_eq!(pixel(&blurred, 4, 4)[3], 255);
    }

    #[test]
    fn test_composite_shows_background_only_through_transparency() {
        let background = RgbaImage::from_pixel(2, 1, Rgba([0, 200, 0, 255]));
        let mut frame = solid(2, 1, [200, 0, 0, 255]);
        let mut rgba = frame.rgba.to_vec();
        rgba[7] = 0;
        frame.rgba = rgba.into();

        let out = composite_over(&frame, &background);
        assert_eq!(pixel(&out, 0, 0), [200, 0, 0, 255]);
        assert_eq!(pixel(&out, 1, 0), [0, 200, 0, 255]);
    }

    #[test]
    fn test_image_mode_requires_a_loadable_image() {
        let mut processor = VirtualBackgroundProcessor::new(&BackgroundConfig::default());
        let missing = VirtualBackgroundConfig {
            mode: BackgroundMode::Image,
            ..Default::default()
        };
        assert!(processor.set_config(missing).is_err());
        assert!(processor
            .set_config(VirtualBackgroundConfig::image("/nonexistent/bg.png"))
            .is_err());
        assert_eq!(processor.config().mode, BackgroundMode::None);

        let path = std::env::temp_dir().join(format!("meshmeet-bg-{}.png", uuid::Uuid::new_v4()));
        RgbaImage::from_pixel(4, 4, Rgba([1, 2, 3, 255]))
            .save(&path)
            .unwrap();
        processor
            .set_config(VirtualBackgroundConfig::image(&path))
            .unwrap();
        assert_eq!(processor.config().mode, BackgroundMode::Image);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_ends_output() {
        let mut processor = VirtualBackgroundProcessor::new(&BackgroundConfig { frame_rate: 100 });
        processor.set_config(VirtualBackgroundConfig::blur(30)).unwrap();

        let camera = MediaTrack::local(TrackPurpose::Camera, "cam", "local", None);
        camera.push(MediaFrame::Video(solid(8, 8, [10, 20, 30, 255])));

        let output = processor.start(&camera);
        assert_eq!(processor.start(&camera), output);
        assert_eq!(output.stream_id(), camera.stream_id());
        assert_eq!(output.purpose(), TrackPurpose::Camera);

        let mut frames = output.subscribe();
        match frames.recv().await.unwrap() {
            MediaFrame::Video(frame) => assert_eq!(pixel(&frame, 3, 3), [10, 20, 30, 255]),
            MediaFrame::Audio(_) => panic!("unexpected audio"),
        }

        assert!(processor.stop());
        assert!(!processor.stop());
        assert!(output.is_ended());
        assert!(!camera.is_ended());
        assert!(!processor.is_running());
    }
}

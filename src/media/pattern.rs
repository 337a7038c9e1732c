//! Synthetic video source used when no platform camera or display capture is wired in.

use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::debug;

use super::track::{MediaFrame, MediaTrack, VideoConstraints, VideoFrame};

const FALLBACK: VideoConstraints = VideoConstraints::new(640, 360, 15);

/// Render a moving gradient into `track` until it ends, following its constraints.
pub fn spawn_test_pattern(track: MediaTrack, seed: u8) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        let mut tick: u32 = 0;
        loop {
            let constraints = track.constraints().unwrap_or(FALLBACK);
            let period = Duration::from_secs_f64(1.0 / constraints.frame_rate.max(1) as f64);
            tokio::select! {
                _ = track.ended() => break,
                _ = tokio::time::sleep(period) => {}
            }
            let frame = render(constraints.width, constraints.height, tick, seed);
            track.push(MediaFrame::Video(VideoFrame::new(
                constraints.width,
                constraints.height,
                frame,
                started.elapsed(),
            )));
            tick = tick.wrapping_add(1);
        }
        debug!(track = %track.id(), "test pattern stopped");
    })
}

pub(crate) fn render(width: u32, height: u32, tick: u32, seed: u8) -> Vec<u8> {
    let mut rgba = Vec::with_capacity((width * height * 4) as usize);
    let shift = (tick % 256) as u8;
    for y in 0..height {
        for x in 0..width {
            let r = ((x * 255) / width.max(1)) as u8;
            let g = ((y * 255) / height.max(1)) as u8;
            rgba.push(r.wrapping_add(shift));
            rgba.push(g.wrapping_add(seed));
            rgba.push(seed.wrapping_mul(3).wrapping_add(shift / 2));
            rgba.push(255);
        }
    }
    rgba
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackPurpose;

    #[test]
    fn test_render_size_and_opacity() {
        let frame = render(8, 4, 3, 7);
        assert_eq!(frame.len(), 8 * 4 * 4);
        assert!(frame.chunks_exact(4).all(|px| px[3] == 255));
    }

    #[tokio::test]
    async fn test_pattern_follows_constraints_and_stops() {
        let track = MediaTrack::local(TrackPurpose::Camera, "pattern", "s", None);
        track.apply_constraints(VideoConstraints::new(16, 8, 100));
        let mut rx = track.subscribe();
        let handle = spawn_test_pattern(track.clone(), 1);

        match rx.recv().await.unwrap() {
            MediaFrame::Video(frame) => {
                assert_eq!((frame.width, frame.height), (16, 8));
                assert!(frame.is_well_formed());
            }
            MediaFrame::Audio(_) => panic!("pattern produced audio"),
        }

        track.stop();
        handle.await.unwrap();
    }
}

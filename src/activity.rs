//! Active-speaker detection from per-stream spectral levels.

use std::collections::{HashMap, VecDeque};
use std::f32::consts::PI;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::SpeakingConfig;
use crate::media::{MediaFrame, MediaTrack, TrackKind};
use crate::room::ParticipantId;

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

/// Windowed FFT over the most recent `size` samples, reduced to one 0-255 level.
pub struct FrequencyAnalyser {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    smoothing: f32,
    smoothed: Vec<f32>,
    samples: VecDeque<f32>,
    scratch: Vec<Complex<f32>>,
}

impl FrequencyAnalyser {
    pub fn new(size: usize, smoothing: f32) -> Self {
        let fft = FftPlanner::new().plan_fft_forward(size);
        Self {
            fft,
            window: blackman(size),
            smoothing: smoothing.clamp(0.0, 1.0),
            smoothed: vec![0.0; size / 2],
            samples: VecDeque::with_capacity(size),
            scratch: vec![Complex::default(); size],
        }
    }

    pub fn size(&self) -> usize {
        self.window.len()
    }

    pub fn push_samples(&mut self, samples: impl IntoIterator<Item = f32>) {
        let size = self.size();
        for sample in samples {
            if self.samples.len() == size {
                self.samples.pop_front();
            }
            self.samples.push_back(sample);
        }
    }

    /// Mean of the byte-scaled spectrum. Missing samples count as silence.
    pub fn level(&mut self) -> u8 {
        let size = self.size();
        let padding = size - self.samples.len();
        for (i, slot) in self.scratch.iter_mut().enumerate() {
            let sample = if i < padding {
                0.0
            } else {
                self.samples[i - padding]
            };
            *slot = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.scratch);

        let mut total: u32 = 0;
        for (bin, smoothed) in self.smoothed.iter_mut().enumerate() {
            let magnitude = self.scratch[bin].norm() / size as f32;
            *smoothed = self.smoothing * *smoothed + (1.0 - self.smoothing) * magnitude;
            total += to_byte(*smoothed) as u32;
        }
        (total / self.smoothed.len().max(1) as u32) as u8
    }
}

fn blackman(size: usize) -> Vec<f32> {
    let n = size.max(2) as f32;
    (0..size)
        .map(|i| {
            let x = i as f32 / (n - 1.0);
            0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
        })
        .collect()
}

fn to_byte(magnitude: f32) -> u8 {
    if magnitude <= 0.0 {
        return 0;
    }
    let db = 20.0 * magnitude.log10();
    let scaled = (db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS) * 255.0;
    scaled.clamp(0.0, 255.0) as u8
}

/// Speaking state with a hysteresis band between `release` and `activation`.
#[derive(Debug, Clone)]
pub struct SpeakingTracker {
    activation: u8,
    release: u8,
    hold: Duration,
    speaker: Option<ParticipantId>,
    quiet_since: Option<Instant>,
}

impl SpeakingTracker {
    pub fn new(activation: u8, release: u8, hold: Duration) -> Self {
        Self {
            activation,
            release,
            hold,
            speaker: None,
            quiet_since: None,
        }
    }

    pub fn speaker(&self) -> Option<&ParticipantId> {
        self.speaker.as_ref()
    }

    /// Feed one check's levels. Returns `true` when the active speaker changed.
    pub fn update<'a>(
        &mut self,
        levels: impl IntoIterator<Item = (&'a ParticipantId, u8)>,
        now: Instant,
    ) -> bool {
        let loudest = levels
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)));
        let peak = loudest.map(|(_, level)| level).unwrap_or(0);

        if let Some((id, level)) = loudest.filter(|(_, level)| *level > self.activation) {
            self.quiet_since = None;
            if self.speaker.as_ref() != Some(id) {
                debug!(participant = %id, level, "active speaker");
                self.speaker = Some(id.clone());
                return true;
            }
            return false;
        }

        if peak >= self.release {
            self.quiet_since = None;
            return false;
        }

        let since = *self.quiet_since.get_or_insert(now);
        if self.speaker.is_some() && now.duration_since(since) >= self.hold {
            self.speaker = None;
            return true;
        }
        false
    }

    pub fn forget(&mut self, id: &ParticipantId) -> bool {
        if self.speaker.as_ref() == Some(id) {
            self.speaker = None;
            self.quiet_since = None;
            return true;
        }
        false
    }
}

struct Analysis {
    track_id: String,
    task: JoinHandle<()>,
}

/// One analyser task per tracked audio stream, sampled by periodic `check`s.
pub struct AudioActivityDetector {
    config: SpeakingConfig,
    levels: Arc<Mutex<HashMap<ParticipantId, u8>>>,
    analyses: HashMap<ParticipantId, Analysis>,
    tracker: SpeakingTracker,
}

impl AudioActivityDetector {
    pub fn new(config: SpeakingConfig) -> Self {
        let tracker = SpeakingTracker::new(
            config.activation_threshold,
            config.release_threshold,
            Duration::from_millis(config.check_interval_ms),
        );
        Self {
            config,
            levels: Arc::new(Mutex::new(HashMap::new())),
            analyses: HashMap::new(),
            tracker,
        }
    }

    /// Start analysing `track` for `participant`, replacing any earlier stream of theirs.
    pub fn track(&mut self, participant: &ParticipantId, track: &MediaTrack) {
        if track.kind() != TrackKind::Audio {
            return;
        }
        if let Some(existing) = self.analyses.get(participant) {
            if existing.track_id == track.id() {
                return;
            }
        }
        self.untrack_stream(participant);

        let task = tokio::spawn(analyse(
            participant.clone(),
            track.clone(),
            self.levels.clone(),
            FrequencyAnalyser::new(self.config.fft_size, self.config.smoothing),
        ));
        self.analyses.insert(
            participant.clone(),
            Analysis {
                track_id: track.id().to_string(),
                task,
            },
        );
    }

    /// Stop analysing `participant`. Returns `true` if they were the active speaker.
    pub fn untrack(&mut self, participant: &ParticipantId) -> bool {
        self.untrack_stream(participant);
        self.tracker.forget(participant)
    }

    fn untrack_stream(&mut self, participant: &ParticipantId) {
        if let Some(analysis) = self.analyses.remove(participant) {
            analysis.task.abort();
        }
        lock(&self.levels).remove(participant);
    }

    pub fn is_tracking(&self, participant: &ParticipantId) -> bool {
        self.analyses.contains_key(participant)
    }

    pub fn level(&self, participant: &ParticipantId) -> Option<u8> {
        lock(&self.levels).get(participant).copied()
    }

    /// Run one speaking check. Returns `true` when the active speaker changed.
    pub fn check(&mut self, now: Instant) -> bool {
        let levels = lock(&self.levels).clone();
        self.tracker
            .update(levels.iter().map(|(id, level)| (id, *level)), now)
    }

    pub fn active_speaker(&self) -> Option<&ParticipantId> {
        self.tracker.speaker()
    }

    pub fn stop(&mut self) {
        for (_, analysis) in self.analyses.drain() {
            analysis.task.abort();
        }
        lock(&self.levels).clear();
    }
}

impl Drop for AudioActivityDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn analyse(
    participant: ParticipantId,
    track: MediaTrack,
    levels: Arc<Mutex<HashMap<ParticipantId, u8>>>,
    mut analyser: FrequencyAnalyser,
) {
    let mut frames = track.subscribe();
    loop {
        let frame = tokio::select! {
            _ = track.ended() => break,
            frame = frames.recv() => frame,
        };
        match frame {
            Ok(MediaFrame::Audio(audio)) => {
                analyser.push_samples(audio.mono());
                let level = analyser.level();
                lock(&levels).insert(participant.clone(), level);
            }
            Ok(MediaFrame::Video(_)) => {}
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }
    lock(&levels).remove(&participant);
    info!(participant = %participant, track = %track.id(), "audio analysis stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{AudioFrame, TrackPurpose};
    use rand::Rng;

    fn noise(len: usize, amplitude: f32) -> Vec<f32> {
        let mut rng = rand::thread_rng();
        (0..len)
            .map(|_| rng.gen_range(-amplitude..=amplitude))
            .collect()
    }

    #[test]
    fn test_noise_is_loud_and_silence_is_zero() {
        let mut loud = FrequencyAnalyser::new(256, 0.8);
        loud.push_samples(noise(256, 0.5));
        let mut level = 0;
        for _ in 0..5 {
            level = loud.level();
        }
        assert!(level > 30, "noise level was {}", level);

        let mut quiet = FrequencyAnalyser::new(256, 0.8);
        quiet.push_samples(vec![0.0; 256]);
        assert_eq!(quiet.level(), 0);
    }

    #[test]
    fn test_window_tapers_to_zero() {
        let window = blackman(256);
        assert!(window[0].abs() < 1e-4);
        assert!(window[255].abs() < 1e-4);
        assert!(window[128] > 0.99);
    }

    #[test]
    fn test_speaking_survives_the_hysteresis_band() {
        let a = ParticipantId::from("a");
        let b = ParticipantId::from("b");
        let hold = Duration::from_millis(500);
        let mut tracker = SpeakingTracker::new(30, 20, hold);
        let t0 = Instant::now();

        assert!(tracker.update([(&a, 45), (&b, 10)], t0));
        assert_eq!(tracker.speaker(), Some(&a));

        // Inside the band: nobody speaking, but nothing clears either.
        assert!(!tracker.update([(&a, 25), (&b, 10)], t0 + hold));
        assert!(!tracker.update([(&a, 22), (&b, 10)], t0 + hold * 4));
        assert_eq!(tracker.speaker(), Some(&a));

        // Quiet, but not yet for a full interval.
        assert!(!tracker.update([(&a, 5), (&b, 5)], t0 + hold * 5));
        assert!(!tracker.update([(&a, 5), (&b, 25)], t0 + hold * 6));
        assert!(!tracker.update([(&a, 5), (&b, 5)], t0 + hold * 7));
        assert_eq!(tracker.speaker(), Some(&a));

        assert!(tracker.update([(&a, 5), (&b, 5)], t0 + hold * 8));
        assert_eq!(tracker.speaker(), None);
    }

    #[test]
    fn test_loudest_stream_takes_over() {
        let a = ParticipantId::from("a");
        let b = ParticipantId::from("b");
        let mut tracker = SpeakingTracker::new(30, 20, Duration::from_millis(500));
        let now = Instant::now();
        tracker.update([(&a, 40), (&b, 35)], now);
        assert_eq!(tracker.speaker(), Some(&a));
        assert!(tracker.update([(&a, 31), (&b, 90)], now));
        assert_eq!(tracker.speaker(), Some(&b));
        assert!(tracker.forget(&b));
        assert_eq!(tracker.speaker(), None);
    }

    #[tokio::test]
    async fn test_detector_follows_track_levels() {
        let mut detector = AudioActivityDetector::new(SpeakingConfig::default());
        let id = ParticipantId::from("remote");
        let track = MediaTrack::remote(TrackKind::Audio, "mic", "s");
        detector.track(&id, &track);
        tokio::task::yield_now().await;

        for i in 0..4 {
            track.push(MediaFrame::Audio(AudioFrame {
                sample_rate: 48_000,
                channels: 1,
                samples: noise(480, 0.5).into(),
                timestamp: Duration::from_millis(i * 10),
            }));
        }
        for _ in 0..50 {
            if detector.level(&id).is_some_and(|l| l > 30) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(detector.check(Instant::now()));
        assert_eq!(detector.active_speaker(), Some(&id));

        let video = MediaTrack::local(TrackPurpose::Camera, "cam", "s", None);
        detector.track(&ParticipantId::from("other"), &video);
        assert!(!detector.is_tracking(&ParticipantId::from("other")));

        assert!(detector.untrack(&id));
        assert!(detector.level(&id).is_none());
    }
}

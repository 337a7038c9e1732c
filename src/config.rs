use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::media::VideoConstraints;

/// One STUN or TURN entry handed to the ICE agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 16_000,
        }
    }
}

impl ReconnectPolicy {
    /// Backoff before retry `attempt` (1-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureProfile {
    pub ideal: VideoConstraints,
    pub medium: VideoConstraints,
    pub low: VideoConstraints,
}

impl Default for CaptureProfile {
    fn default() -> Self {
        Self {
            ideal: VideoConstraints::new(1280, 720, 30),
            medium: VideoConstraints::new(960, 540, 24),
            low: VideoConstraints::new(640, 360, 15),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub sample_interval_ms: u64,
    /// Consecutive readings of the same extreme class required before capture is adapted.
    pub dwell_samples: u32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 5000,
            dwell_samples: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeakingConfig {
    pub activation_threshold: u8,
    pub release_threshold: u8,
    pub check_interval_ms: u64,
    pub fft_size: usize,
    pub smoothing: f32,
}

impl Default for SpeakingConfig {
    fn default() -> Self {
        Self {
            activation_threshold: 30,
            release_threshold: 20,
            check_interval_ms: 500,
            fft_size: 256,
            smoothing: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    pub frame_rate: u32,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self { frame_rate: 30 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub endpoint: Option<String>,
    /// A recording larger than this is discarded rather than uploaded.
    pub max_recording_mb: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            max_recording_mb: 512,
        }
    }
}

impl UploadConfig {
    pub fn max_recording_bytes(&self) -> usize {
        self.max_recording_mb.saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub signaling_url: String,
    pub ice_servers: Vec<IceServerConfig>,
    pub reconnect: ReconnectPolicy,
    pub capture: CaptureProfile,
    pub quality: QualityConfig,
    pub speaking: SpeakingConfig,
    pub background: BackgroundConfig,
    pub upload: UploadConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:8080/ws".to_string(),
            ice_servers: vec![IceServerConfig::stun("stun:stun.l.google.com:19302")],
            reconnect: ReconnectPolicy::default(),
            capture: CaptureProfile::default(),
            quality: QualityConfig::default(),
            speaking: SpeakingConfig::default(),
            background: BackgroundConfig::default(),
            upload: UploadConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.signaling_url.trim().is_empty() {
            return Err(Error::config("signaling_url must not be empty"));
        }
        if !self.speaking.fft_size.is_power_of_two() || self.speaking.fft_size < 32 {
            return Err(Error::config(format!(
                "speaking.fft_size must be a power of two >= 32, got {}",
                self.speaking.fft_size
            )));
        }
        if self.speaking.release_threshold >= self.speaking.activation_threshold {
            return Err(Error::config(
                "speaking.release_threshold must be below activation_threshold",
            ));
        }
        if self.upload.max_recording_mb == 0 {
            return Err(Error::config("upload.max_recording_mb must be positive"));
        }
        if self.background.frame_rate == 0 {
            return Err(Error::config("background.frame_rate must be positive"));
        }
        if self.quality.sample_interval_ms == 0 || self.speaking.check_interval_ms == 0 {
            return Err(Error::config("sampling intervals must be positive"));
        }
        if !self.ice_servers.iter().any(IceServerConfig::is_turn) {
            warn!("no TURN server configured; peers behind symmetric NATs will fail to connect");
        }
        Ok(())
    }

    pub fn quality_interval(&self) -> Duration {
        Duration::from_millis(self.quality.sample_interval_ms)
    }

    pub fn speaking_interval(&self) -> Duration {
        Duration::from_millis(self.speaking.check_interval_ms)
    }
}

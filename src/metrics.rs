use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::{CaptureProfile, QualityConfig};
use crate::media::VideoConstraints;
use crate::room::ParticipantId;

/// One link's view of the network. A metric the transport cannot report yet is `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkStats {
    pub bandwidth_bps: Option<f64>,
    pub rtt_ms: Option<f64>,
    pub packet_loss_percent: Option<f64>,
}

impl LinkStats {
    pub fn is_empty(&self) -> bool {
        self.bandwidth_bps.is_none() && self.rtt_ms.is_none() && self.packet_loss_percent.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityClass {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl fmt::Display for QualityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityClass::Poor => write!(f, "poor"),
            QualityClass::Fair => write!(f, "fair"),
            QualityClass::Good => write!(f, "good"),
            QualityClass::Excellent => write!(f, "excellent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkQualityReading {
    pub bandwidth_estimate_bps: Option<f64>,
    pub round_trip_latency_ms: Option<f64>,
    pub packet_loss_percent: Option<f64>,
    pub quality_class: QualityClass,
    /// Links that contributed at least one metric.
    pub links: usize,
}

/// Per-metric arithmetic mean over the links that report it.
pub fn aggregate<'a>(samples: impl IntoIterator<Item = &'a LinkStats>) -> Option<LinkStats> {
    let mut bandwidth = Mean::default();
    let mut rtt = Mean::default();
    let mut loss = Mean::default();
    for stats in samples {
        bandwidth.add(stats.bandwidth_bps);
        rtt.add(stats.rtt_ms);
        loss.add(stats.packet_loss_percent);
    }
    let aggregated = LinkStats {
        bandwidth_bps: bandwidth.value(),
        rtt_ms: rtt.value(),
        packet_loss_percent: loss.value(),
    };
    (!aggregated.is_empty()).then_some(aggregated)
}

#[derive(Default)]
struct Mean {
    sum: f64,
    count: usize,
}

impl Mean {
    fn add(&mut self, value: Option<f64>) {
        if let Some(v) = value.filter(|v| v.is_finite()) {
            self.sum += v;
            self.count += 1;
        }
    }

    fn value(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Any single bad metric is enough to drop the class. Missing metrics never do.
pub fn classify(stats: &LinkStats) -> QualityClass {
    let rtt = stats.rtt_ms.unwrap_or(0.0);
    let loss = stats.packet_loss_percent.unwrap_or(0.0);
    let bandwidth = stats.bandwidth_bps.unwrap_or(f64::INFINITY);

    if rtt > 300.0 || loss > 5.0 || bandwidth < 100_000.0 {
        QualityClass::Poor
    } else if rtt > 200.0 || loss > 3.0 || bandwidth < 500_000.0 {
        QualityClass::Fair
    } else if rtt > 100.0 || loss > 1.0 || bandwidth < 1_000_000.0 {
        QualityClass::Good
    } else {
        QualityClass::Excellent
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    Low,
    Medium,
    Ideal,
}

impl QualityLevel {
    pub fn constraints(&self, profile: &CaptureProfile) -> VideoConstraints {
        match self {
            QualityLevel::Ideal => profile.ideal,
            QualityLevel::Medium => profile.medium,
            QualityLevel::Low => profile.low,
        }
    }

    fn lower(self) -> Self {
        match self {
            QualityLevel::Ideal => QualityLevel::Medium,
            _ => QualityLevel::Low,
        }
    }

    fn higher(self) -> Self {
        match self {
            QualityLevel::Low => QualityLevel::Medium,
            _ => QualityLevel::Ideal,
        }
    }
}

/// Steps the capture level one notch at a time, and only after the same
/// extreme class has been seen `dwell` times in a row.
#[derive(Debug, Clone)]
pub struct QualityAdapter {
    level: QualityLevel,
    dwell: u32,
    poor_streak: u32,
    excellent_streak: u32,
}

impl QualityAdapter {
    pub fn new(dwell: u32) -> Self {
        Self {
            level: QualityLevel::Ideal,
            dwell: dwell.max(1),
            poor_streak: 0,
            excellent_streak: 0,
        }
    }

    pub fn level(&self) -> QualityLevel {
        self.level
    }

    /// Returns the new level when this reading moved it.
    pub fn observe(&mut self, class: QualityClass) -> Option<QualityLevel> {
        match class {
            QualityClass::Poor => {
                self.poor_streak += 1;
                self.excellent_streak = 0;
            }
            QualityClass::Excellent => {
                self.excellent_streak += 1;
                self.poor_streak = 0;
            }
            QualityClass::Fair | QualityClass::Good => {
                self.poor_streak = 0;
                self.excellent_streak = 0;
            }
        }

        let next = if self.poor_streak >= self.dwell {
            self.poor_streak = 0;
            self.level.lower()
        } else if self.excellent_streak >= self.dwell {
            self.excellent_streak = 0;
            self.level.higher()
        } else {
            return None;
        };

        if next == self.level {
            return None;
        }
        self.level = next;
        Some(next)
    }
}

/// Turns periodic per-link statistics into readings and capture adjustments.
pub struct NetworkQualityMonitor {
    profile: CaptureProfile,
    adapter: QualityAdapter,
    readings: watch::Sender<Option<NetworkQualityReading>>,
}

impl NetworkQualityMonitor {
    pub fn new(profile: CaptureProfile, config: &QualityConfig) -> Self {
        let (readings, _) = watch::channel(None);
        Self {
            profile,
            adapter: QualityAdapter::new(config.dwell_samples),
            readings,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<NetworkQualityReading>> {
        self.readings.subscribe()
    }

    pub fn latest(&self) -> Option<NetworkQualityReading> {
        self.readings.borrow().clone()
    }

    pub fn level(&self) -> QualityLevel {
        self.adapter.level()
    }

    /// Fold one sampling round in. Returns the reading, plus new capture
    /// constraints when the adapter changed level.
    pub fn record(
        &mut self,
        samples: &[(ParticipantId, LinkStats)],
    ) -> Option<(NetworkQualityReading, Option<VideoConstraints>)> {
        let reporting: Vec<&LinkStats> = samples
            .iter()
            .map(|(_, stats)| stats)
            .filter(|stats| !stats.is_empty())
            .collect();
        let aggregated = match aggregate(reporting.iter().copied()) {
            Some(aggregated) => aggregated,
            None => {
                debug!(links = samples.len(), "no link reported usable statistics");
                return None;
            }
        };

        let reading = NetworkQualityReading {
            bandwidth_estimate_bps: aggregated.bandwidth_bps,
            round_trip_latency_ms: aggregated.rtt_ms,
            packet_loss_percent: aggregated.packet_loss_percent,
            quality_class: classify(&aggregated),
            links: reporting.len(),
        };
        self.readings.send_replace(Some(reading.clone()));

        let adapted = self.adapter.observe(reading.quality_class).map(|level| {
            let constraints = level.constraints(&self.profile);
            info!(?level, class = %reading.quality_class, ?constraints, "adapting capture to network quality");
            constraints
        });
        Some((reading, adapted))
    }
}

//! Rolling-window spike detection over memory samples.
//!
//! A spike is a sudden heap jump between consecutive samples. Detected
//! spikes land in a capped log and are marked resolved once usage recedes
//! below the pre-spike baseline within a timeout window; spikes that never
//! recede stay unresolved for alerting.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SpikeConfig;
use crate::sampler::MemorySample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SpikeSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySpike {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub severity: SpikeSeverity,
    /// Heap growth between the two samples that formed the spike
    pub delta_bytes: u64,
    /// Heap usage at the moment of the spike
    pub total_bytes: u64,
    /// Pre-spike heap usage; receding below this resolves the spike
    pub baseline_bytes: u64,
    pub resolved: bool,
    pub resolution_method: Option<String>,
}

/// Aggregate view over the spike log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpikeStatistics {
    pub total_detected: u64,
    pub unresolved: usize,
    pub low: usize,
    pub medium: usize,
    pub high: usize,
    pub critical: usize,
    pub max_delta_bytes: u64,
    pub last_spike_at: Option<DateTime<Utc>>,
}

pub struct MemorySpikeDetector {
    config: SpikeConfig,
    window: VecDeque<MemorySample>,
    spikes: VecDeque<MemorySpike>,
    total_detected: u64,
}

impl MemorySpikeDetector {
    pub fn new(config: SpikeConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window),
            spikes: VecDeque::with_capacity(config.log_cap),
            config,
            total_detected: 0,
        }
    }

    /// Feed the next sample. Returns the spike created by this sample,
    /// if its delta crossed the threshold.
    pub fn record(&mut self, sample: MemorySample) -> Option<MemorySpike> {
        self.try_resolve(&sample);

        let baseline = self.window.back().map(|previous| previous.heap_used);
        let spike = baseline.and_then(|baseline| {
            let delta = sample.heap_used.saturating_sub(baseline);
            if delta >= self.config.threshold_bytes {
                Some(self.register_spike(delta, baseline, &sample))
            } else {
                None
            }
        });

        self.window.push_back(sample);
        while self.window.len() > self.config.window {
            self.window.pop_front();
        }
        spike
    }

    fn register_spike(
        &mut self,
        delta: u64,
        baseline: u64,
        sample: &MemorySample,
    ) -> MemorySpike {
        let spike = MemorySpike {
            id: Uuid::new_v4(),
            timestamp: sample.timestamp,
            severity: self.classify(delta),
            delta_bytes: delta,
            total_bytes: sample.heap_used,
            baseline_bytes: baseline,
            resolved: false,
            resolution_method: None,
        };
        tracing::warn!(
            delta_mb = delta / (1024 * 1024),
            severity = ?spike.severity,
            "memory spike detected"
        );
        self.total_detected += 1;
        self.spikes.push_back(spike.clone());
        while self.spikes.len() > self.config.log_cap {
            self.spikes.pop_front();
        }
        spike
    }

    /// Tiered magnitude buckets relative to the spike threshold.
    fn classify(&self, delta: u64) -> SpikeSeverity {
        let threshold = self.config.threshold_bytes;
        if delta >= threshold * 8 {
            SpikeSeverity::Critical
        } else if delta >= threshold * 4 {
            SpikeSeverity::High
        } else if delta >= threshold * 2 {
            SpikeSeverity::Medium
        } else {
            SpikeSeverity::Low
        }
    }

    /// A spike resolves when usage recedes below its baseline within the
    /// resolution timeout. Spikes past the timeout stay unresolved.
    fn try_resolve(&mut self, sample: &MemorySample) {
        let timeout = chrono::TimeDelta::from_std(self.config.resolution_timeout)
            .unwrap_or_else(|_| chrono::TimeDelta::MAX);
        for spike in self.spikes.iter_mut().filter(|s| !s.resolved) {
            if sample.heap_used <= spike.baseline_bytes
                && sample.timestamp - spike.timestamp <= timeout
            {
                spike.resolved = true;
                spike.resolution_method = Some("receded".into());
                tracing::debug!(spike = %spike.id, "memory spike resolved");
            }
        }
    }

    /// Spikes newer than `window`, most recent last.
    pub fn recent_spikes(&self, window: Duration) -> Vec<MemorySpike> {
        let cutoff = chrono::TimeDelta::from_std(window)
            .ok()
            .and_then(|w| Utc::now().checked_sub_signed(w));
        self.spikes
            .iter()
            .filter(|s| cutoff.map_or(true, |c| s.timestamp >= c))
            .cloned()
            .collect()
    }

    pub fn unresolved(&self) -> Vec<MemorySpike> {
        self.spikes.iter().filter(|s| !s.resolved).cloned().collect()
    }

    pub fn statistics(&self) -> SpikeStatistics {
        let mut stats = SpikeStatistics {
            total_detected: self.total_detected,
            ..Default::default()
        };
        for spike in &self.spikes {
            if !spike.resolved {
                stats.unresolved += 1;
            }
            match spike.severity {
                SpikeSeverity::Low => stats.low += 1,
                SpikeSeverity::Medium => stats.medium += 1,
                SpikeSeverity::High => stats.high += 1,
                SpikeSeverity::Critical => stats.critical += 1,
            }
            stats.max_delta_bytes = stats.max_delta_bytes.max(spike.delta_bytes);
        }
        stats.last_spike_at = self.spikes.back().map(|s| s.timestamp);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn config() -> SpikeConfig {
        SpikeConfig {
            threshold_bytes: 50 * MB,
            window: 60,
            log_cap: 25,
            resolution_timeout: Duration::from_secs(300),
        }
    }

    fn sample(heap_mb: u64) -> MemorySample {
        MemorySample {
            timestamp: Utc::now(),
            heap_used: heap_mb * MB,
            heap_total: 1024 * MB,
            external: 0,
            resident: heap_mb * MB,
            tag: None,
        }
    }

    #[test]
    fn flags_exactly_one_spike() {
        let mut detector = MemorySpikeDetector::new(config());
        for mb in [100, 100, 100] {
            assert!(detector.record(sample(mb)).is_none());
        }
        let spike = detector.record(sample(180)).expect("spike at index 3");
        assert_eq!(spike.delta_bytes, 80 * MB);
        assert_eq!(spike.severity, SpikeSeverity::Low);
        assert_eq!(detector.statistics().total_detected, 1);
    }

    #[test]
    fn severity_buckets_scale_with_magnitude() {
        let mut detector = MemorySpikeDetector::new(config());
        detector.record(sample(100));
        let spike = detector.record(sample(100 + 120)).unwrap();
        assert_eq!(spike.severity, SpikeSeverity::Medium);

        let mut detector = MemorySpikeDetector::new(config());
        detector.record(sample(100));
        let spike = detector.record(sample(100 + 250)).unwrap();
        assert_eq!(spike.severity, SpikeSeverity::High);

        let mut detector = MemorySpikeDetector::new(config());
        detector.record(sample(100));
        let spike = detector.record(sample(100 + 500)).unwrap();
        assert_eq!(spike.severity, SpikeSeverity::Critical);
    }

    #[test]
    fn spike_resolves_when_usage_recedes() {
        let mut detector = MemorySpikeDetector::new(config());
        detector.record(sample(100));
        detector.record(sample(200));
        assert_eq!(detector.unresolved().len(), 1);

        detector.record(sample(95));
        assert!(detector.unresolved().is_empty());
        let stats = detector.statistics();
        assert_eq!(stats.unresolved, 0);
    }

    #[test]
    fn spike_stays_unresolved_above_baseline() {
        let mut detector = MemorySpikeDetector::new(config());
        detector.record(sample(100));
        detector.record(sample(200));
        detector.record(sample(150));
        assert_eq!(detector.unresolved().len(), 1);
    }

    #[test]
    fn spike_log_is_bounded() {
        let mut detector = MemorySpikeDetector::new(config());
        let mut heap = 100u64;
        detector.record(sample(heap));
        for _ in 0..40 {
            heap += 60;
            detector.record(sample(heap));
        }
        let stats = detector.statistics();
        assert_eq!(stats.total_detected, 40);
        assert_eq!(detector.recent_spikes(Duration::from_secs(3600)).len(), 25);
    }

    #[test]
    fn window_is_bounded() {
        let mut detector = MemorySpikeDetector::new(SpikeConfig {
            window: 5,
            ..config()
        });
        for _ in 0..20 {
            detector.record(sample(100));
        }
        assert_eq!(detector.window.len(), 5);
    }
}

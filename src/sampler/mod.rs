//! Process memory sampling and threshold classification.
//!
//! A [`MemoryStatsSource`] abstracts where the numbers come from: the
//! default [`SystemMemorySource`] reads the host process via sysinfo, and
//! [`ManualMemorySource`] lets embedders (or tests) push allocator-specific
//! figures instead. [`ThresholdPolicy`] classifies each sample against two
//! configurable heap-usage fractions.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, PidExt, ProcessExt, System, SystemExt};

use crate::error::{Error, Result};

/// One point-in-time memory reading. Immutable, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySample {
    pub timestamp: DateTime<Utc>,
    /// Bytes of managed/allocator heap in use (process RSS when the host
    /// exposes nothing finer)
    pub heap_used: u64,
    /// Budget the usage ratio is computed against
    pub heap_total: u64,
    /// Memory charged to the process outside the heap (buffers, mappings)
    pub external: u64,
    /// Resident set size
    pub resident: u64,
    pub tag: Option<String>,
}

impl MemorySample {
    /// Fraction of the heap budget in use; zero budget reads as 0.0.
    pub fn usage_ratio(&self) -> f64 {
        if self.heap_total == 0 {
            0.0
        } else {
            self.heap_used as f64 / self.heap_total as f64
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

/// Classification of a sample against the threshold policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemoryLevel {
    Normal,
    Warning,
    Critical,
}

/// Source of process memory statistics.
pub trait MemoryStatsSource: Send + Sync {
    fn sample(&self) -> Result<MemorySample>;
}

/// sysinfo-backed stats source for the current process.
pub struct SystemMemorySource {
    system: Mutex<System>,
    pid: Pid,
    heap_limit: Option<u64>,
}

impl SystemMemorySource {
    /// `heap_limit` overrides the budget ratios are computed against;
    /// `None` falls back to the host's total memory.
    pub fn new(heap_limit: Option<u64>) -> Result<Self> {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| Error::StatsUnavailable(e.to_string()))?;
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_process(pid);
        Ok(Self {
            system: Mutex::new(system),
            pid,
            heap_limit,
        })
    }
}

impl MemoryStatsSource for SystemMemorySource {
    fn sample(&self) -> Result<MemorySample> {
        let mut system = self.system.lock();
        system.refresh_memory();
        if !system.refresh_process(self.pid) {
            return Err(Error::StatsUnavailable(format!(
                "process {} not visible",
                self.pid.as_u32()
            )));
        }
        let process = system.process(self.pid).ok_or_else(|| {
            Error::StatsUnavailable(format!("process {} not found", self.pid.as_u32()))
        })?;

        let resident = process.memory();
        let external = process.virtual_memory().saturating_sub(resident);
        let heap_total = self.heap_limit.unwrap_or_else(|| system.total_memory());

        Ok(MemorySample {
            timestamp: Utc::now(),
            heap_used: resident,
            heap_total,
            external,
            resident,
            tag: None,
        })
    }
}

/// Stats source fed by the embedder. Useful when the host runtime exposes
/// allocator-accurate numbers (jemalloc stats, arena counters) that beat
/// what the OS reports, and for deterministic tests.
#[derive(Default)]
pub struct ManualMemorySource {
    heap_used: AtomicU64,
    heap_total: AtomicU64,
    external: AtomicU64,
    resident: AtomicU64,
}

impl ManualMemorySource {
    pub fn new(heap_used: u64, heap_total: u64) -> Self {
        Self {
            heap_used: AtomicU64::new(heap_used),
            heap_total: AtomicU64::new(heap_total),
            external: AtomicU64::new(0),
            resident: AtomicU64::new(heap_used),
        }
    }

    pub fn set_heap_used(&self, bytes: u64) {
        self.heap_used.store(bytes, Ordering::Relaxed);
        self.resident.store(bytes, Ordering::Relaxed);
    }

    pub fn set_external(&self, bytes: u64) {
        self.external.store(bytes, Ordering::Relaxed);
    }
}

impl MemoryStatsSource for ManualMemorySource {
    fn sample(&self) -> Result<MemorySample> {
        Ok(MemorySample {
            timestamp: Utc::now(),
            heap_used: self.heap_used.load(Ordering::Relaxed),
            heap_total: self.heap_total.load(Ordering::Relaxed),
            external: self.external.load(Ordering::Relaxed),
            resident: self.resident.load(Ordering::Relaxed),
            tag: None,
        })
    }
}

/// Classifies samples by heap usage ratio. Construction fails when the
/// warning fraction is not strictly below the critical fraction.
#[derive(Debug, Clone)]
pub struct ThresholdPolicy {
    warning_ratio: f64,
    critical_ratio: f64,
}

impl ThresholdPolicy {
    pub fn new(warning_ratio: f64, critical_ratio: f64) -> Result<Self> {
        if warning_ratio >= critical_ratio {
            return Err(Error::Configuration(format!(
                "warning ratio {} must be below critical ratio {}",
                warning_ratio, critical_ratio
            )));
        }
        Ok(Self {
            warning_ratio,
            critical_ratio,
        })
    }

    pub fn evaluate(&self, sample: &MemorySample) -> MemoryLevel {
        let ratio = sample.usage_ratio();
        if ratio >= self.critical_ratio {
            MemoryLevel::Critical
        } else if ratio >= self.warning_ratio {
            MemoryLevel::Warning
        } else {
            MemoryLevel::Normal
        }
    }

    pub fn warning_ratio(&self) -> f64 {
        self.warning_ratio
    }

    pub fn critical_ratio(&self) -> f64 {
        self.critical_ratio
    }
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            warning_ratio: 0.60,
            critical_ratio: 0.75,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_with_ratio(ratio: f64) -> MemorySample {
        let total: u64 = 1_000_000_000;
        MemorySample {
            timestamp: Utc::now(),
            heap_used: (total as f64 * ratio) as u64,
            heap_total: total,
            external: 0,
            resident: 0,
            tag: None,
        }
    }

    #[test]
    fn default_thresholds_classify_levels() {
        let policy = ThresholdPolicy::default();
        assert_eq!(policy.evaluate(&sample_with_ratio(0.55)), MemoryLevel::Normal);
        assert_eq!(policy.evaluate(&sample_with_ratio(0.65)), MemoryLevel::Warning);
        assert_eq!(policy.evaluate(&sample_with_ratio(0.80)), MemoryLevel::Critical);
    }

    #[test]
    fn inverted_thresholds_rejected() {
        assert!(ThresholdPolicy::new(0.8, 0.6).is_err());
        assert!(ThresholdPolicy::new(0.6, 0.6).is_err());
        assert!(ThresholdPolicy::new(0.6, 0.75).is_ok());
    }

    #[test]
    fn zero_budget_evaluates_normal() {
        let policy = ThresholdPolicy::default();
        let mut sample = sample_with_ratio(0.9);
        sample.heap_total = 0;
        assert_eq!(policy.evaluate(&sample), MemoryLevel::Normal);
    }

    #[test]
    fn system_source_produces_nonzero_resident() {
        let source = SystemMemorySource::new(None).unwrap();
        let sample = source.sample().unwrap();
        assert!(sample.resident > 0);
        assert!(sample.heap_total > 0);
    }

    #[test]
    fn manual_source_reflects_updates() {
        let source = ManualMemorySource::new(100, 1000);
        assert_eq!(source.sample().unwrap().heap_used, 100);
        source.set_heap_used(900);
        let sample = source.sample().unwrap();
        assert_eq!(sample.heap_used, 900);
        assert!(sample.usage_ratio() > 0.8);
    }

    #[test]
    fn levels_are_ordered() {
        assert!(MemoryLevel::Normal < MemoryLevel::Warning);
        assert!(MemoryLevel::Warning < MemoryLevel::Critical);
    }
}

//! Heap snapshot capture, rotation, and leak-pattern analysis.
//!
//! Capture is CPU/I/O heavy and visibly pauses the process, so it runs on a
//! slow independent schedule and never inside a request path. Snapshot files
//! are the only on-disk state this engine owns: JSON documents under a
//! dedicated directory, named by reason and timestamp, rotated FIFO beyond
//! the retention count.
//!
//! Leak classification is heuristic, not proof of a true leak. The MB/hour
//! tiers and growth-ratio constants are tunable configuration.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SnapshotConfig;
use crate::error::{Error, Result};
use crate::sampler::{MemorySample, MemoryStatsSource};

const MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LeakSeverity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeapSnapshotRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub file_path: PathBuf,
    pub reason: String,
    pub file_size_bytes: u64,
    pub sample: MemorySample,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspectedLeak {
    pub category: String,
    pub description: String,
    pub severity: LeakSeverity,
    pub growth_rate_mb_per_hour: f64,
    pub recommendation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeapComparison {
    pub snapshot_a: Uuid,
    pub snapshot_b: Uuid,
    pub elapsed_ms: i64,
    /// Byte growth per category (heap_used, heap_total, external, resident)
    pub growth_by_category: BTreeMap<String, i64>,
    pub suspected_leaks: Vec<SuspectedLeak>,
    pub risk_level: LeakSeverity,
}

/// On-disk document written per capture.
#[derive(Debug, Serialize, Deserialize)]
struct HeapDumpDocument {
    id: Uuid,
    captured_at: DateTime<Utc>,
    reason: String,
    pid: u32,
    sample: MemorySample,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeapAnalysisReport {
    pub snapshots: Vec<HeapSnapshotRecord>,
    pub last_comparison: Option<HeapComparison>,
    pub failed_captures: u64,
    pub last_error: Option<String>,
}

struct AnalyzerState {
    records: VecDeque<HeapSnapshotRecord>,
    last_comparison: Option<HeapComparison>,
    failed_captures: u64,
    last_error: Option<String>,
}

pub struct HeapSnapshotAnalyzer {
    config: SnapshotConfig,
    stats_source: Arc<dyn MemoryStatsSource>,
    state: Mutex<AnalyzerState>,
}

impl HeapSnapshotAnalyzer {
    pub fn new(config: SnapshotConfig, stats_source: Arc<dyn MemoryStatsSource>) -> Self {
        Self {
            config,
            stats_source,
            state: Mutex::new(AnalyzerState {
                records: VecDeque::new(),
                last_comparison: None,
                failed_captures: 0,
                last_error: None,
            }),
        }
    }

    /// Write a full heap dump for `reason` and record it, rotating the
    /// oldest file+record pairs beyond the retention count. A failed
    /// capture is recorded and does not affect later attempts.
    pub async fn capture(&self, reason: &str) -> Result<HeapSnapshotRecord> {
        match self.capture_inner(reason).await {
            Ok(record) => {
                tracing::info!(
                    reason,
                    path = %record.file_path.display(),
                    size_bytes = record.file_size_bytes,
                    "heap snapshot captured"
                );
                Ok(record)
            }
            Err(e) => {
                let mut state = self.state.lock();
                state.failed_captures += 1;
                state.last_error = Some(e.to_string());
                tracing::warn!(reason, error = %e, "heap snapshot capture failed");
                Err(e)
            }
        }
    }

    async fn capture_inner(&self, reason: &str) -> Result<HeapSnapshotRecord> {
        let sample = self.stats_source.sample()?;
        let timestamp = sample.timestamp;
        let id = Uuid::new_v4();

        tokio::fs::create_dir_all(&self.config.directory)
            .await
            .map_err(|e| Error::SnapshotCapture(e.to_string()))?;

        let file_path = self.config.directory.join(format!(
            "heap-{}-{}.json",
            sanitize_reason(reason),
            timestamp.timestamp_millis()
        ));

        let document = HeapDumpDocument {
            id,
            captured_at: timestamp,
            reason: reason.to_string(),
            pid: std::process::id(),
            sample: sample.clone(),
        };
        let body = serde_json::to_vec_pretty(&document)?;
        tokio::fs::write(&file_path, &body)
            .await
            .map_err(|e| Error::SnapshotCapture(e.to_string()))?;

        let record = HeapSnapshotRecord {
            id,
            timestamp,
            file_path,
            reason: reason.to_string(),
            file_size_bytes: body.len() as u64,
            sample,
        };

        let expired = {
            let mut state = self.state.lock();
            state.records.push_back(record.clone());
            let mut expired = Vec::new();
            while state.records.len() > self.config.retention {
                if let Some(old) = state.records.pop_front() {
                    expired.push(old);
                }
            }
            expired
        };
        for old in expired {
            if let Err(e) = tokio::fs::remove_file(&old.file_path).await {
                tracing::warn!(
                    path = %old.file_path.display(),
                    error = %e,
                    "failed to delete rotated heap snapshot"
                );
            }
        }

        Ok(record)
    }

    /// Pairwise comparison. Growth rates and leak suspects are computed
    /// only when the elapsed time is positive.
    pub fn compare(&self, a: &HeapSnapshotRecord, b: &HeapSnapshotRecord) -> HeapComparison {
        let elapsed_ms = b.timestamp.timestamp_millis() - a.timestamp.timestamp_millis();

        let mut growth = BTreeMap::new();
        growth.insert(
            "heap_used".to_string(),
            b.sample.heap_used as i64 - a.sample.heap_used as i64,
        );
        growth.insert(
            "heap_total".to_string(),
            b.sample.heap_total as i64 - a.sample.heap_total as i64,
        );
        growth.insert(
            "external".to_string(),
            b.sample.external as i64 - a.sample.external as i64,
        );
        growth.insert(
            "resident".to_string(),
            b.sample.resident as i64 - a.sample.resident as i64,
        );

        let suspected_leaks = if elapsed_ms > 0 {
            self.detect_suspected_leaks(elapsed_ms, &growth)
        } else {
            Vec::new()
        };
        let risk_level = suspected_leaks
            .iter()
            .map(|s| s.severity)
            .max()
            .unwrap_or(LeakSeverity::None);

        let comparison = HeapComparison {
            snapshot_a: a.id,
            snapshot_b: b.id,
            elapsed_ms,
            growth_by_category: growth,
            suspected_leaks,
            risk_level,
        };
        self.state.lock().last_comparison = Some(comparison.clone());
        comparison
    }

    /// Compare the two most recent snapshots, if both exist.
    pub fn compare_latest(&self) -> Option<HeapComparison> {
        let (a, b) = {
            let state = self.state.lock();
            let n = state.records.len();
            if n < 2 {
                return None;
            }
            (
                state.records[n - 2].clone(),
                state.records[n - 1].clone(),
            )
        };
        Some(self.compare(&a, &b))
    }

    fn detect_suspected_leaks(
        &self,
        elapsed_ms: i64,
        growth: &BTreeMap<String, i64>,
    ) -> Vec<SuspectedLeak> {
        let hours = elapsed_ms as f64 / 3_600_000.0;
        let mut suspects = Vec::new();

        for (category, recommendation) in [
            ("heap_used", "inspect object retention and cache sizing"),
            ("external", "inspect buffer, stream, and native-handle usage"),
            ("resident", "inspect overall process footprint and mappings"),
        ] {
            let delta_mb = growth.get(category).copied().unwrap_or(0) as f64 / MB;
            let rate = delta_mb / hours;
            let severity = self.severity_for_rate(rate);
            if severity > LeakSeverity::None {
                suspects.push(SuspectedLeak {
                    category: category.to_string(),
                    description: format!(
                        "{} grew {:.1}MB over {:.2}h",
                        category, delta_mb, hours
                    ),
                    severity,
                    growth_rate_mb_per_hour: rate,
                    recommendation: recommendation.to_string(),
                });
            }
        }

        // External growth materially outpacing heap growth points at
        // unreleased buffers or streams rather than ordinary retention.
        let heap_mb = growth.get("heap_used").copied().unwrap_or(0) as f64 / MB;
        let external_mb = growth.get("external").copied().unwrap_or(0) as f64 / MB;
        if external_mb > 10.0 && external_mb > heap_mb * self.config.external_ratio {
            let rate = external_mb / hours;
            suspects.push(SuspectedLeak {
                category: "external".to_string(),
                description: format!(
                    "external growth {:.1}MB outpaces heap growth {:.1}MB",
                    external_mb, heap_mb
                ),
                severity: self.severity_for_rate(rate).max(LeakSeverity::Medium),
                growth_rate_mb_per_hour: rate,
                recommendation: "audit stream/buffer lifecycles and native resources".to_string(),
            });
        }

        // Sustained linear heap growth in a moderate band over more than
        // an hour is the classic steady-leak signature.
        let heap_rate = heap_mb / hours;
        if hours > 1.0
            && heap_rate >= self.config.steady_min_mb_per_hour
            && heap_rate <= self.config.steady_max_mb_per_hour
        {
            suspects.push(SuspectedLeak {
                category: "heap_used".to_string(),
                description: format!(
                    "steady heap growth of {:.1}MB/h sustained over {:.2}h",
                    heap_rate, hours
                ),
                severity: self.severity_for_rate(heap_rate).max(LeakSeverity::Medium),
                growth_rate_mb_per_hour: heap_rate,
                recommendation: "look for unbounded collections or listener accumulation"
                    .to_string(),
            });
        }

        suspects
    }

    /// Classify a growth rate against the configured MB/hour tiers.
    pub fn severity_for_rate(&self, mb_per_hour: f64) -> LeakSeverity {
        let tiers = &self.config.leak_tiers;
        if mb_per_hour >= tiers.critical_mb_per_hour {
            LeakSeverity::Critical
        } else if mb_per_hour >= tiers.high_mb_per_hour {
            LeakSeverity::High
        } else if mb_per_hour >= tiers.medium_mb_per_hour {
            LeakSeverity::Medium
        } else if mb_per_hour >= tiers.low_mb_per_hour {
            LeakSeverity::Low
        } else {
            LeakSeverity::None
        }
    }

    pub fn records(&self) -> Vec<HeapSnapshotRecord> {
        self.state.lock().records.iter().cloned().collect()
    }

    pub fn analysis(&self) -> HeapAnalysisReport {
        let state = self.state.lock();
        HeapAnalysisReport {
            snapshots: state.records.iter().cloned().collect(),
            last_comparison: state.last_comparison.clone(),
            failed_captures: state.failed_captures,
            last_error: state.last_error.clone(),
        }
    }
}

fn sanitize_reason(reason: &str) -> String {
    let cleaned: String = reason
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    if cleaned.is_empty() {
        "manual".to_string()
    } else {
        cleaned
    }
}

/// Periodic capture-and-compare task. Escalates high/critical risk through
/// the supplied hook; a failed capture never cancels the schedule.
pub struct SnapshotScheduler {
    handle: Mutex<Option<JoinHandle<()>>>,
}

pub type EscalationHook = Arc<dyn Fn(HeapComparison) + Send + Sync>;

impl SnapshotScheduler {
    pub fn start(
        analyzer: Arc<HeapSnapshotAnalyzer>,
        escalation: Option<EscalationHook>,
    ) -> Self {
        let interval_duration = analyzer.config.interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_duration);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Skip the immediate first tick; capture pauses the process and
            // has no comparison partner at startup anyway.
            interval.tick().await;
            loop {
                interval.tick().await;
                if analyzer.capture("scheduled").await.is_err() {
                    continue;
                }
                if let Some(comparison) = analyzer.compare_latest() {
                    if comparison.risk_level >= LeakSeverity::High {
                        tracing::error!(
                            risk = ?comparison.risk_level,
                            suspects = comparison.suspected_leaks.len(),
                            "heap analysis escalation"
                        );
                        if let Some(hook) = &escalation {
                            hook(comparison);
                        }
                    }
                }
            }
        });
        Self {
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for SnapshotScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::ManualMemorySource;
    use chrono::TimeDelta;

    const MIB: u64 = 1024 * 1024;

    fn analyzer_with(config: SnapshotConfig) -> HeapSnapshotAnalyzer {
        let source = Arc::new(ManualMemorySource::new(100 * MIB, 1024 * MIB));
        HeapSnapshotAnalyzer::new(config, source)
    }

    fn record(heap_mb: u64, external_mb: u64, at: DateTime<Utc>) -> HeapSnapshotRecord {
        HeapSnapshotRecord {
            id: Uuid::new_v4(),
            timestamp: at,
            file_path: PathBuf::from("unused.json"),
            reason: "test".into(),
            file_size_bytes: 0,
            sample: MemorySample {
                timestamp: at,
                heap_used: heap_mb * MIB,
                heap_total: 2048 * MIB,
                external: external_mb * MIB,
                resident: heap_mb * MIB,
                tag: None,
            },
        }
    }

    #[test]
    fn growth_rate_is_exact() {
        let analyzer = analyzer_with(SnapshotConfig::default());
        let t0 = Utc::now();
        let a = record(100, 0, t0);
        let b = record(150, 0, t0 + TimeDelta::milliseconds(3_600_000));

        let comparison = analyzer.compare(&a, &b);
        assert_eq!(comparison.elapsed_ms, 3_600_000);
        assert_eq!(
            comparison.growth_by_category["heap_used"],
            (50 * MIB) as i64
        );
        let heap_suspect = comparison
            .suspected_leaks
            .iter()
            .find(|s| s.category == "heap_used")
            .expect("heap suspect");
        assert!((heap_suspect.growth_rate_mb_per_hour - 50.0).abs() < 1e-9);
    }

    #[test]
    fn severity_is_monotonic_in_rate() {
        let analyzer = analyzer_with(SnapshotConfig::default());
        let rates = [0.0, 5.0, 10.0, 25.0, 50.0, 100.0, 500.0];
        let severities: Vec<_> = rates
            .iter()
            .map(|r| analyzer.severity_for_rate(*r))
            .collect();
        for pair in severities.windows(2) {
            assert!(pair[0] <= pair[1], "severity must not decrease: {:?}", pair);
        }
        assert_eq!(severities[0], LeakSeverity::None);
        assert_eq!(*severities.last().unwrap(), LeakSeverity::Critical);
    }

    #[test]
    fn zero_elapsed_skips_rate_computation() {
        let analyzer = analyzer_with(SnapshotConfig::default());
        let t0 = Utc::now();
        let a = record(100, 0, t0);
        let b = record(500, 0, t0);
        let comparison = analyzer.compare(&a, &b);
        assert_eq!(comparison.elapsed_ms, 0);
        assert!(comparison.suspected_leaks.is_empty());
        assert_eq!(comparison.risk_level, LeakSeverity::None);
    }

    #[test]
    fn external_outpacing_heap_flags_buffer_leak() {
        let analyzer = analyzer_with(SnapshotConfig::default());
        let t0 = Utc::now();
        let a = record(100, 10, t0);
        let b = record(102, 40, t0 + TimeDelta::hours(1));
        let comparison = analyzer.compare(&a, &b);
        let suspect = comparison
            .suspected_leaks
            .iter()
            .find(|s| s.description.contains("outpaces heap growth"))
            .expect("buffer-leak suspect");
        assert!(suspect.severity >= LeakSeverity::Medium);
    }

    #[test]
    fn steady_moderate_growth_flags_steady_leak() {
        let analyzer = analyzer_with(SnapshotConfig::default());
        let t0 = Utc::now();
        let a = record(100, 0, t0);
        // 60MB over 2h = 30MB/h, inside the 5-100 band
        let b = record(160, 0, t0 + TimeDelta::hours(2));
        let comparison = analyzer.compare(&a, &b);
        assert!(comparison
            .suspected_leaks
            .iter()
            .any(|s| s.description.contains("steady heap growth")));
    }

    #[tokio::test]
    async fn retention_rotates_oldest_file_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let config = SnapshotConfig {
            directory: dir.path().to_path_buf(),
            retention: 3,
            ..SnapshotConfig::default()
        };
        let source = Arc::new(ManualMemorySource::new(100 * MIB, 1024 * MIB));
        let analyzer = HeapSnapshotAnalyzer::new(config, source.clone());

        let mut first_path = None;
        for i in 0..4u64 {
            source.set_heap_used((100 + i) * MIB);
            let record = analyzer.capture(&format!("round{}", i)).await.unwrap();
            if i == 0 {
                first_path = Some(record.file_path.clone());
            }
            // Distinct timestamps keep file names unique.
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let records = analyzer.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].reason, "round1");
        assert!(!first_path.unwrap().exists());

        let on_disk = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(on_disk, 3);
    }

    #[tokio::test]
    async fn failed_capture_is_recorded_not_fatal() {
        let config = SnapshotConfig {
            // A file path as directory makes create_dir_all fail.
            directory: PathBuf::from("/dev/null/nested"),
            ..SnapshotConfig::default()
        };
        let analyzer = analyzer_with(config);
        let err = analyzer.capture("broken").await.unwrap_err();
        assert!(matches!(err, Error::SnapshotCapture(_)));
        let report = analyzer.analysis();
        assert_eq!(report.failed_captures, 1);
        assert!(report.last_error.is_some());
        assert!(report.snapshots.is_empty());
    }

    #[test]
    fn reason_is_sanitized_for_file_names() {
        assert_eq!(sanitize_reason("pre cleanup/check"), "pre-cleanup-check");
        assert_eq!(sanitize_reason(""), "manual");
    }
}

//! Per-operation memory profiling for the backing data store.
//!
//! [`DatabaseOperationMemoryMonitor`] wraps asynchronous data-store calls,
//! measuring memory delta and wall-clock duration across the full awaited
//! call. Each invocation records an [`OperationProfile`] into a capped
//! history and folds into [`AggregatedOperationStats`] by incremental
//! averaging; the full history is never re-scanned. The wrapper is
//! transparent to errors: a failing executor still records a failed profile
//! and its error propagates unchanged.

use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::config::DbMonitorConfig;
use crate::sampler::MemoryStatsSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationCategory {
    PointRead,
    PointWrite,
    BulkRead,
    BulkWrite,
    Migration,
}

impl OperationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PointRead => "point_read",
            Self::PointWrite => "point_write",
            Self::BulkRead => "bulk_read",
            Self::BulkWrite => "bulk_write",
            Self::Migration => "migration",
        }
    }

    /// Alert threshold for this category: point reads/writes < bulk
    /// operations < migrations.
    fn threshold_bytes(&self, config: &DbMonitorConfig) -> u64 {
        match self {
            Self::PointRead | Self::PointWrite => config.point_threshold_bytes,
            Self::BulkRead | Self::BulkWrite => config.bulk_threshold_bytes,
            Self::Migration => config.migration_threshold_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationProfile {
    pub operation: String,
    pub category: OperationCategory,
    pub query_size_bytes: usize,
    pub memory_delta_bytes: i64,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

/// Online aggregate per operation key. Means are maintained incrementally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedOperationStats {
    pub key: String,
    pub category: OperationCategory,
    pub avg_memory_bytes: f64,
    pub max_memory_bytes: i64,
    pub total_executions: u64,
    pub failed_executions: u64,
    pub avg_duration_ms: f64,
    pub max_duration_ms: u64,
    pub failure_rate: f64,
    pub last_executed: DateTime<Utc>,
}

impl AggregatedOperationStats {
    fn new(key: String, category: OperationCategory) -> Self {
        Self {
            key,
            category,
            avg_memory_bytes: 0.0,
            max_memory_bytes: i64::MIN,
            total_executions: 0,
            failed_executions: 0,
            avg_duration_ms: 0.0,
            max_duration_ms: 0,
            failure_rate: 0.0,
            last_executed: Utc::now(),
        }
    }

    fn update(&mut self, profile: &OperationProfile) {
        self.total_executions += 1;
        if !profile.success {
            self.failed_executions += 1;
        }
        let n = self.total_executions as f64;
        self.avg_memory_bytes += (profile.memory_delta_bytes as f64 - self.avg_memory_bytes) / n;
        self.avg_duration_ms += (profile.duration_ms as f64 - self.avg_duration_ms) / n;
        self.max_memory_bytes = self.max_memory_bytes.max(profile.memory_delta_bytes);
        self.max_duration_ms = self.max_duration_ms.max(profile.duration_ms);
        self.failure_rate = self.failed_executions as f64 / n;
        self.last_executed = profile.timestamp;
    }
}

/// A recorded threshold breach, kept for reports alongside the log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdBreach {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub category: OperationCategory,
    pub memory_delta_bytes: i64,
    pub threshold_bytes: u64,
    /// Delta reached at least twice the category threshold
    pub escalated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseReport {
    pub total_operations: u64,
    pub failed_operations: u64,
    pub top_consumers: Vec<AggregatedOperationStats>,
    pub slowest: Vec<AggregatedOperationStats>,
    pub highest_failure_rate: Vec<AggregatedOperationStats>,
    pub recent_breaches: Vec<ThresholdBreach>,
}

struct MonitorState {
    profiles: VecDeque<OperationProfile>,
    aggregates: FxHashMap<String, AggregatedOperationStats>,
    breaches: VecDeque<ThresholdBreach>,
    total_operations: u64,
    failed_operations: u64,
}

pub struct DatabaseOperationMemoryMonitor {
    config: DbMonitorConfig,
    stats_source: Arc<dyn MemoryStatsSource>,
    state: RwLock<MonitorState>,
}

impl DatabaseOperationMemoryMonitor {
    pub fn new(config: DbMonitorConfig, stats_source: Arc<dyn MemoryStatsSource>) -> Self {
        Self {
            config,
            stats_source,
            state: RwLock::new(MonitorState {
                profiles: VecDeque::new(),
                aggregates: FxHashMap::default(),
                breaches: VecDeque::new(),
                total_operations: 0,
                failed_operations: 0,
            }),
        }
    }

    /// Run `executor` under memory/duration measurement. The result is
    /// returned exactly as produced; monitoring never swallows a domain
    /// error, and a stats-source failure degrades to a zero-delta profile.
    pub async fn monitor_operation<T, E, Fut>(
        &self,
        operation: &str,
        category: OperationCategory,
        query_size_bytes: usize,
        executor: Fut,
    ) -> std::result::Result<T, E>
    where
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let before = self.stats_source.sample().ok();
        let started = Instant::now();

        let result = executor.await;

        let duration_ms = started.elapsed().as_millis() as u64;
        let after = self.stats_source.sample().ok();
        let memory_delta_bytes = match (&before, &after) {
            (Some(b), Some(a)) => a.heap_used as i64 - b.heap_used as i64,
            _ => 0,
        };

        let profile = OperationProfile {
            operation: operation.to_string(),
            category,
            query_size_bytes,
            memory_delta_bytes,
            duration_ms,
            timestamp: Utc::now(),
            success: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
        };
        self.record(profile);

        result
    }

    fn record(&self, profile: OperationProfile) {
        let threshold = profile.category.threshold_bytes(&self.config);
        let mut state = self.state.write();

        state.total_operations += 1;
        if !profile.success {
            state.failed_operations += 1;
        }

        state
            .aggregates
            .entry(profile.operation.clone())
            .or_insert_with(|| {
                AggregatedOperationStats::new(profile.operation.clone(), profile.category)
            })
            .update(&profile);

        if profile.memory_delta_bytes > threshold as i64 {
            let escalated = profile.memory_delta_bytes >= 2 * threshold as i64;
            let breach = ThresholdBreach {
                timestamp: profile.timestamp,
                operation: profile.operation.clone(),
                category: profile.category,
                memory_delta_bytes: profile.memory_delta_bytes,
                threshold_bytes: threshold,
                escalated,
            };
            if escalated {
                tracing::error!(
                    operation = %breach.operation,
                    delta_bytes = breach.memory_delta_bytes,
                    threshold_bytes = threshold,
                    "database operation memory use at 2x category threshold"
                );
            } else {
                tracing::warn!(
                    operation = %breach.operation,
                    delta_bytes = breach.memory_delta_bytes,
                    threshold_bytes = threshold,
                    "database operation exceeded memory threshold"
                );
            }
            state.breaches.push_back(breach);
            while state.breaches.len() > self.config.breach_log_cap {
                state.breaches.pop_front();
            }
        }

        state.profiles.push_back(profile);
        while state.profiles.len() > self.config.history_cap {
            state.profiles.pop_front();
        }
    }

    /// Operations ranked by average memory delta, heaviest first.
    pub fn top_consumers(&self, limit: usize) -> Vec<AggregatedOperationStats> {
        self.ranked(limit, |a, b| {
            b.avg_memory_bytes
                .partial_cmp(&a.avg_memory_bytes)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    }

    /// Operations ranked by average duration, slowest first.
    pub fn slowest(&self, limit: usize) -> Vec<AggregatedOperationStats> {
        self.ranked(limit, |a, b| {
            b.avg_duration_ms
                .partial_cmp(&a.avg_duration_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    }

    pub fn highest_failure_rate(&self, limit: usize) -> Vec<AggregatedOperationStats> {
        let mut ranked = self.ranked(usize::MAX, |a, b| {
            b.failure_rate
                .partial_cmp(&a.failure_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.retain(|s| s.failed_executions > 0);
        ranked.truncate(limit);
        ranked
    }

    fn ranked(
        &self,
        limit: usize,
        cmp: impl Fn(&AggregatedOperationStats, &AggregatedOperationStats) -> std::cmp::Ordering,
    ) -> Vec<AggregatedOperationStats> {
        let state = self.state.read();
        let mut all: Vec<_> = state.aggregates.values().cloned().collect();
        all.sort_by(cmp);
        all.truncate(limit);
        all
    }

    pub fn recent_profiles(&self, limit: usize) -> Vec<OperationProfile> {
        let state = self.state.read();
        state.profiles.iter().rev().take(limit).cloned().collect()
    }

    pub fn report(&self) -> DatabaseReport {
        let (total, failed, breaches) = {
            let state = self.state.read();
            (
                state.total_operations,
                state.failed_operations,
                state.breaches.iter().cloned().collect(),
            )
        };
        DatabaseReport {
            total_operations: total,
            failed_operations: failed,
            top_consumers: self.top_consumers(5),
            slowest: self.slowest(5),
            highest_failure_rate: self.highest_failure_rate(5),
            recent_breaches: breaches,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::ManualMemorySource;

    const MB: u64 = 1024 * 1024;

    fn monitor() -> (Arc<ManualMemorySource>, DatabaseOperationMemoryMonitor) {
        let source = Arc::new(ManualMemorySource::new(100 * MB, 1024 * MB));
        let monitor =
            DatabaseOperationMemoryMonitor::new(DbMonitorConfig::default(), source.clone());
        (source, monitor)
    }

    #[tokio::test]
    async fn successful_operation_is_profiled() {
        let (_, monitor) = monitor();
        let out: Result<u32, String> = monitor
            .monitor_operation("get_user", OperationCategory::PointRead, 64, async {
                Ok(42)
            })
            .await;
        assert_eq!(out.unwrap(), 42);

        let profiles = monitor.recent_profiles(10);
        assert_eq!(profiles.len(), 1);
        assert!(profiles[0].success);
        assert_eq!(profiles[0].operation, "get_user");
    }

    #[tokio::test]
    async fn executor_error_passes_through_unchanged() {
        let (_, monitor) = monitor();
        let out: Result<(), String> = monitor
            .monitor_operation("broken_insert", OperationCategory::PointWrite, 128, async {
                Err("unique constraint violated".to_string())
            })
            .await;
        assert_eq!(out.unwrap_err(), "unique constraint violated");

        let profiles = monitor.recent_profiles(10);
        assert!(!profiles[0].success);
        assert_eq!(
            profiles[0].error.as_deref(),
            Some("unique constraint violated")
        );
        assert_eq!(monitor.report().failed_operations, 1);
    }

    #[tokio::test]
    async fn aggregates_use_incremental_means() {
        let (source, monitor) = monitor();
        for (before, after, _ms) in [(100, 110, 5), (110, 130, 15)] {
            source.set_heap_used(before * MB);
            let _: Result<(), String> = monitor
                .monitor_operation("scan", OperationCategory::BulkRead, 0, async {
                    source.set_heap_used(after * MB);
                    Ok(())
                })
                .await;
        }
        let stats = &monitor.top_consumers(1)[0];
        assert_eq!(stats.total_executions, 2);
        // deltas of 10MB and 20MB average to 15MB
        assert!((stats.avg_memory_bytes - (15 * MB) as f64).abs() < 1.0);
        assert_eq!(stats.max_memory_bytes, (20 * MB) as i64);
    }

    #[tokio::test]
    async fn breach_recorded_and_escalated() {
        let (source, monitor) = monitor();
        source.set_heap_used(100 * MB);
        let _: Result<(), String> = monitor
            .monitor_operation("import", OperationCategory::PointWrite, 0, async {
                // 25MB jump against a 10MB point threshold: escalates at 2x
                source.set_heap_used(125 * MB);
                Ok(())
            })
            .await;
        let report = monitor.report();
        assert_eq!(report.recent_breaches.len(), 1);
        assert!(report.recent_breaches[0].escalated);
    }

    #[tokio::test]
    async fn profile_history_is_bounded() {
        let source = Arc::new(ManualMemorySource::new(100 * MB, 1024 * MB));
        let config = DbMonitorConfig {
            history_cap: 10,
            ..Default::default()
        };
        let monitor = DatabaseOperationMemoryMonitor::new(config, source);
        for i in 0..25u32 {
            let _: Result<u32, String> = monitor
                .monitor_operation("ping", OperationCategory::PointRead, 0, async { Ok(i) })
                .await;
        }
        assert_eq!(monitor.recent_profiles(100).len(), 10);
        assert_eq!(monitor.report().total_operations, 25);
    }

    #[tokio::test]
    async fn failure_rate_ranking_skips_clean_operations() {
        let (_, monitor) = monitor();
        let _: Result<(), String> = monitor
            .monitor_operation("ok_op", OperationCategory::PointRead, 0, async { Ok(()) })
            .await;
        let _: Result<(), String> = monitor
            .monitor_operation("bad_op", OperationCategory::PointRead, 0, async {
                Err("boom".into())
            })
            .await;
        let ranked = monitor.highest_failure_rate(5);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].key, "bad_op");
        assert!((ranked[0].failure_rate - 1.0).abs() < f64::EPSILON);
    }
}

//! Composition root for the memory-health engine.
//!
//! One [`MemoryHealthService`] is constructed per process and injected into
//! collaborators; there are no global accessors. It owns the periodic
//! sampling tick and the snapshot scheduler, wires threshold reactions
//! (Warning requests a GC pass, Critical invokes the cleanup coordinator
//! under a cooldown), and exposes the read-only report surface the routing
//! layer serializes. Every spawned task's cancel handle lands in a shutdown
//! list so `shutdown()` can stop all of them, including from exit handlers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cleanup::{CleanupReport, CleanupTarget, EmergencyCleanupCoordinator, GcCapability, NoopGc};
use crate::config::MemoryHealthConfig;
use crate::database::{DatabaseOperationMemoryMonitor, DatabaseReport};
use crate::error::Result;
use crate::pool::PoolMaintenance;
use crate::sampler::{MemoryLevel, MemorySample, MemoryStatsSource, SystemMemorySource, ThresholdPolicy};
use crate::snapshot::{
    HeapAnalysisReport, HeapSnapshotAnalyzer, HeapSnapshotRecord, SnapshotScheduler,
};
use crate::spike::{MemorySpike, MemorySpikeDetector, SpikeStatistics};

/// Structured success/error envelope for report endpoints. The routing
/// layer serializes this; failed report generation yields an explicit
/// error field rather than partial silent data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportEnvelope<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ReportEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

impl<T> From<Result<T>> for ReportEnvelope<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::err(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStatusReport {
    pub sample: Option<MemorySample>,
    pub level: MemoryLevel,
    pub usage_ratio: f64,
    pub warning_ratio: f64,
    pub critical_ratio: f64,
    pub unresolved_spikes: usize,
}

struct ServiceShared {
    config: MemoryHealthConfig,
    policy: ThresholdPolicy,
    stats_source: Arc<dyn MemoryStatsSource>,
    history: Mutex<VecDeque<MemorySample>>,
    spikes: Mutex<MemorySpikeDetector>,
    coordinator: EmergencyCleanupCoordinator,
    level: Mutex<MemoryLevel>,
    last_critical_cleanup: Mutex<Option<Instant>>,
}

impl ServiceShared {
    /// One sampling tick: sample, append to the capped history, feed the
    /// spike detector, classify, and react. Kept short; the only long
    /// operation (cleanup) is single-flight inside the coordinator.
    async fn tick(&self) {
        let sample = match self.stats_source.sample() {
            Ok(sample) => sample,
            Err(e) => {
                tracing::warn!(error = %e, "memory sampling failed");
                return;
            }
        };

        {
            let mut history = self.history.lock();
            history.push_back(sample.clone());
            while history.len() > self.config.sampler.history_cap {
                history.pop_front();
            }
        }
        self.spikes.lock().record(sample.clone());

        let level = self.policy.evaluate(&sample);
        *self.level.lock() = level;

        match level {
            MemoryLevel::Normal => {}
            MemoryLevel::Warning => {
                tracing::warn!(ratio = sample.usage_ratio(), "memory usage at warning level");
                // Light trim: a GC pass when the capability exists.
                if self.coordinator.gc_available() {
                    if let Err(e) = self.coordinator.request_gc() {
                        tracing::warn!(error = %e, "warning-level gc request failed");
                    }
                }
            }
            MemoryLevel::Critical => {
                tracing::error!(ratio = sample.usage_ratio(), "memory usage critical");
                let due = {
                    let mut last = self.last_critical_cleanup.lock();
                    let due = last
                        .map(|at| at.elapsed() >= self.config.cleanup.cooldown)
                        .unwrap_or(true);
                    if due {
                        *last = Some(Instant::now());
                    }
                    due
                };
                if due {
                    self.coordinator.force_cleanup().await;
                } else {
                    tracing::debug!("critical tick within cleanup cooldown; skipping");
                }
            }
        }
    }
}

pub struct MemoryHealthService {
    shared: Arc<ServiceShared>,
    db_monitor: Arc<DatabaseOperationMemoryMonitor>,
    analyzer: Arc<HeapSnapshotAnalyzer>,
    scheduler: Mutex<Option<SnapshotScheduler>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl MemoryHealthService {
    /// Construct against the host process with no GC capability.
    pub fn new(config: MemoryHealthConfig) -> Result<Self> {
        let stats_source: Arc<dyn MemoryStatsSource> =
            Arc::new(SystemMemorySource::new(config.sampler.heap_limit_bytes)?);
        Self::with_parts(config, stats_source, Arc::new(NoopGc))
    }

    /// Construct with an injected stats source and GC capability.
    pub fn with_parts(
        config: MemoryHealthConfig,
        stats_source: Arc<dyn MemoryStatsSource>,
        gc: Arc<dyn GcCapability>,
    ) -> Result<Self> {
        config.validate()?;
        let policy = ThresholdPolicy::new(
            config.thresholds.warning_ratio,
            config.thresholds.critical_ratio,
        )?;
        let coordinator =
            EmergencyCleanupCoordinator::new(config.cleanup.clone(), stats_source.clone(), gc);
        let db_monitor = Arc::new(DatabaseOperationMemoryMonitor::new(
            config.database.clone(),
            stats_source.clone(),
        ));
        let analyzer = Arc::new(HeapSnapshotAnalyzer::new(
            config.snapshot.clone(),
            stats_source.clone(),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            shared: Arc::new(ServiceShared {
                spikes: Mutex::new(MemorySpikeDetector::new(config.spike.clone())),
                history: Mutex::new(VecDeque::with_capacity(config.sampler.history_cap)),
                policy,
                stats_source,
                coordinator,
                level: Mutex::new(MemoryLevel::Normal),
                last_critical_cleanup: Mutex::new(None),
                config,
            }),
            db_monitor,
            analyzer,
            scheduler: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Start the periodic sampling tick and the snapshot scheduler.
    /// Calling twice is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval_duration = shared.config.sampler.interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_duration);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => shared.tick().await,
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        self.tasks.lock().push(handle);

        let escalating = Arc::clone(&self.shared);
        *self.scheduler.lock() = Some(SnapshotScheduler::start(
            Arc::clone(&self.analyzer),
            Some(Arc::new(move |comparison| {
                tracing::error!(
                    risk = ?comparison.risk_level,
                    "scheduled heap analysis escalated; requesting cleanup"
                );
                let shared = Arc::clone(&escalating);
                tokio::spawn(async move {
                    shared.coordinator.force_cleanup().await;
                });
            })),
        ));
        tracing::info!("memory health service started");
    }

    // --- registration surface -------------------------------------------

    pub fn coordinator(&self) -> &EmergencyCleanupCoordinator {
        &self.shared.coordinator
    }

    pub fn register_cleanup_target(&self, target: Arc<dyn CleanupTarget>) {
        self.shared.coordinator.register(target);
    }

    pub fn set_pool(&self, pool: Arc<dyn PoolMaintenance>) {
        self.shared.coordinator.set_pool(pool);
    }

    pub fn database_monitor(&self) -> Arc<DatabaseOperationMemoryMonitor> {
        Arc::clone(&self.db_monitor)
    }

    pub fn snapshot_analyzer(&self) -> Arc<HeapSnapshotAnalyzer> {
        Arc::clone(&self.analyzer)
    }

    // --- read-only report surface ---------------------------------------

    pub fn current_status(&self) -> MemoryStatusReport {
        let sample = self.shared.history.lock().back().cloned();
        MemoryStatusReport {
            usage_ratio: sample.as_ref().map(|s| s.usage_ratio()).unwrap_or(0.0),
            sample,
            level: *self.shared.level.lock(),
            warning_ratio: self.shared.policy.warning_ratio(),
            critical_ratio: self.shared.policy.critical_ratio(),
            unresolved_spikes: self.shared.spikes.lock().statistics().unresolved,
        }
    }

    pub fn history(&self, window: Duration) -> Vec<MemorySample> {
        let cutoff = chrono::TimeDelta::from_std(window)
            .ok()
            .and_then(|w| chrono::Utc::now().checked_sub_signed(w));
        self.shared
            .history
            .lock()
            .iter()
            .filter(|s| cutoff.map_or(true, |c| s.timestamp >= c))
            .cloned()
            .collect()
    }

    pub fn recent_spikes(&self, window: Duration) -> Vec<MemorySpike> {
        self.shared.spikes.lock().recent_spikes(window)
    }

    pub fn spike_statistics(&self) -> SpikeStatistics {
        self.shared.spikes.lock().statistics()
    }

    pub fn database_report(&self) -> DatabaseReport {
        self.db_monitor.report()
    }

    pub fn heap_analysis(&self) -> HeapAnalysisReport {
        self.analyzer.analysis()
    }

    pub fn configuration(&self) -> MemoryHealthConfig {
        self.shared.config.clone()
    }

    pub fn last_cleanup_report(&self) -> Option<CleanupReport> {
        self.shared.coordinator.last_report()
    }

    // --- mutating operations --------------------------------------------

    pub async fn trigger_snapshot(&self, reason: &str) -> Result<HeapSnapshotRecord> {
        self.analyzer.capture(reason).await
    }

    /// Fails with [`crate::Error::GcUnavailable`] when no capability exists.
    pub fn trigger_gc(&self) -> Result<()> {
        self.shared.coordinator.request_gc()
    }

    pub async fn emergency_cleanup(&self) -> CleanupReport {
        self.shared.coordinator.force_cleanup().await
    }

    /// Run one sampling tick immediately. Used by hosts that drive the
    /// cadence themselves and by tests.
    pub async fn tick_now(&self) {
        self.shared.tick().await;
    }

    /// Cancel every periodic task. Idempotent and safe from exit handlers.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        if let Some(scheduler) = self.scheduler.lock().take() {
            scheduler.shutdown();
        }
        tracing::info!("memory health service stopped");
    }
}

impl Drop for MemoryHealthService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

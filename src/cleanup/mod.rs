//! Emergency cleanup coordination.
//!
//! The coordinator owns an explicit registry of externally registered
//! mutable collections and cascades mitigation when invoked: clear every
//! registered target (failures isolated per action), trim the connection
//! pool to its minimum, request GC cycles when the capability exists, and
//! report freed bytes. `force_cleanup` is non-throwing and single-flight:
//! overlapping callers collapse into one execution and observe the same
//! report.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::CleanupConfig;
use crate::error::{Error, Result};
use crate::pool::PoolMaintenance;
use crate::sampler::{MemorySample, MemoryStatsSource};

/// A growable in-memory collection a collaborator registers at startup.
/// The coordinator holds the handle only and invokes `clear` during
/// cleanup; `clear` returns the number of entries released.
pub trait CleanupTarget: Send + Sync {
    fn name(&self) -> &str;
    fn clear(&self) -> Result<usize>;
}

/// Host GC hook, probed once at construction rather than checked ad hoc.
/// Absence is a capability fact, not an error.
pub trait GcCapability: Send + Sync {
    fn available(&self) -> bool;
    fn trigger(&self) -> Result<()>;
}

/// Default capability for hosts without a collector hook.
pub struct NoopGc;

impl GcCapability for NoopGc {
    fn available(&self) -> bool {
        false
    }

    fn trigger(&self) -> Result<()> {
        Err(Error::GcUnavailable)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupAction {
    pub name: String,
    pub entries_cleared: usize,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

/// Produced per invocation; transient, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupReport {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub before: MemorySample,
    pub after: MemorySample,
    pub freed_bytes: i64,
    pub actions: Vec<CleanupAction>,
}

type SharedCleanup = Shared<BoxFuture<'static, CleanupReport>>;

struct CoordinatorInner {
    config: CleanupConfig,
    stats_source: Arc<dyn MemoryStatsSource>,
    gc: Arc<dyn GcCapability>,
    gc_available: bool,
    targets: RwLock<Vec<Arc<dyn CleanupTarget>>>,
    pool: RwLock<Option<Arc<dyn PoolMaintenance>>>,
    inflight: tokio::sync::Mutex<Option<SharedCleanup>>,
    last_report: Mutex<Option<CleanupReport>>,
}

#[derive(Clone)]
pub struct EmergencyCleanupCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl EmergencyCleanupCoordinator {
    pub fn new(
        config: CleanupConfig,
        stats_source: Arc<dyn MemoryStatsSource>,
        gc: Arc<dyn GcCapability>,
    ) -> Self {
        let gc_available = gc.available();
        if !gc_available {
            tracing::info!("no gc capability present; cleanup will rely on trims");
        }
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                stats_source,
                gc,
                gc_available,
                targets: RwLock::new(Vec::new()),
                pool: RwLock::new(None),
                inflight: tokio::sync::Mutex::new(None),
                last_report: Mutex::new(None),
            }),
        }
    }

    /// Register a collaborator's collection. Later registrations with the
    /// same name replace the earlier handle.
    pub fn register(&self, target: Arc<dyn CleanupTarget>) {
        let mut targets = self.inner.targets.write();
        targets.retain(|t| t.name() != target.name());
        tracing::debug!(target = target.name(), "cleanup target registered");
        targets.push(target);
    }

    pub fn unregister(&self, name: &str) {
        self.inner.targets.write().retain(|t| t.name() != name);
    }

    pub fn set_pool(&self, pool: Arc<dyn PoolMaintenance>) {
        *self.inner.pool.write() = Some(pool);
    }

    pub fn gc_available(&self) -> bool {
        self.inner.gc_available
    }

    /// Explicit GC request; fails distinctly when no capability exists.
    pub fn request_gc(&self) -> Result<()> {
        if !self.inner.gc_available {
            return Err(Error::GcUnavailable);
        }
        self.inner.gc.trigger()
    }

    pub fn last_report(&self) -> Option<CleanupReport> {
        self.inner.last_report.lock().clone()
    }

    /// Run the full mitigation cascade once.
    pub async fn perform_cleanup(&self) -> CleanupReport {
        CoordinatorInner::perform(Arc::clone(&self.inner)).await
    }

    /// Non-throwing, single-flight cleanup: concurrent invocations collapse
    /// into one `perform_cleanup` execution and share its report.
    pub async fn force_cleanup(&self) -> CleanupReport {
        let fut = {
            let mut inflight = self.inner.inflight.lock().await;
            match inflight.as_ref() {
                Some(fut) => fut.clone(),
                None => {
                    let inner = Arc::clone(&self.inner);
                    // The future clears the slot itself before yielding the
                    // report; a caller cancelled mid-await cannot strand a
                    // completed execution in the slot.
                    let fut: SharedCleanup = async move {
                        let report = CoordinatorInner::perform(Arc::clone(&inner)).await;
                        *inner.inflight.lock().await = None;
                        report
                    }
                    .boxed()
                    .shared();
                    *inflight = Some(fut.clone());
                    fut
                }
            }
        };
        fut.await
    }
}

impl CoordinatorInner {
    async fn perform(inner: Arc<Self>) -> CleanupReport {
        let started = Instant::now();
        let started_at = Utc::now();
        let before = inner.sample_or_empty();
        let mut actions = Vec::new();

        tracing::warn!(
            heap_used = before.heap_used,
            "emergency cleanup started"
        );

        // Clear registered collections. Per-target failures are isolated:
        // log, record, continue.
        let targets: Vec<Arc<dyn CleanupTarget>> = inner.targets.read().clone();
        for target in targets {
            let timestamp = Utc::now();
            match target.clear() {
                Ok(entries_cleared) => {
                    tracing::info!(
                        target = target.name(),
                        entries_cleared,
                        "cleanup target cleared"
                    );
                    actions.push(CleanupAction {
                        name: target.name().to_string(),
                        entries_cleared,
                        timestamp,
                        success: true,
                        error: None,
                    });
                }
                Err(e) => {
                    tracing::warn!(target = target.name(), error = %e, "cleanup action failed");
                    actions.push(CleanupAction {
                        name: target.name().to_string(),
                        entries_cleared: 0,
                        timestamp,
                        success: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        // Trim the pool back to its minimum footprint.
        let pool = inner.pool.read().clone();
        if let Some(pool) = pool {
            let trimmed = pool.trim_to_min().await;
            actions.push(CleanupAction {
                name: "connection_pool".to_string(),
                entries_cleared: trimmed,
                timestamp: Utc::now(),
                success: true,
                error: None,
            });
        }

        actions.push(inner.collect_garbage());

        let after = inner.sample_or_empty();
        let freed_bytes = before.heap_used as i64 - after.heap_used as i64;
        let report = CleanupReport {
            id: Uuid::new_v4(),
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
            before,
            after,
            freed_bytes,
            actions,
        };
        tracing::warn!(
            freed_bytes,
            duration_ms = report.duration_ms,
            actions = report.actions.len(),
            "emergency cleanup finished"
        );
        *inner.last_report.lock() = Some(report.clone());
        report
    }

    fn collect_garbage(&self) -> CleanupAction {
        let timestamp = Utc::now();
        if self.gc_available {
            let mut last_error = None;
            for _ in 0..self.config.gc_cycles.max(1) {
                if let Err(e) = self.gc.trigger() {
                    last_error = Some(e.to_string());
                }
            }
            CleanupAction {
                name: "gc".to_string(),
                entries_cleared: 0,
                timestamp,
                success: last_error.is_none(),
                error: last_error,
            }
        } else if self.config.alloc_fallback {
            // Bounded allocate-then-release pass that nudges the allocator
            // into returning free pages. Last resort, strictly bounded by
            // configuration, and skipped entirely by default.
            for _ in 0..self.config.fallback_chunks {
                let chunk = vec![0u8; self.config.fallback_chunk_bytes];
                std::hint::black_box(&chunk);
                drop(chunk);
            }
            CleanupAction {
                name: "alloc_fallback".to_string(),
                entries_cleared: 0,
                timestamp,
                success: true,
                error: None,
            }
        } else {
            CleanupAction {
                name: "gc_skipped".to_string(),
                entries_cleared: 0,
                timestamp,
                success: true,
                error: None,
            }
        }
    }

    fn sample_or_empty(&self) -> MemorySample {
        self.stats_source.sample().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "stats source failed during cleanup");
            MemorySample {
                timestamp: Utc::now(),
                heap_used: 0,
                heap_total: 0,
                external: 0,
                resident: 0,
                tag: Some("stats-unavailable".to_string()),
            }
        })
    }
}

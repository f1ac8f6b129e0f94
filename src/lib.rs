//! MemSentinel - memory-health monitoring and mitigation for long-running
//! services.
//!
//! The engine watches a process the way an operator would:
//! - sampler: periodic memory readings classified against warning/critical
//!   thresholds
//! - spike: rolling-window detection of sudden heap jumps
//! - database: per-operation memory profiling around data-store calls
//! - pool: a bounded connection pool with idle/TTL eviction
//! - snapshot: slow-cadence heap dumps with leak-pattern analysis
//! - cleanup: an emergency coordinator that cascades mitigation when
//!   limits are breached
//!
//! The composition root in `service` wires these together and exposes the
//! read-only reports a routing layer serializes. The engine performs no
//! transport I/O itself; its only on-disk state is the rotated heap
//! snapshot directory.

pub mod cleanup;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod pool;
pub mod sampler;
pub mod service;
pub mod snapshot;
pub mod spike;

// Re-export commonly used types for easy access
pub use cleanup::{
    CleanupAction, CleanupReport, CleanupTarget, EmergencyCleanupCoordinator, GcCapability, NoopGc,
};
pub use config::MemoryHealthConfig;
pub use database::{
    AggregatedOperationStats, DatabaseOperationMemoryMonitor, DatabaseReport, OperationCategory,
    OperationProfile,
};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use pool::{
    ConnectionFactory, ConnectionPoolManager, PoolMaintenance, PoolStatus, PooledConnection,
};
pub use sampler::{
    ManualMemorySource, MemoryLevel, MemorySample, MemoryStatsSource, SystemMemorySource,
    ThresholdPolicy,
};
pub use service::{MemoryHealthService, MemoryStatusReport, ReportEnvelope};
pub use snapshot::{
    HeapAnalysisReport, HeapComparison, HeapSnapshotAnalyzer, HeapSnapshotRecord, LeakSeverity,
    SnapshotScheduler, SuspectedLeak,
};
pub use spike::{MemorySpike, MemorySpikeDetector, SpikeSeverity, SpikeStatistics};

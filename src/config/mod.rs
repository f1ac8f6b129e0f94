//! Configuration for the memory-health engine.
//!
//! All tunables the engine consumes live here: threshold ratios, spike
//! detection, snapshot retention and leak tiers, per-category database
//! thresholds, and pool sizing. Everything is adjustable from a TOML file
//! without code changes; `validate()` runs once at startup and invalid
//! ordering (warning >= critical) is fatal.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration consumed by the composition root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryHealthConfig {
    pub thresholds: ThresholdConfig,
    pub sampler: SamplerConfig,
    pub spike: SpikeConfig,
    pub database: DbMonitorConfig,
    pub pool: PoolOptions,
    pub snapshot: SnapshotConfig,
    pub cleanup: CleanupConfig,
}

impl Default for MemoryHealthConfig {
    fn default() -> Self {
        Self {
            thresholds: ThresholdConfig::default(),
            sampler: SamplerConfig::default(),
            spike: SpikeConfig::default(),
            database: DbMonitorConfig::default(),
            pool: PoolOptions::default(),
            snapshot: SnapshotConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

/// Heap usage fractions that classify a sample as Warning or Critical.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub warning_ratio: f64,
    pub critical_ratio: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            warning_ratio: 0.60,
            critical_ratio: 0.75,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Cadence of the periodic sampling tick
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Capped sample history length
    pub history_cap: usize,
    /// Process memory budget the ratios are computed against.
    /// `None` means the host's total memory.
    pub heap_limit_bytes: Option<u64>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            history_cap: 360,
            heap_limit_bytes: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpikeConfig {
    /// Minimum heap delta between consecutive samples to count as a spike
    pub threshold_bytes: u64,
    /// Ring buffer length of recent samples kept for baseline tracking
    pub window: usize,
    /// Capped spike log length
    pub log_cap: usize,
    /// A spike still above its baseline after this long stays unresolved
    #[serde(with = "humantime_serde")]
    pub resolution_timeout: Duration,
}

impl Default for SpikeConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: 50 * 1024 * 1024,
            window: 60,
            log_cap: 25,
            resolution_timeout: Duration::from_secs(300),
        }
    }
}

/// Per-category byte thresholds for database operation alerts.
/// Point reads/writes are expected to be cheap; bulk work and migrations
/// get proportionally larger budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbMonitorConfig {
    pub history_cap: usize,
    pub breach_log_cap: usize,
    pub point_threshold_bytes: u64,
    pub bulk_threshold_bytes: u64,
    pub migration_threshold_bytes: u64,
}

impl Default for DbMonitorConfig {
    fn default() -> Self {
        Self {
            history_cap: 500,
            breach_log_cap: 50,
            point_threshold_bytes: 10 * 1024 * 1024,
            bulk_threshold_bytes: 50 * 1024 * 1024,
            migration_threshold_bytes: 100 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    pub min_connections: usize,
    pub max_connections: usize,
    /// Waiters beyond this queue depth fail immediately
    pub max_waiters: usize,
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Hard lifetime cap; connections past this age are recycled
    /// regardless of activity
    #[serde(with = "humantime_serde")]
    pub connection_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    pub metrics_cap: usize,
    pub event_cap: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: Self::default_max_connections(),
            max_waiters: 64,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(180),
            connection_ttl: Duration::from_secs(1800),
            sweep_interval: Duration::from_secs(15),
            metrics_cap: 100,
            event_cap: 50,
        }
    }
}

impl PoolOptions {
    /// Scale the default pool ceiling with the host's core count.
    fn default_max_connections() -> usize {
        match num_cpus::get() {
            1..=2 => 10,
            3..=4 => 20,
            5..=8 => 40,
            _ => 60,
        }
    }
}

/// Leak-severity tiers in MB/hour. Empirically tuned; treat as tunable
/// configuration rather than fixed truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeakTiers {
    pub low_mb_per_hour: f64,
    pub medium_mb_per_hour: f64,
    pub high_mb_per_hour: f64,
    pub critical_mb_per_hour: f64,
}

impl Default for LeakTiers {
    fn default() -> Self {
        Self {
            low_mb_per_hour: 10.0,
            medium_mb_per_hour: 25.0,
            high_mb_per_hour: 50.0,
            critical_mb_per_hour: 100.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Directory owning the heap-dump files; the only on-disk state
    pub directory: PathBuf,
    /// Retention count K; the oldest file+record rotate out beyond it
    pub retention: usize,
    /// Scheduler cadence; capture visibly pauses the process, keep it slow
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    pub leak_tiers: LeakTiers,
    /// External growth must exceed heap growth by this factor to flag
    /// a stream/buffer-leak pattern
    pub external_ratio: f64,
    /// Steady-leak band, MB/hour
    pub steady_min_mb_per_hour: f64,
    pub steady_max_mb_per_hour: f64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data/heap-snapshots"),
            retention: 5,
            interval: Duration::from_secs(6 * 3600),
            leak_tiers: LeakTiers::default(),
            external_ratio: 1.5,
            steady_min_mb_per_hour: 5.0,
            steady_max_mb_per_hour: 100.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// GC cycles requested per cleanup when the capability is present
    pub gc_cycles: u32,
    /// Minimum gap between coordinator invocations from Critical ticks
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    /// Allocate-then-release fallback used only when no GC capability
    /// exists. Strictly bounded and off by default; the pattern has a
    /// history of causing more pressure than it relieves.
    pub alloc_fallback: bool,
    pub fallback_chunks: usize,
    pub fallback_chunk_bytes: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            gc_cycles: 3,
            cooldown: Duration::from_secs(60),
            alloc_fallback: false,
            fallback_chunks: 4,
            fallback_chunk_bytes: 8 * 1024 * 1024,
        }
    }
}

impl MemoryHealthConfig {
    /// Load from a TOML file and validate.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| Error::Configuration(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants that would otherwise surface as runtime
    /// misbehavior. Called once at startup; failure is fatal.
    pub fn validate(&self) -> Result<()> {
        if self.thresholds.warning_ratio >= self.thresholds.critical_ratio {
            return Err(Error::Configuration(format!(
                "warning ratio {} must be below critical ratio {}",
                self.thresholds.warning_ratio, self.thresholds.critical_ratio
            )));
        }
        if !(0.0..=1.0).contains(&self.thresholds.warning_ratio)
            || !(0.0..=1.0).contains(&self.thresholds.critical_ratio)
        {
            return Err(Error::Configuration(
                "threshold ratios must be within [0, 1]".into(),
            ));
        }
        if self.pool.min_connections > self.pool.max_connections {
            return Err(Error::Configuration(format!(
                "pool min {} exceeds max {}",
                self.pool.min_connections, self.pool.max_connections
            )));
        }
        if self.pool.max_connections == 0 {
            return Err(Error::Configuration("pool max must be at least 1".into()));
        }
        if self.snapshot.retention == 0 {
            return Err(Error::Configuration(
                "snapshot retention must be at least 1".into(),
            ));
        }
        if self.spike.threshold_bytes == 0 {
            return Err(Error::Configuration(
                "spike threshold must be non-zero".into(),
            ));
        }
        let tiers = &self.snapshot.leak_tiers;
        if !(tiers.low_mb_per_hour < tiers.medium_mb_per_hour
            && tiers.medium_mb_per_hour < tiers.high_mb_per_hour
            && tiers.high_mb_per_hour < tiers.critical_mb_per_hour)
        {
            return Err(Error::Configuration(
                "leak tiers must be strictly increasing".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        MemoryHealthConfig::default().validate().unwrap();
    }

    #[test]
    fn inverted_thresholds_are_fatal() {
        let mut config = MemoryHealthConfig::default();
        config.thresholds.warning_ratio = 0.8;
        config.thresholds.critical_ratio = 0.6;
        assert!(matches!(
            config.validate(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn equal_thresholds_are_fatal() {
        let mut config = MemoryHealthConfig::default();
        config.thresholds.warning_ratio = 0.75;
        config.thresholds.critical_ratio = 0.75;
        assert!(config.validate().is_err());
    }

    #[test]
    fn pool_min_above_max_is_fatal() {
        let mut config = MemoryHealthConfig::default();
        config.pool.min_connections = 50;
        config.pool.max_connections = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trip() {
        let config = MemoryHealthConfig::default();
        let raw = toml::to_string(&config).unwrap();
        let parsed: MemoryHealthConfig = toml::from_str(&raw).unwrap();
        parsed.validate().unwrap();
        assert_eq!(
            parsed.thresholds.warning_ratio,
            config.thresholds.warning_ratio
        );
    }
}

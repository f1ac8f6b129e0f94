//! End-to-end tests wiring the full memory-health engine together: service,
//! pool, database monitor, snapshot analyzer, and cleanup coordinator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_test::assert_ok;

use memsentinel::config::{MemoryHealthConfig, PoolOptions, SnapshotConfig};
use memsentinel::{
    CleanupTarget, ConnectionFactory, ConnectionPoolManager, Error, ManualMemorySource,
    MemoryHealthService, MemoryLevel, NoopGc, OperationCategory, PoolMaintenance, Result,
};

const MB: u64 = 1024 * 1024;

struct StubFactory {
    created: Arc<AtomicUsize>,
}

struct StubConn;

#[async_trait]
impl ConnectionFactory for StubFactory {
    type Connection = StubConn;

    async fn create(&self) -> Result<StubConn> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(StubConn)
    }

    async fn destroy(&self, _conn: StubConn) {}
}

struct SessionCache {
    entries: Mutex<Vec<u64>>,
    source: Arc<ManualMemorySource>,
    freed_to: u64,
}

impl CleanupTarget for SessionCache {
    fn name(&self) -> &str {
        "session-cache"
    }

    fn clear(&self) -> Result<usize> {
        let mut entries = self.entries.lock();
        let n = entries.len();
        entries.clear();
        self.source.set_heap_used(self.freed_to);
        Ok(n)
    }
}

fn test_config(dir: &std::path::Path) -> MemoryHealthConfig {
    let mut config = MemoryHealthConfig::default();
    config.snapshot = SnapshotConfig {
        directory: dir.to_path_buf(),
        retention: 3,
        ..SnapshotConfig::default()
    };
    config
}

#[tokio::test]
async fn critical_pressure_cascades_through_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(ManualMemorySource::new(100 * MB, 1000 * MB));
    let service = MemoryHealthService::with_parts(
        test_config(dir.path()),
        source.clone(),
        Arc::new(NoopGc),
    )
    .unwrap();

    // Bounded pool wired into the coordinator as the trim target.
    let created = Arc::new(AtomicUsize::new(0));
    let pool = Arc::new(
        ConnectionPoolManager::new(
            PoolOptions {
                min_connections: 1,
                max_connections: 4,
                ..PoolOptions::default()
            },
            StubFactory {
                created: created.clone(),
            },
        )
        .await
        .unwrap(),
    );
    service.set_pool(pool.clone() as Arc<dyn PoolMaintenance>);

    let cache = Arc::new(SessionCache {
        entries: Mutex::new(vec![0; 250]),
        source: source.clone(),
        freed_to: 300 * MB,
    });
    service.register_cleanup_target(cache.clone());

    // Fatten the pool, then drive memory past critical.
    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    let c = pool.acquire().await.unwrap();
    pool.release(a).await;
    pool.release(b).await;
    pool.release(c).await;
    assert_eq!(created.load(Ordering::SeqCst), 3);

    source.set_heap_used(800 * MB);
    service.tick_now().await;

    let status = service.current_status();
    assert_eq!(status.level, MemoryLevel::Critical);

    let report = service.last_cleanup_report().expect("cleanup ran");
    assert_eq!(report.freed_bytes, (500 * MB) as i64);
    let cache_action = report
        .actions
        .iter()
        .find(|a| a.name == "session-cache")
        .expect("cache cleared");
    assert_eq!(cache_action.entries_cleared, 250);
    let pool_action = report
        .actions
        .iter()
        .find(|a| a.name == "connection_pool")
        .expect("pool trimmed");
    assert!(pool_action.success);
    assert!(cache.entries.lock().is_empty());
    // Idle connections trimmed back to min.
    assert_eq!(pool.status().idle, 1);

    pool.shutdown().await;
    service.shutdown();
}

#[tokio::test]
async fn spike_then_recovery_is_tracked_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(ManualMemorySource::new(100 * MB, 1000 * MB));
    let service = MemoryHealthService::with_parts(
        test_config(dir.path()),
        source.clone(),
        Arc::new(NoopGc),
    )
    .unwrap();

    for heap in [100, 100, 100] {
        source.set_heap_used(heap * MB);
        service.tick_now().await;
    }
    source.set_heap_used(180 * MB);
    service.tick_now().await;

    let spikes = service.recent_spikes(Duration::from_secs(600));
    assert_eq!(spikes.len(), 1);
    assert_eq!(spikes[0].delta_bytes, 80 * MB);
    assert_eq!(service.current_status().unresolved_spikes, 1);

    source.set_heap_used(95 * MB);
    service.tick_now().await;
    assert_eq!(service.current_status().unresolved_spikes, 0);

    service.shutdown();
}

#[tokio::test]
async fn database_profiles_feed_the_service_report() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(ManualMemorySource::new(100 * MB, 1000 * MB));
    let service = MemoryHealthService::with_parts(
        test_config(dir.path()),
        source.clone(),
        Arc::new(NoopGc),
    )
    .unwrap();
    let monitor = service.database_monitor();

    let rows: std::result::Result<Vec<u32>, String> = monitor
        .monitor_operation("list_sessions", OperationCategory::BulkRead, 256, async {
            Ok(vec![1, 2, 3])
        })
        .await;
    assert_eq!(rows.unwrap().len(), 3);

    let failure: std::result::Result<(), String> = monitor
        .monitor_operation("update_session", OperationCategory::PointWrite, 64, async {
            Err("deadlock detected".to_string())
        })
        .await;
    assert_eq!(failure.unwrap_err(), "deadlock detected");

    let report = service.database_report();
    assert_eq!(report.total_operations, 2);
    assert_eq!(report.failed_operations, 1);
    assert_eq!(report.highest_failure_rate[0].key, "update_session");

    service.shutdown();
}

#[tokio::test]
async fn snapshot_trigger_rotates_and_reports() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(ManualMemorySource::new(100 * MB, 1000 * MB));
    let service = MemoryHealthService::with_parts(
        test_config(dir.path()),
        source.clone(),
        Arc::new(NoopGc),
    )
    .unwrap();

    for i in 0..4u64 {
        source.set_heap_used((100 + i * 30) * MB);
        let record = assert_ok!(service.trigger_snapshot("manual").await);
        assert!(record.file_path.exists());
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let analysis = service.heap_analysis();
    assert_eq!(analysis.snapshots.len(), 3);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 3);
    assert_eq!(analysis.failed_captures, 0);

    // GC is a capability fact; without one the explicit trigger fails
    // distinctly while the rest of the surface keeps working.
    assert!(matches!(service.trigger_gc(), Err(Error::GcUnavailable)));

    service.shutdown();
}

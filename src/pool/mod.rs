//! Bounded connection pool with idle/TTL eviction and FIFO waiters.
//!
//! The pool sits over a [`ConnectionFactory`] and never holds more than
//! `max_connections` live connections. Saturated acquires queue in a bounded
//! FIFO and fail with [`Error::PoolExhausted`] once `acquire_timeout`
//! elapses. A background sweep evicts idle connections past `idle_timeout`
//! down to `min_connections` and recycles any connection past its hard TTL
//! regardless of activity; active connections past TTL are marked for
//! eviction and destroyed at release. Metrics and eviction events land in
//! capped ring buffers so the pool can never become a leak itself.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::PoolOptions;
use crate::error::{Error, Result};

/// Produces and disposes of pooled connections.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn create(&self) -> Result<Self::Connection>;
    async fn destroy(&self, conn: Self::Connection);
}

/// Pool-facing maintenance surface used by the emergency-cleanup
/// coordinator: trim down to the configured minimum, report how many
/// connections were destroyed.
#[async_trait]
pub trait PoolMaintenance: Send + Sync {
    async fn trim_to_min(&self) -> usize;
}

/// A connection checked out of the pool. Return it with
/// [`ConnectionPoolManager::release`], or [`ConnectionPoolManager::discard`]
/// if it turned out broken.
pub struct PooledConnection<C> {
    pub id: u64,
    conn: C,
    created_at: Instant,
}

// Id-only so `C` is not forced to implement Debug.
impl<C> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;
    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolEventKind {
    Exhausted,
    WaiterOverflow,
    IdleEvicted,
    TtlEvicted,
    TtlMarkedActive,
    CreateFailed,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: PoolEventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolMetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub idle: usize,
    pub active: usize,
    pub waiting: usize,
    pub total_created: u64,
    pub total_destroyed: u64,
    pub timeouts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub idle: usize,
    pub active: usize,
    pub waiting: usize,
    pub min: usize,
    pub max: usize,
}

struct IdleEntry<C> {
    id: u64,
    conn: C,
    created_at: Instant,
    last_used_at: Instant,
}

struct ActiveEntry {
    created_at: Instant,
    evicting: bool,
}

struct Handoff<C> {
    id: u64,
    conn: C,
    created_at: Instant,
}

struct Waiter<C> {
    id: u64,
    tx: oneshot::Sender<Handoff<C>>,
}

struct PoolState<C> {
    idle: VecDeque<IdleEntry<C>>,
    active: HashMap<u64, ActiveEntry>,
    waiters: VecDeque<Waiter<C>>,
    creating: usize,
    next_waiter_id: u64,
}

impl<C> PoolState<C> {
    fn total(&self) -> usize {
        self.idle.len() + self.active.len() + self.creating
    }
}

struct PoolInner<F: ConnectionFactory> {
    factory: F,
    opts: PoolOptions,
    state: Mutex<PoolState<F::Connection>>,
    metrics: Mutex<VecDeque<PoolMetricsSnapshot>>,
    events: Mutex<VecDeque<PoolEvent>>,
    next_conn_id: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
    timeouts: AtomicU64,
    closed: AtomicBool,
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn record_event(&self, kind: PoolEventKind, detail: impl Into<String>) {
        let mut events = self.events.lock();
        events.push_back(PoolEvent {
            timestamp: Utc::now(),
            kind,
            detail: detail.into(),
        });
        while events.len() > self.opts.event_cap {
            events.pop_front();
        }
    }

    async fn destroy_conn(&self, conn: F::Connection) {
        self.factory.destroy(conn).await;
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot_metrics(&self) {
        let (idle, active, waiting) = {
            let state = self.state.lock();
            (state.idle.len(), state.active.len(), state.waiters.len())
        };
        let mut metrics = self.metrics.lock();
        metrics.push_back(PoolMetricsSnapshot {
            timestamp: Utc::now(),
            idle,
            active,
            waiting,
            total_created: self.created.load(Ordering::Relaxed),
            total_destroyed: self.destroyed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        });
        while metrics.len() > self.opts.metrics_cap {
            metrics.pop_front();
        }
    }
}

enum AcquirePlan<C> {
    Ready(IdleEntry<C>),
    Create,
    Wait(u64, oneshot::Receiver<Handoff<C>>),
    Reject,
}

pub struct ConnectionPoolManager<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<F: ConnectionFactory> ConnectionPoolManager<F> {
    /// Build the pool, prewarm it to `min_connections`, and start the
    /// background eviction sweep.
    pub async fn new(opts: PoolOptions, factory: F) -> Result<Self> {
        if opts.min_connections > opts.max_connections {
            return Err(Error::Configuration(format!(
                "pool min {} exceeds max {}",
                opts.min_connections, opts.max_connections
            )));
        }

        let inner = Arc::new(PoolInner {
            factory,
            opts: opts.clone(),
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                active: HashMap::new(),
                waiters: VecDeque::new(),
                creating: 0,
                next_waiter_id: 0,
            }),
            metrics: Mutex::new(VecDeque::new()),
            events: Mutex::new(VecDeque::new()),
            next_conn_id: AtomicU64::new(0),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let pool = Self {
            inner,
            sweep_handle: Mutex::new(None),
        };
        pool.refill_to_min().await;

        let sweep_inner = Arc::clone(&pool.inner);
        let interval_duration = opts.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_duration);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if sweep_inner.closed.load(Ordering::Relaxed) {
                    break;
                }
                Self::sweep(&sweep_inner).await;
            }
        });
        *pool.sweep_handle.lock() = Some(handle);

        Ok(pool)
    }

    /// Check a connection out. Returns an idle one, creates up to `max`,
    /// or queues FIFO until a release or the acquire timeout.
    pub async fn acquire(&self) -> Result<PooledConnection<F::Connection>> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Relaxed) {
            return Err(Error::PoolClosed);
        }
        let started = Instant::now();

        let mut expired = Vec::new();
        let plan = {
            let mut state = inner.state.lock();
            let mut ready = None;
            while let Some(entry) = state.idle.pop_front() {
                if entry.created_at.elapsed() >= inner.opts.connection_ttl {
                    expired.push(entry);
                    continue;
                }
                ready = Some(entry);
                break;
            }
            if let Some(entry) = ready {
                state.active.insert(
                    entry.id,
                    ActiveEntry {
                        created_at: entry.created_at,
                        evicting: false,
                    },
                );
                AcquirePlan::Ready(entry)
            } else if state.total() < inner.opts.max_connections {
                state.creating += 1;
                AcquirePlan::Create
            } else if state.waiters.len() >= inner.opts.max_waiters {
                AcquirePlan::Reject
            } else {
                let (tx, rx) = oneshot::channel();
                let id = state.next_waiter_id;
                state.next_waiter_id += 1;
                state.waiters.push_back(Waiter { id, tx });
                AcquirePlan::Wait(id, rx)
            }
        };
        for entry in expired {
            inner.record_event(PoolEventKind::TtlEvicted, format!("connection {}", entry.id));
            inner.destroy_conn(entry.conn).await;
        }

        match plan {
            AcquirePlan::Ready(entry) => Ok(PooledConnection {
                id: entry.id,
                conn: entry.conn,
                created_at: entry.created_at,
            }),
            AcquirePlan::Create => match inner.factory.create().await {
                Ok(conn) => {
                    let id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
                    let created_at = Instant::now();
                    {
                        let mut state = inner.state.lock();
                        state.creating -= 1;
                        state.active.insert(
                            id,
                            ActiveEntry {
                                created_at,
                                evicting: false,
                            },
                        );
                    }
                    inner.created.fetch_add(1, Ordering::Relaxed);
                    Ok(PooledConnection {
                        id,
                        conn,
                        created_at,
                    })
                }
                Err(e) => {
                    inner.state.lock().creating -= 1;
                    inner.record_event(PoolEventKind::CreateFailed, e.to_string());
                    Err(e)
                }
            },
            AcquirePlan::Reject => {
                inner.record_event(
                    PoolEventKind::WaiterOverflow,
                    format!("waiter queue at {}", inner.opts.max_waiters),
                );
                inner.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(Error::PoolExhausted { waited_ms: 0 })
            }
            AcquirePlan::Wait(waiter_id, mut rx) => {
                match tokio::time::timeout(inner.opts.acquire_timeout, &mut rx).await {
                    Ok(Ok(handoff)) => Ok(PooledConnection {
                        id: handoff.id,
                        conn: handoff.conn,
                        created_at: handoff.created_at,
                    }),
                    Ok(Err(_)) => Err(Error::PoolClosed),
                    Err(_) => {
                        // Unregister; a concurrent release may already have
                        // handed a connection over, in which case take it.
                        let still_queued = {
                            let mut state = inner.state.lock();
                            match state.waiters.iter().position(|w| w.id == waiter_id) {
                                Some(pos) => {
                                    state.waiters.remove(pos);
                                    true
                                }
                                None => false,
                            }
                        };
                        if !still_queued {
                            if let Ok(handoff) = rx.try_recv() {
                                return Ok(PooledConnection {
                                    id: handoff.id,
                                    conn: handoff.conn,
                                    created_at: handoff.created_at,
                                });
                            }
                        }
                        inner.timeouts.fetch_add(1, Ordering::Relaxed);
                        inner.record_event(PoolEventKind::Exhausted, "acquire timed out");
                        Err(Error::PoolExhausted {
                            waited_ms: started.elapsed().as_millis() as u64,
                        })
                    }
                }
            }
        }
    }

    /// Return a connection. Waiters are served strictly FIFO; a connection
    /// past TTL or flagged for eviction is destroyed instead of reused.
    pub async fn release(&self, conn: PooledConnection<F::Connection>) {
        let inner = &self.inner;
        let PooledConnection {
            id,
            conn,
            created_at,
        } = conn;

        let mut to_destroy = None;
        {
            let mut state = inner.state.lock();
            let evicting = state
                .active
                .remove(&id)
                .map(|entry| entry.evicting)
                .unwrap_or(false);

            if inner.closed.load(Ordering::Relaxed)
                || evicting
                || created_at.elapsed() >= inner.opts.connection_ttl
            {
                to_destroy = Some(conn);
            } else {
                let mut conn = conn;
                loop {
                    match state.waiters.pop_front() {
                        Some(waiter) => {
                            state.active.insert(
                                id,
                                ActiveEntry {
                                    created_at,
                                    evicting: false,
                                },
                            );
                            match waiter.tx.send(Handoff {
                                id,
                                conn,
                                created_at,
                            }) {
                                Ok(()) => break,
                                // Waiter timed out between dequeue and send;
                                // take the connection back and try the next.
                                Err(returned) => {
                                    state.active.remove(&id);
                                    conn = returned.conn;
                                }
                            }
                        }
                        None => {
                            state.idle.push_back(IdleEntry {
                                id,
                                conn,
                                created_at,
                                last_used_at: Instant::now(),
                            });
                            break;
                        }
                    }
                }
            }
        }
        if let Some(conn) = to_destroy {
            inner.record_event(PoolEventKind::TtlEvicted, format!("connection {}", id));
            inner.destroy_conn(conn).await;
        }
    }

    /// Dispose of a connection that should not return to the pool.
    pub async fn discard(&self, conn: PooledConnection<F::Connection>) {
        self.inner.state.lock().active.remove(&conn.id);
        self.inner.destroy_conn(conn.conn).await;
    }

    /// One eviction pass: TTL recycling, idle-timeout eviction down to
    /// `min`, refill to `min`, metrics snapshot. The background task calls
    /// this on `sweep_interval`; it is public so maintenance can force it.
    pub async fn sweep_once(&self) {
        Self::sweep(&self.inner).await;
    }

    async fn sweep(inner: &Arc<PoolInner<F>>) {
        let mut destroy = Vec::new();
        {
            let mut state = inner.state.lock();
            let now = Instant::now();

            // Hard TTL pass over idle connections, unconditional.
            let mut kept = VecDeque::new();
            while let Some(entry) = state.idle.pop_front() {
                if entry.created_at.elapsed() >= inner.opts.connection_ttl {
                    destroy.push((entry, PoolEventKind::TtlEvicted));
                } else {
                    kept.push_back(entry);
                }
            }
            state.idle = kept;

            // Idle-timeout pass, oldest first, down to min.
            while state.idle.len() + state.active.len() > inner.opts.min_connections {
                let front_expired = matches!(
                    state.idle.front(),
                    Some(entry)
                        if now.duration_since(entry.last_used_at) >= inner.opts.idle_timeout
                );
                if !front_expired {
                    break;
                }
                if let Some(entry) = state.idle.pop_front() {
                    destroy.push((entry, PoolEventKind::IdleEvicted));
                }
            }

            // Active connections past TTL get destroyed at release.
            for (id, entry) in state.active.iter_mut() {
                if !entry.evicting && entry.created_at.elapsed() >= inner.opts.connection_ttl {
                    entry.evicting = true;
                    inner.record_event(
                        PoolEventKind::TtlMarkedActive,
                        format!("connection {}", id),
                    );
                }
            }
        }

        for (entry, kind) in destroy {
            inner.record_event(kind, format!("connection {}", entry.id));
            inner.destroy_conn(entry.conn).await;
        }

        Self::refill(inner).await;
        inner.snapshot_metrics();
    }

    async fn refill_to_min(&self) {
        Self::refill(&self.inner).await;
    }

    async fn refill(inner: &Arc<PoolInner<F>>) {
        loop {
            {
                let mut state = inner.state.lock();
                if state.total() >= inner.opts.min_connections
                    || inner.closed.load(Ordering::Relaxed)
                {
                    return;
                }
                state.creating += 1;
            }
            match inner.factory.create().await {
                Ok(conn) => {
                    let id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
                    let now = Instant::now();
                    let mut state = inner.state.lock();
                    state.creating -= 1;
                    state.idle.push_back(IdleEntry {
                        id,
                        conn,
                        created_at: now,
                        last_used_at: now,
                    });
                    inner.created.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    inner.state.lock().creating -= 1;
                    inner.record_event(PoolEventKind::CreateFailed, e.to_string());
                    tracing::warn!(error = %e, "pool refill failed");
                    return;
                }
            }
        }
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            idle: state.idle.len(),
            active: state.active.len(),
            waiting: state.waiters.len(),
            min: self.inner.opts.min_connections,
            max: self.inner.opts.max_connections,
        }
    }

    pub fn metrics(&self) -> Vec<PoolMetricsSnapshot> {
        self.inner.metrics.lock().iter().cloned().collect()
    }

    pub fn events(&self) -> Vec<PoolEvent> {
        self.inner.events.lock().iter().cloned().collect()
    }

    /// Stop the sweep, fail all waiters, destroy every idle connection,
    /// clear all collections. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.sweep_handle.lock().take() {
            handle.abort();
        }

        let (idle, waiters) = {
            let mut state = self.inner.state.lock();
            state.active.clear();
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.waiters),
            )
        };
        // Dropping senders fails every waiter with PoolClosed.
        drop(waiters);
        for entry in idle {
            self.inner.destroy_conn(entry.conn).await;
        }
        self.inner.metrics.lock().clear();
        self.inner.events.lock().clear();
        self.inner.record_event(PoolEventKind::Shutdown, "pool closed");
        tracing::info!("connection pool shut down");
    }
}

#[async_trait]
impl<F: ConnectionFactory> PoolMaintenance for ConnectionPoolManager<F> {
    /// Destroy idle connections beyond `min`, newest last. Used by the
    /// emergency-cleanup coordinator.
    async fn trim_to_min(&self) -> usize {
        let inner = &self.inner;
        let mut destroy = Vec::new();
        {
            let mut state = inner.state.lock();
            while !state.idle.is_empty()
                && state.idle.len() + state.active.len() > inner.opts.min_connections
            {
                if let Some(entry) = state.idle.pop_front() {
                    destroy.push(entry);
                }
            }
        }
        let trimmed = destroy.len();
        for entry in destroy {
            inner.record_event(PoolEventKind::IdleEvicted, format!("connection {}", entry.id));
            inner.destroy_conn(entry.conn).await;
        }
        if trimmed > 0 {
            tracing::info!(trimmed, "pool trimmed to minimum");
        }
        trimmed
    }
}

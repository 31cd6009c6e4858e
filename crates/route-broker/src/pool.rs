//! Reusable data-source connections.
//!
//! The idle list is a LIFO stack behind a mutex; connection I/O never happens
//! while the lock is held. The cap is soft: `acquire` keeps creating workers
//! past `max_threads` and only warns.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use route_core::{ConnectionError, DataConnection, DataConnector};
use route_telemetry::MetricsRecorder;

/// Execution context bound to one data-source connection.
pub struct Worker {
    id: u64,
    conn: Box<dyn DataConnection>,
    last_activity: Instant,
}

impl Worker {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection(&mut self) -> &mut dyn DataConnection {
        self.conn.as_mut()
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("client", &self.conn.client_name())
            .field("last_activity", &self.last_activity)
            .finish()
    }
}

pub struct WorkerPool {
    idle: Mutex<Vec<Worker>>,
    /// Checked-out plus idle workers.
    outstanding: AtomicUsize,
    max_threads: usize,
    connector: Arc<dyn DataConnector>,
    address: String,
    client_name: RwLock<String>,
    next_id: AtomicU64,
    /// Set by `close_all`; later releases close instead of pooling.
    closed: AtomicBool,
    metrics: Arc<MetricsRecorder>,
}

impl WorkerPool {
    pub fn new(
        connector: Arc<dyn DataConnector>,
        address: impl Into<String>,
        max_threads: usize,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
            max_threads,
            connector,
            address: address.into(),
            client_name: RwLock::new(String::from("Route")),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            metrics,
        }
    }

    /// Name new worker connections identify with.
    pub fn set_client_name(&self, name: impl Into<String>) {
        *self.client_name.write() = name.into();
    }

    pub fn client_name(&self) -> String {
        self.client_name.read().clone()
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Pop an idle worker, or open a new connection.
    pub async fn acquire(&self) -> Result<Worker, ConnectionError> {
        let reused = self.idle.lock().pop();
        if let Some(worker) = reused {
            debug!(worker = worker.id, "reusing pooled worker");
            self.metrics.counter_inc("route.pool.reused", &[], 1);
            self.publish_idle();
            return Ok(worker);
        }

        let outstanding = self.outstanding();
        if outstanding >= self.max_threads {
            warn!(outstanding, max_threads = self.max_threads, "thread limit hit, creating worker anyway");
        }

        let conn = self.open().await?;
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.metrics.counter_inc("route.pool.created", &[], 1);
        debug!(worker = id, client = conn.client_name(), "opened worker connection");
        Ok(Worker {
            id,
            conn,
            last_activity: Instant::now(),
        })
    }

    /// Return a worker to the idle pool, or close it when the pool is full.
    pub async fn release(&self, mut worker: Worker) {
        worker.touch();
        if self.closed.load(Ordering::SeqCst) {
            debug!(worker = worker.id, "pool closed, discarding returned worker");
            self.discard(worker).await;
            return;
        }
        let rejected = {
            let mut idle = self.idle.lock();
            if idle.len() < self.max_threads {
                idle.push(worker);
                None
            } else {
                Some(worker)
            }
        };
        match rejected {
            Some(worker) => {
                warn!(worker = worker.id, "thread limit hit, discarding worker");
                self.discard(worker).await;
            }
            None => self.publish_idle(),
        }
    }

    /// Close a worker's connection without pooling it.
    pub async fn discard(&self, mut worker: Worker) {
        worker.conn.close().await;
        let _ = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
        self.metrics.counter_inc("route.pool.discarded", &[], 1);
    }

    /// Close and drop idle workers unused for longer than `threshold`.
    pub async fn sweep_stale(&self, now: Instant, threshold: Duration) -> usize {
        let stale: Vec<Worker> = {
            let mut idle = self.idle.lock();
            let (stale, fresh): (Vec<Worker>, Vec<Worker>) = idle
                .drain(..)
                .partition(|w| w.idle_for(now) > threshold);
            *idle = fresh;
            stale
        };
        let evicted = stale.len();
        for worker in stale {
            info!(worker = worker.id, idle_ms = worker.idle_for(now).as_millis() as u64, "evicting stale worker");
            self.discard(worker).await;
        }
        if evicted > 0 {
            self.metrics.counter_inc("route.pool.evicted", &[], evicted as u64);
            self.publish_idle();
        }
        evicted
    }

    /// Probe a worker idle for longer than `threshold`; reopen its
    /// connection if the probe fails.
    pub async fn refresh(&self, worker: &mut Worker, threshold: Duration) -> Result<(), ConnectionError> {
        if worker.idle_for(Instant::now()) <= threshold {
            return Ok(());
        }
        if worker.conn.is_alive().await {
            worker.touch();
            return Ok(());
        }
        info!(worker = worker.id, "stale connection failed liveness check, reopening");
        worker.conn.close().await;
        worker.conn = self.open().await?;
        worker.touch();
        Ok(())
    }

    /// Close every idle worker. Workers still checked out are closed when
    /// they come back.
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let idle: Vec<Worker> = self.idle.lock().drain(..).collect();
        for worker in idle {
            self.discard(worker).await;
        }
        self.publish_idle();
    }

    async fn open(&self) -> Result<Box<dyn DataConnection>, ConnectionError> {
        let name = self.client_name();
        self.connector.open(&self.address, &name).await
    }

    fn publish_idle(&self) {
        let idle = self.idle_count() as f64;
        self.metrics.gauge_set("route.pool.idle", &[], idle);
    }
}

//! Background synchronization worker
//!
//! What this module provides
//! - `Syncer`: owns at most one tokio task that periodically runs
//!   `StatsEngine::sync` against a `RemoteStore`
//! - `WorkerHandle`: observes whether a particular worker is still alive
//!
//! Lifecycle
//! - `start` replaces any running worker; `ensure_running` keeps a live one
//! - `stop` is idempotent, interrupts the sleep between cycles via a watch
//!   channel, and joins the task before returning
//! - A failed cycle is reported through `report_error` and the loop continues
//!
//! Testing strategy
//! - Short intervals with `MemoryRemoteStore`, plus a store that always fails,
//!   to check the loop survives outages and stops promptly

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

use crate::engine::StatsEngine;
use crate::observability::{report_error, sampled, MetricRecord, MetricsSink};
use crate::remote::RemoteStore;

/// Liveness view of one worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    alive: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

struct Worker {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    alive: Arc<AtomicBool>,
}

impl Worker {
    fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            alive: self.alive.clone(),
        }
    }
}

/// Clears the alive flag however the worker task ends.
struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Syncer {
    interval: Duration,
    limit: usize,
    sample_rate: f64,
    sink: Arc<dyn MetricsSink>,
    // serializes start/stop so two callers never both spawn
    lifecycle: tokio::sync::Mutex<()>,
    worker: Mutex<Option<Worker>>,
}

impl fmt::Debug for Syncer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Syncer")
            .field("interval", &self.interval)
            .field("limit", &self.limit)
            .field("syncing", &self.is_syncing())
            .finish()
    }
}

impl Syncer {
    pub fn new(interval: Duration, limit: usize, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            interval,
            limit,
            sample_rate: 1.0,
            sink,
            lifecycle: tokio::sync::Mutex::new(()),
            worker: Mutex::new(None),
        }
    }

    /// Sampling rate for per-cycle metrics.
    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = rate;
        self
    }

    fn worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a worker, stopping any running one first.
    pub async fn start(
        &self,
        engine: Arc<StatsEngine>,
        remote: Arc<dyn RemoteStore>,
    ) -> WorkerHandle {
        let _lifecycle = self.lifecycle.lock().await;
        self.shutdown_worker().await;
        self.spawn(engine, remote)
    }

    /// Start a worker unless one is already alive.
    pub async fn ensure_running(
        &self,
        engine: Arc<StatsEngine>,
        remote: Arc<dyn RemoteStore>,
    ) -> WorkerHandle {
        let _lifecycle = self.lifecycle.lock().await;
        let live = self
            .worker()
            .as_ref()
            .map(Worker::handle)
            .filter(WorkerHandle::is_alive);
        if let Some(handle) = live {
            return handle;
        }
        self.shutdown_worker().await;
        self.spawn(engine, remote)
    }

    /// Stop the worker, if any, and wait for it to exit.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.shutdown_worker().await;
    }

    pub fn is_syncing(&self) -> bool {
        self.worker()
            .as_ref()
            .is_some_and(|w| w.alive.load(Ordering::SeqCst))
    }

    async fn shutdown_worker(&self) {
        let Some(worker) = self.worker().take() else {
            return;
        };

        let _ = worker.shutdown.send(true);
        if let Err(e) = worker.join.await {
            debug!(error = %e, "sync worker ended abnormally");
        }
        debug!("sync worker stopped");
    }

    fn spawn(&self, engine: Arc<StatsEngine>, remote: Arc<dyn RemoteStore>) -> WorkerHandle {
        let (shutdown, rx) = watch::channel(false);
        let alive = Arc::new(AtomicBool::new(true));

        let cycle = Cycle {
            engine,
            remote,
            interval: self.interval,
            limit: self.limit,
            sample_rate: self.sample_rate,
            sink: self.sink.clone(),
        };
        let join = tokio::spawn(cycle.run(rx, AliveGuard(alive.clone())));

        let worker = Worker {
            shutdown,
            join,
            alive,
        };
        let handle = worker.handle();
        *self.worker() = Some(worker);

        self.sink
            .emit(MetricRecord::counter("network_resiliency.syncer.start", vec![]));
        debug!(interval = ?self.interval, limit = self.limit, "sync worker started");
        handle
    }
}

impl Drop for Syncer {
    fn drop(&mut self) {
        if let Some(worker) = self.worker().take() {
            let _ = worker.shutdown.send(true);
        }
    }
}

struct Cycle {
    engine: Arc<StatsEngine>,
    remote: Arc<dyn RemoteStore>,
    interval: Duration,
    limit: usize,
    sample_rate: f64,
    sink: Arc<dyn MetricsSink>,
}

impl Cycle {
    async fn run(self, mut shutdown: watch::Receiver<bool>, _alive: AliveGuard) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(self.interval) => {}
            }
            if *shutdown.borrow() {
                break;
            }

            match self.engine.sync(self.remote.as_ref(), self.limit).await {
                Ok(keys) => {
                    if sampled(self.sample_rate) {
                        self.sink.emit(
                            MetricRecord::distribution(
                                "network_resiliency.sync.keys",
                                keys.len() as f64,
                                vec![],
                            )
                            .with_sample_rate(self.sample_rate),
                        );
                    }
                }
                Err(e) => report_error(self.sink.as_ref(), "sync", e.kind(), &e),
            }
        }
    }
}

#![forbid(unsafe_code)]

// Worker pool supervision: startup, round-robin allocation, respawn on death

use crate::media::config::WorkerConfig;
use crate::media::engine::{MediaEngine, MediaWorker};
use crate::media::types::{MediaError, MediaResult};
use crate::metrics::ServiceMetrics;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock as StdRwLock;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Delay schedule for replacing a dead worker
#[derive(Debug, Clone, Copy)]
pub struct RespawnPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RespawnPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl RespawnPolicy {
    fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_delay)
    }
}

/// Fixed-size pool of media workers.
///
/// Each slot holds a live worker or is empty while its replacement is being
/// spawned. Allocation skips empty slots.
pub struct WorkerPool {
    engine: Arc<dyn MediaEngine>,
    config: WorkerConfig,
    respawn: RespawnPolicy,
    slots: StdRwLock<Vec<Option<Arc<dyn MediaWorker>>>>,
    next_idx: AtomicUsize,
    shutting_down: AtomicBool,
    metrics: ServiceMetrics,
}

impl WorkerPool {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        config: WorkerConfig,
        respawn: RespawnPolicy,
        metrics: ServiceMetrics,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            config,
            respawn,
            slots: StdRwLock::new(Vec::new()),
            next_idx: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            metrics,
        })
    }

    /// Spawns every worker and waits until all are ready.
    ///
    /// # Errors
    /// Fails if any single spawn fails; workers spawned so far are closed.
    pub async fn initialize(self: &Arc<Self>) -> MediaResult<()> {
        let num_workers = self.config.num_workers.max(1);
        info!("Creating worker pool with {} workers", num_workers);

        let mut workers = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            match self.engine.create_worker(&self.config).await {
                Ok(worker) => {
                    info!("Created worker {} with id: {}", i, worker.id());
                    workers.push(worker);
                }
                Err(e) => {
                    error!("Failed to spawn worker {}: {}", i, e);
                    for worker in workers {
                        worker.close();
                    }
                    return Err(e);
                }
            }
        }

        {
            let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
            *slots = workers.iter().cloned().map(Some).collect();
        }
        for (index, worker) in workers.iter().enumerate() {
            self.watch(index, worker);
        }

        info!("Worker pool ready");
        Ok(())
    }

    /// Returns the next live worker in round-robin order.
    ///
    /// # Errors
    /// Returns `MediaError::NoWorkerAvailable` when every slot is empty
    pub fn acquire(&self) -> MediaResult<Arc<dyn MediaWorker>> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        let len = slots.len();
        if len == 0 {
            return Err(MediaError::NoWorkerAvailable);
        }

        let start = self.next_idx.fetch_add(1, Ordering::Relaxed) % len;
        for offset in 0..len {
            let index = (start + offset) % len;
            if let Some(worker) = &slots[index] {
                if !worker.closed() {
                    debug!("Selected worker {} (slot {})", worker.id(), index);
                    return Ok(worker.clone());
                }
            }
        }

        Err(MediaError::NoWorkerAvailable)
    }

    /// Number of slots, live or not
    pub fn size(&self) -> usize {
        self.slots.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn live_count(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .flatten()
            .filter(|w| !w.closed())
            .count()
    }

    /// Closes every worker and clears the pool. Pending respawns are abandoned.
    pub fn shutdown(&self) {
        info!("Shutting down all workers");
        self.shutting_down.store(true, Ordering::SeqCst);

        let workers: Vec<_> = {
            let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
            slots.drain(..).flatten().collect()
        };
        for worker in workers {
            worker.close();
        }

        info!("All workers shut down");
    }

    /// Registers the death handler for the worker occupying `index`.
    ///
    /// Death notifications may arrive on a non-runtime thread, so the
    /// runtime handle is captured here and the respawn is spawned onto it.
    fn watch(self: &Arc<Self>, index: usize, worker: &Arc<dyn MediaWorker>) {
        let pool: Weak<Self> = Arc::downgrade(self);
        let runtime = tokio::runtime::Handle::current();
        let worker_id = worker.id();

        worker.on_dead(Box::new(move || {
            let Some(pool) = pool.upgrade() else {
                return;
            };
            if !pool.evict(index, &worker_id) {
                return;
            }
            runtime.spawn(pool.respawn(index));
        }));
    }

    /// Empties the slot if it still holds the dead worker. Returns whether a
    /// respawn should follow.
    fn evict(&self, index: usize, worker_id: &str) -> bool {
        if self.shutting_down.load(Ordering::SeqCst) {
            return false;
        }

        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        let Some(slot) = slots.get_mut(index) else {
            return false;
        };
        if slot.as_ref().map(|w| w.id()).as_deref() != Some(worker_id) {
            return false;
        }
        *slot = None;
        drop(slots);

        self.metrics.inc_worker_deaths();
        error!("Worker {} (slot {}) died, scheduling respawn", worker_id, index);
        true
    }

    async fn respawn(self: Arc<Self>, index: usize) {
        let mut delay = self.respawn.initial_delay;
        loop {
            tokio::time::sleep(delay).await;
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }

            match self.engine.create_worker(&self.config).await {
                Ok(worker) => {
                    if self.shutting_down.load(Ordering::SeqCst) {
                        worker.close();
                        return;
                    }
                    self.install(index, worker);
                    return;
                }
                Err(e) => {
                    error!(
                        "Failed to respawn worker slot {}: {} (retrying in {:?})",
                        index,
                        e,
                        self.respawn.next_delay(delay)
                    );
                    delay = self.respawn.next_delay(delay);
                }
            }
        }
    }

    fn install(self: &Arc<Self>, index: usize, worker: Arc<dyn MediaWorker>) {
        let installed = {
            let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
            match slots.get_mut(index) {
                Some(slot) if slot.is_none() => {
                    *slot = Some(worker.clone());
                    true
                }
                _ => false,
            }
        };
        if !installed {
            warn!("Worker slot {} no longer vacant, discarding replacement", index);
            worker.close();
            return;
        }
        self.watch(index, &worker);
        self.metrics.inc_worker_respawns();
        info!("Replacement worker {} ready in slot {}", worker.id(), index);
    }
}

#![forbid(unsafe_code)]

// Channel → router registry with single-flight lazy creation

use crate::media::config::RouterConfig;
use crate::media::engine::MediaRouter;
use crate::media::types::{MediaError, MediaResult, RouterCapabilities};
use crate::media::worker_pool::WorkerPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

type RouterCell = Arc<OnceCell<Arc<dyn MediaRouter>>>;

/// Maps each channel to exactly one router.
///
/// Every channel gets a `OnceCell`; concurrent callers for a channel that has
/// no router yet all wait on the same cell, so only one creation is in flight.
pub struct ChannelRouterRegistry {
    pool: Arc<WorkerPool>,
    config: RouterConfig,
    routers: StdMutex<HashMap<String, RouterCell>>,
}

impl ChannelRouterRegistry {
    pub fn new(pool: Arc<WorkerPool>, config: RouterConfig) -> Self {
        Self {
            pool,
            config,
            routers: StdMutex::new(HashMap::new()),
        }
    }

    fn cell_for(&self, channel_id: &str) -> RouterCell {
        let mut routers = self.routers.lock().unwrap_or_else(|e| e.into_inner());
        let cell = routers.entry(channel_id.to_string()).or_default();

        if cell.get().is_some_and(|router| router.closed()) {
            warn!("Router for channel {} is closed, replacing it", channel_id);
            *cell = RouterCell::default();
        }
        cell.clone()
    }

    fn is_current(&self, channel_id: &str, cell: &RouterCell) -> bool {
        let routers = self.routers.lock().unwrap_or_else(|e| e.into_inner());
        routers.get(channel_id).is_some_and(|c| Arc::ptr_eq(c, cell))
    }

    /// Returns the channel's router, creating it on first use.
    /// The flag is true only for the caller whose request created the router.
    ///
    /// # Errors
    /// Returns the engine error of the last attempt when no worker could create a router
    pub async fn get_or_create(&self, channel_id: &str) -> MediaResult<(Arc<dyn MediaRouter>, bool)> {
        loop {
            let cell = self.cell_for(channel_id);
            let created = AtomicBool::new(false);

            let router = cell
                .get_or_try_init(|| async {
                    created.store(true, Ordering::Relaxed);
                    self.create_router(channel_id).await
                })
                .await?
                .clone();

            if self.is_current(channel_id, &cell) {
                return Ok((router, created.load(Ordering::Relaxed)));
            }

            // Deleted while being created: the router is orphaned.
            if created.load(Ordering::Relaxed) {
                router.close();
            }
            debug!("Router for channel {} was deleted during creation, retrying", channel_id);
        }
    }

    /// Creates a router, moving on to the next worker when one refuses
    async fn create_router(&self, channel_id: &str) -> MediaResult<Arc<dyn MediaRouter>> {
        let attempts = self.pool.size().max(1);
        let mut last_error = MediaError::NoWorkerAvailable;

        for attempt in 1..=attempts {
            let worker = self.pool.acquire()?;
            match worker.create_router(&self.config).await {
                Ok(router) => {
                    info!(
                        "Created router {} for channel {} on worker {}",
                        router.id(),
                        channel_id,
                        worker.id()
                    );
                    return Ok(router);
                }
                Err(e) => {
                    warn!(
                        "Router creation for channel {} failed on worker {} (attempt {}/{}): {}",
                        channel_id,
                        worker.id(),
                        attempt,
                        attempts,
                        e
                    );
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    /// Live router for the channel, if any
    pub fn get(&self, channel_id: &str) -> Option<Arc<dyn MediaRouter>> {
        let routers = self.routers.lock().unwrap_or_else(|e| e.into_inner());
        routers
            .get(channel_id)
            .and_then(|cell| cell.get())
            .filter(|router| !router.closed())
            .cloned()
    }

    /// Closes and evicts the channel's router. Returns whether one existed.
    pub fn delete(&self, channel_id: &str) -> bool {
        let cell = {
            let mut routers = self.routers.lock().unwrap_or_else(|e| e.into_inner());
            routers.remove(channel_id)
        };

        match cell.as_ref().and_then(|cell| cell.get()) {
            Some(router) => {
                router.close();
                info!("Closed router {} for channel {}", router.id(), channel_id);
                true
            }
            None => false,
        }
    }

    /// Capability set shared by every router
    pub fn capabilities(&self) -> RouterCapabilities {
        let live = {
            let routers = self.routers.lock().unwrap_or_else(|e| e.into_inner());
            routers
                .values()
                .filter_map(|cell| cell.get())
                .find(|router| !router.closed())
                .cloned()
        };

        match live {
            Some(router) => RouterCapabilities::Negotiated(router.rtp_capabilities()),
            None => RouterCapabilities::Configured(self.config.configured_capabilities()),
        }
    }

    pub fn router_count(&self) -> usize {
        let routers = self.routers.lock().unwrap_or_else(|e| e.into_inner());
        routers
            .values()
            .filter_map(|cell| cell.get())
            .filter(|router| !router.closed())
            .count()
    }

    /// Closes every router
    pub fn close_all(&self) {
        info!("Closing all routers");
        let cells: Vec<_> = {
            let mut routers = self.routers.lock().unwrap_or_else(|e| e.into_inner());
            routers.drain().collect()
        };
        for (channel_id, cell) in cells {
            if let Some(router) = cell.get() {
                router.close();
                debug!("Closed router for channel: {}", channel_id);
            }
        }
    }
}

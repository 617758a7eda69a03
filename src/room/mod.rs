#![forbid(unsafe_code)]

// Room module - durable membership records, local media handles, and
// deferred teardown of empty channels

pub mod participant;
pub mod resources;

pub use participant::{ParticipantRecord, RoomRecord, StatePatch, ToggleState};
pub use resources::{ConsumerEntry, Owner, ProducerEntry, ResourceTables, TransportEntry};

use crate::media::engine::MediaRouter;
use crate::media::router_registry::ChannelRouterRegistry;
use crate::media::types::MediaError;
use crate::metrics::ServiceMetrics;
use crate::store::{participants_key, room_key, StateStore, StoreError};
use participant::now_millis;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Attempts at a compare-and-swap participant update before giving up
const MAX_UPDATE_ATTEMPTS: usize = 8;

#[derive(Error, Debug)]
pub enum RoomError {
    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Participant {user_id} not found in channel {channel_id}")]
    ParticipantNotFound { channel_id: String, user_id: String },

    #[error("Participant {0} kept changing, update abandoned")]
    UpdateConflict(String),
}

pub type RoomResult<T> = Result<T, RoomError>;

/// Outcome of a participant removal
#[derive(Debug, Default)]
pub struct Departure {
    /// The removed record, `None` when no record was removed
    pub record: Option<ParticipantRecord>,
    /// Producers closed by the removal
    pub closed_producers: Vec<String>,
}

struct PendingTeardown {
    generation: u64,
    task: JoinHandle<()>,
}

/// Room & participant store.
///
/// Membership and toggle state live in the shared state store; media handles
/// live in process-local tables. Join/leave accounting for a channel runs
/// under that channel's async mutex.
pub struct RoomStore {
    store: Arc<dyn StateStore>,
    routers: Arc<ChannelRouterRegistry>,
    resources: Arc<ResourceTables>,
    grace: Duration,
    channel_locks: StdMutex<HashMap<String, Arc<TokioMutex<()>>>>,
    teardowns: StdMutex<HashMap<String, PendingTeardown>>,
    next_generation: AtomicU64,
    metrics: ServiceMetrics,
}

impl RoomStore {
    pub fn new(
        store: Arc<dyn StateStore>,
        routers: Arc<ChannelRouterRegistry>,
        grace: Duration,
        metrics: ServiceMetrics,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            routers,
            resources: ResourceTables::new(),
            grace,
            channel_locks: StdMutex::new(HashMap::new()),
            teardowns: StdMutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            metrics,
        })
    }

    pub fn routers(&self) -> &Arc<ChannelRouterRegistry> {
        &self.routers
    }

    pub fn resources(&self) -> &Arc<ResourceTables> {
        &self.resources
    }

    async fn lock_channel(&self, channel_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.channel_locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(channel_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drops the channel's lock entry when nobody else holds or awaits it
    fn forget_channel_lock(&self, channel_id: &str) {
        let mut locks = self.channel_locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(channel_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(channel_id);
        }
    }

    /// Returns the channel's router, persisting the room record when it is new
    pub async fn get_or_create_room(&self, channel_id: &str) -> RoomResult<Arc<dyn MediaRouter>> {
        let _guard = self.lock_channel(channel_id).await;
        self.ensure_room(channel_id).await
    }

    /// Caller holds the channel lock
    async fn ensure_room(&self, channel_id: &str) -> RoomResult<Arc<dyn MediaRouter>> {
        let (router, created) = self.routers.get_or_create(channel_id).await?;
        let key = room_key(channel_id);

        if created || self.store.get(&key).await?.is_none() {
            let record = RoomRecord {
                channel_id: channel_id.to_string(),
                router_id: router.id(),
                created_at: now_millis(),
            };
            let json = serde_json::to_string(&record).map_err(StoreError::from)?;
            self.store.set(&key, &json, None).await?;
        }
        if created {
            self.metrics.inc_rooms_created();
            info!("Room {} created with router {}", channel_id, router.id());
        }

        Ok(router)
    }

    /// Creates the participant record with no resources and default toggles.
    /// A pending teardown of the channel is cancelled once the record is written.
    pub async fn add_participant(
        self: &Arc<Self>,
        channel_id: &str,
        user_id: &str,
        connection_id: &str,
    ) -> RoomResult<ParticipantRecord> {
        let _guard = self.lock_channel(channel_id).await;
        let result = self.insert_participant(channel_id, user_id, connection_id).await;
        self.settle_join(channel_id, result).await
    }

    /// Room creation and participant insertion as one step under the channel
    /// lock. On failure an empty channel keeps (or gets) its pending teardown.
    pub async fn join_room(
        self: &Arc<Self>,
        channel_id: &str,
        user_id: &str,
        connection_id: &str,
    ) -> RoomResult<(Arc<dyn MediaRouter>, ParticipantRecord)> {
        let _guard = self.lock_channel(channel_id).await;
        let result: RoomResult<_> = async {
            let router = self.ensure_room(channel_id).await?;
            let record = self.insert_participant(channel_id, user_id, connection_id).await?;
            Ok((router, record))
        }
        .await;
        self.settle_join(channel_id, result).await
    }

    /// Caller holds the channel lock
    async fn insert_participant(
        &self,
        channel_id: &str,
        user_id: &str,
        connection_id: &str,
    ) -> RoomResult<ParticipantRecord> {
        let record = ParticipantRecord::new(user_id, connection_id);
        let json = serde_json::to_string(&record).map_err(StoreError::from)?;
        self.store.hset(&participants_key(channel_id), user_id, &json).await?;

        info!("Participant {} joined channel {}", user_id, channel_id);
        Ok(record)
    }

    /// Cancels the teardown after a successful join, or re-arms it after a
    /// failed one. Caller holds the channel lock.
    async fn settle_join<T>(self: &Arc<Self>, channel_id: &str, result: RoomResult<T>) -> RoomResult<T> {
        match result {
            Ok(value) => {
                self.cancel_teardown(channel_id).await;
                Ok(value)
            }
            Err(e) => {
                self.arm_teardown_if_empty(channel_id).await;
                Err(e)
            }
        }
    }

    async fn arm_teardown_if_empty(self: &Arc<Self>, channel_id: &str) {
        if self.has_pending_teardown(channel_id) {
            return;
        }
        let empty = match self.participant_count(channel_id).await {
            Ok(count) => count == 0,
            Err(e) => {
                warn!("Could not read occupancy of channel {}: {}", channel_id, e);
                !self.resources.channel_in_use(channel_id)
            }
        };
        if empty {
            if let Err(e) = self.schedule_teardown(channel_id).await {
                warn!("Failed to set grace TTL on channel {}: {}", channel_id, e);
            }
        }
    }

    /// Removes the participant and closes every handle it created in the channel
    pub async fn remove_participant(self: &Arc<Self>, channel_id: &str, user_id: &str) -> RoomResult<Departure> {
        let _guard = self.lock_channel(channel_id).await;

        let record = self.get_participant(channel_id, user_id).await?;
        let closed_producers = self
            .resources
            .release(|o| o.user_id == user_id && o.channel_id == channel_id)
            .close();

        if record.is_some() {
            self.drop_record(channel_id, user_id).await?;
        }
        Ok(Departure {
            record,
            closed_producers,
        })
    }

    /// Connection-close variant of [`remove_participant`](Self::remove_participant).
    ///
    /// Handles created over `connection_id` are always closed; the record is
    /// only removed if it still belongs to that connection, so a newer
    /// connection of the same user keeps its membership.
    pub async fn remove_participant_if_owned(
        self: &Arc<Self>,
        channel_id: &str,
        user_id: &str,
        connection_id: &str,
    ) -> RoomResult<Departure> {
        let _guard = self.lock_channel(channel_id).await;

        let record = self.get_participant(channel_id, user_id).await?;
        let owned = record.as_ref().is_some_and(|r| r.connection_id == connection_id);

        let closed_producers = self
            .resources
            .release(|o| {
                o.channel_id == channel_id
                    && o.user_id == user_id
                    && (owned || o.connection_id == connection_id)
            })
            .close();

        if !owned {
            debug!(
                "Participant {} in channel {} belongs to another connection, keeping record",
                user_id, channel_id
            );
            return Ok(Departure {
                record: None,
                closed_producers,
            });
        }
        self.drop_record(channel_id, user_id).await?;
        Ok(Departure {
            record,
            closed_producers,
        })
    }

    /// Deletes the record and schedules teardown if the channel is now empty.
    /// Caller holds the channel lock.
    async fn drop_record(self: &Arc<Self>, channel_id: &str, user_id: &str) -> RoomResult<()> {
        self.store.hdel(&participants_key(channel_id), user_id).await?;
        info!("Participant {} left channel {}", user_id, channel_id);

        if self.participant_count(channel_id).await? == 0 {
            self.schedule_teardown(channel_id).await?;
        }
        Ok(())
    }

    pub async fn get_participant(
        &self,
        channel_id: &str,
        user_id: &str,
    ) -> RoomResult<Option<ParticipantRecord>> {
        let raw = self.store.hget(&participants_key(channel_id), user_id).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw).map_err(StoreError::from)?)),
            None => Ok(None),
        }
    }

    /// All records for the channel. Malformed records are skipped.
    pub async fn get_participants(&self, channel_id: &str) -> RoomResult<Vec<ParticipantRecord>> {
        let all = self.store.hgetall(&participants_key(channel_id)).await?;
        Ok(all
            .into_iter()
            .filter_map(|(user_id, raw)| match serde_json::from_str(&raw) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping malformed participant {} in channel {}: {}", user_id, channel_id, e);
                    None
                }
            })
            .collect())
    }

    pub async fn participant_count(&self, channel_id: &str) -> RoomResult<usize> {
        Ok(self.store.hlen(&participants_key(channel_id)).await?)
    }

    /// Read-modify-write of a participant record.
    ///
    /// The write only lands if the stored record is unchanged since it was
    /// read; otherwise the update is re-applied to the fresh record.
    pub async fn update_participant<F>(
        &self,
        channel_id: &str,
        user_id: &str,
        apply: F,
    ) -> RoomResult<ParticipantRecord>
    where
        F: Fn(&mut ParticipantRecord) + Send,
    {
        let key = participants_key(channel_id);

        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let Some(current) = self.store.hget(&key, user_id).await? else {
                return Err(RoomError::ParticipantNotFound {
                    channel_id: channel_id.to_string(),
                    user_id: user_id.to_string(),
                });
            };

            let mut record: ParticipantRecord = serde_json::from_str(&current).map_err(StoreError::from)?;
            apply(&mut record);
            let updated = serde_json::to_string(&record).map_err(StoreError::from)?;

            if self.store.hset_if_eq(&key, user_id, &current, &updated).await? {
                return Ok(record);
            }
            debug!(
                "Participant {} in channel {} changed concurrently (attempt {})",
                user_id, channel_id, attempt
            );
        }

        Err(RoomError::UpdateConflict(user_id.to_string()))
    }

    /// Merge-patches the toggle state
    pub async fn update_state(
        &self,
        channel_id: &str,
        user_id: &str,
        patch: StatePatch,
    ) -> RoomResult<ParticipantRecord> {
        self.update_participant(channel_id, user_id, |record| patch.apply(&mut record.state))
            .await
    }

    // --- Resource handles ---

    pub fn add_transport(&self, entry: TransportEntry) {
        self.resources.add_transport(entry);
    }

    pub fn get_transport(&self, transport_id: &str) -> Option<TransportEntry> {
        self.resources.transport(transport_id)
    }

    pub fn add_producer(&self, entry: ProducerEntry) {
        self.resources.add_producer(entry);
    }

    pub fn get_producer(&self, producer_id: &str) -> Option<ProducerEntry> {
        self.resources.producer(producer_id)
    }

    pub fn add_consumer(&self, entry: ConsumerEntry) {
        self.resources.add_consumer(entry);
    }

    pub fn get_consumer(&self, consumer_id: &str) -> Option<ConsumerEntry> {
        self.resources.consumer(consumer_id)
    }

    // --- Deferred teardown ---

    /// Starts the grace timer for an empty channel. The timer is armed even
    /// if setting the grace TTL fails. Caller holds the channel lock.
    async fn schedule_teardown(self: &Arc<Self>, channel_id: &str) -> RoomResult<()> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let rooms: Weak<Self> = Arc::downgrade(self);
        let grace = self.grace;
        let channel = channel_id.to_string();

        let task = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(rooms) = rooms.upgrade() {
                rooms.expire_room(&channel, generation).await;
            }
        });

        let previous = {
            let mut teardowns = self.teardowns.lock().unwrap_or_else(|e| e.into_inner());
            teardowns.insert(channel_id.to_string(), PendingTeardown { generation, task })
        };
        if let Some(previous) = previous {
            previous.task.abort();
        }
        info!("Channel {} is empty, router teardown in {:?}", channel_id, self.grace);

        self.store.expire(&room_key(channel_id), self.grace).await?;
        self.store.expire(&participants_key(channel_id), self.grace).await?;
        Ok(())
    }

    /// Cancels a pending teardown and clears the grace TTL from the channel's
    /// keys. Caller holds the channel lock.
    async fn cancel_teardown(&self, channel_id: &str) {
        let pending = {
            let mut teardowns = self.teardowns.lock().unwrap_or_else(|e| e.into_inner());
            teardowns.remove(channel_id)
        };
        let Some(pending) = pending else {
            return;
        };

        pending.task.abort();
        for key in [room_key(channel_id), participants_key(channel_id)] {
            if let Err(e) = self.store.persist(&key).await {
                warn!("Failed to clear grace TTL on {}: {}", key, e);
            }
        }
        info!("Teardown of channel {} cancelled by rejoin", channel_id);
    }

    async fn expire_room(&self, channel_id: &str, generation: u64) {
        let guard = self.lock_channel(channel_id).await;

        let current = {
            let mut teardowns = self.teardowns.lock().unwrap_or_else(|e| e.into_inner());
            match teardowns.get(channel_id) {
                Some(pending) if pending.generation == generation => {
                    teardowns.remove(channel_id);
                    true
                }
                _ => false,
            }
        };
        if !current {
            return;
        }

        let occupied = match self.store.hlen(&participants_key(channel_id)).await {
            Ok(count) => count > 0,
            Err(e) => {
                warn!("Could not read occupancy of channel {}: {}", channel_id, e);
                self.resources.channel_in_use(channel_id)
            }
        };
        if occupied {
            debug!("Channel {} is occupied again, keeping router", channel_id);
            return;
        }

        self.routers.delete(channel_id);
        for key in [room_key(channel_id), participants_key(channel_id)] {
            if let Err(e) = self.store.del(&key).await {
                warn!("Failed to delete {}: {}", key, e);
            }
        }
        self.metrics.inc_rooms_torn_down();
        info!("Room {} torn down after grace period", channel_id);

        drop(guard);
        self.forget_channel_lock(channel_id);
    }

    pub fn has_pending_teardown(&self, channel_id: &str) -> bool {
        self.teardowns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(channel_id)
    }

    /// Channels with a live router
    pub fn room_count(&self) -> usize {
        self.routers.router_count()
    }

    /// Closes every handle and router and abandons pending teardowns
    pub fn shutdown(&self) {
        info!("Shutting down all rooms...");

        let pending: Vec<_> = {
            let mut teardowns = self.teardowns.lock().unwrap_or_else(|e| e.into_inner());
            teardowns.drain().map(|(_, p)| p).collect()
        };
        for teardown in pending {
            teardown.task.abort();
        }

        self.resources.release_all().close();
        self.routers.close_all();
        info!("All rooms shut down");
    }
}

#![forbid(unsafe_code)]

// In-memory media engine used by unit tests.
//
// Mirrors the mediasoup close cascade: closing a transport closes its
// producers and consumers, closing a producer closes every consumer of it,
// and a dead worker closes its routers.

use crate::media::config::{RouterConfig, WebRtcTransportConfig, WorkerConfig};
use crate::media::engine::{
    CloseCallback, MediaConsumer, MediaEngine, MediaProducer, MediaRouter, MediaTransport,
    MediaWorker,
};
use crate::media::router_registry::ChannelRouterRegistry;
use crate::media::types::{MediaError, MediaResult, ProducerMeta, TransportDirection, TransportInfo};
use crate::media::worker_pool::{RespawnPolicy, WorkerPool};
use crate::metrics::ServiceMetrics;
use crate::room::{ParticipantRecord, RoomStore};
use crate::store::{MemoryStore, StateStore, StoreError, StoreResult};
use async_trait::async_trait;
use mediasoup::data_structures::DtlsRole;
use mediasoup::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use uuid::Uuid;

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn fire(callbacks: Vec<CloseCallback>) {
    for cb in callbacks {
        cb();
    }
}

#[derive(Default)]
struct Registry {
    workers: Mutex<Vec<Arc<FakeWorker>>>,
    routers: Mutex<HashMap<String, Arc<FakeRouter>>>,
    transports: Mutex<HashMap<String, Arc<FakeTransport>>>,
    producers: Mutex<HashMap<String, Arc<FakeProducer>>>,
    consumers: Mutex<HashMap<String, Arc<FakeConsumer>>>,
}

/// Initialized pool of `workers` fake workers with the default respawn policy
pub async fn worker_pool(engine: &FakeEngine, workers: usize) -> Arc<WorkerPool> {
    let config = WorkerConfig {
        num_workers: workers,
        ..WorkerConfig::default()
    };
    let pool = WorkerPool::new(
        Arc::new(engine.clone()),
        config,
        RespawnPolicy::default(),
        ServiceMetrics::new(),
    );
    pool.initialize().await.expect("fake workers spawn");
    pool
}

/// Room store over a single fake worker and the given state store
pub async fn room_store(engine: &FakeEngine, store: Arc<dyn StateStore>, grace: Duration) -> Arc<RoomStore> {
    let routers = Arc::new(ChannelRouterRegistry::new(
        worker_pool(engine, 1).await,
        RouterConfig::default(),
    ));
    RoomStore::new(store, routers, grace, ServiceMetrics::new())
}

/// Fake engine handing out in-memory workers
#[derive(Clone, Default)]
pub struct FakeEngine {
    registry: Arc<Registry>,
    failing_spawns: Arc<AtomicUsize>,
    spawn_attempts: Arc<AtomicUsize>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` worker spawns fail
    pub fn fail_next_spawns(&self, n: usize) {
        self.failing_spawns.store(n, Ordering::SeqCst);
    }

    pub fn spawn_attempts(&self) -> usize {
        self.spawn_attempts.load(Ordering::SeqCst)
    }

    pub fn workers(&self) -> Vec<Arc<FakeWorker>> {
        lock(&self.registry.workers).clone()
    }

    pub fn router(&self, id: &str) -> Option<Arc<FakeRouter>> {
        lock(&self.registry.routers).get(id).cloned()
    }

    pub fn transport(&self, id: &str) -> Option<Arc<FakeTransport>> {
        lock(&self.registry.transports).get(id).cloned()
    }

    pub fn producer(&self, id: &str) -> Option<Arc<FakeProducer>> {
        lock(&self.registry.producers).get(id).cloned()
    }

    pub fn consumer(&self, id: &str) -> Option<Arc<FakeConsumer>> {
        lock(&self.registry.consumers).get(id).cloned()
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn create_worker(&self, _config: &WorkerConfig) -> MediaResult<Arc<dyn MediaWorker>> {
        self.spawn_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_spawns
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MediaError::WorkerError("spawn refused".to_string()));
        }

        let worker = Arc::new(FakeWorker {
            id: new_id(),
            registry: Arc::downgrade(&self.registry),
            closed: AtomicBool::new(false),
            fail_routers: AtomicBool::new(false),
            dead_callbacks: Mutex::new(Vec::new()),
            routers: Mutex::new(Vec::new()),
        });
        lock(&self.registry.workers).push(worker.clone());
        Ok(worker)
    }
}

pub struct FakeWorker {
    id: String,
    registry: Weak<Registry>,
    closed: AtomicBool,
    fail_routers: AtomicBool,
    dead_callbacks: Mutex<Vec<CloseCallback>>,
    routers: Mutex<Vec<Arc<FakeRouter>>>,
}

impl FakeWorker {
    /// Simulates an unexpected worker exit
    pub fn kill(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let routers: Vec<_> = lock(&self.routers).drain(..).collect();
        for router in routers {
            router.close();
        }
        let callbacks: Vec<_> = lock(&self.dead_callbacks).drain(..).collect();
        fire(callbacks);
    }

    pub fn fail_router_creation(&self, fail: bool) {
        self.fail_routers.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaWorker for FakeWorker {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn on_dead(&self, callback: CloseCallback) {
        lock(&self.dead_callbacks).push(callback);
    }

    async fn create_router(&self, _config: &RouterConfig) -> MediaResult<Arc<dyn MediaRouter>> {
        if self.closed() {
            return Err(MediaError::Closed(self.id.clone()));
        }
        if self.fail_routers.load(Ordering::SeqCst) {
            return Err(MediaError::RouterError("router creation refused".to_string()));
        }
        tokio::task::yield_now().await;

        let router = Arc::new(FakeRouter {
            id: new_id(),
            registry: self.registry.clone(),
            closed: AtomicBool::new(false),
            producers: Mutex::new(HashMap::new()),
        });
        lock(&self.routers).push(router.clone());
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry.routers).insert(router.id.clone(), router.clone());
        }
        Ok(router)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.dead_callbacks).clear();
        let routers: Vec<_> = lock(&self.routers).drain(..).collect();
        for router in routers {
            router.close();
        }
    }
}

pub struct FakeRouter {
    id: String,
    registry: Weak<Registry>,
    closed: AtomicBool,
    /// Live producers on this router and the consumers attached to each
    producers: Mutex<HashMap<String, Vec<Weak<FakeConsumer>>>>,
}

impl FakeRouter {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaRouter for FakeRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn closed(&self) -> bool {
        self.is_closed()
    }

    fn rtp_capabilities(&self) -> RtpCapabilitiesFinalized {
        RtpCapabilitiesFinalized::default()
    }

    fn can_consume(&self, producer_id: &str, _rtp_capabilities: &RtpCapabilities) -> bool {
        !self.is_closed() && lock(&self.producers).contains_key(producer_id)
    }

    async fn create_transport(
        &self,
        direction: TransportDirection,
        _config: &WebRtcTransportConfig,
    ) -> MediaResult<Arc<dyn MediaTransport>> {
        if self.is_closed() {
            return Err(MediaError::Closed(self.id.clone()));
        }
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| MediaError::Closed(self.id.clone()))?;
        let router = lock(&registry.routers)
            .get(&self.id)
            .cloned()
            .ok_or_else(|| MediaError::Closed(self.id.clone()))?;

        let transport = Arc::new(FakeTransport {
            id: new_id(),
            direction,
            router,
            closed: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            close_callbacks: Mutex::new(Vec::new()),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        });
        lock(&registry.transports).insert(transport.id.clone(), transport.clone());
        Ok(transport)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeTransport {
    id: String,
    pub direction: TransportDirection,
    router: Arc<FakeRouter>,
    closed: AtomicBool,
    connected: AtomicBool,
    close_callbacks: Mutex<Vec<CloseCallback>>,
    producers: Mutex<Vec<Arc<FakeProducer>>>,
    consumers: Mutex<Vec<Arc<FakeConsumer>>>,
}

impl FakeTransport {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn info(&self) -> TransportInfo {
        TransportInfo {
            id: self.id.clone(),
            ice_parameters: IceParameters {
                username_fragment: format!("ufrag-{}", self.id),
                password: "fake-password".to_string(),
                ice_lite: Some(true),
            },
            ice_candidates: Vec::new(),
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: Vec::new(),
            },
        }
    }

    async fn connect(&self, _dtls_parameters: DtlsParameters) -> MediaResult<()> {
        if self.is_closed() {
            return Err(MediaError::Closed(self.id.clone()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        _rtp_parameters: RtpParameters,
        _meta: ProducerMeta,
    ) -> MediaResult<Arc<dyn MediaProducer>> {
        if self.is_closed() || self.router.is_closed() {
            return Err(MediaError::Closed(self.id.clone()));
        }
        let producer = Arc::new(FakeProducer {
            id: new_id(),
            kind,
            router: self.router.clone(),
            closed: AtomicBool::new(false),
            close_callbacks: Mutex::new(Vec::new()),
        });
        lock(&self.router.producers).insert(producer.id.clone(), Vec::new());
        lock(&self.producers).push(producer.clone());
        if let Some(registry) = self.router.registry.upgrade() {
            lock(&registry.producers).insert(producer.id.clone(), producer.clone());
        }
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &str,
        _rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> MediaResult<Arc<dyn MediaConsumer>> {
        if self.is_closed() {
            return Err(MediaError::Closed(self.id.clone()));
        }
        let registry = self
            .router
            .registry
            .upgrade()
            .ok_or_else(|| MediaError::Closed(self.id.clone()))?;
        let kind = lock(&registry.producers)
            .get(producer_id)
            .map(|p| p.kind)
            .ok_or_else(|| MediaError::ConsumerError(format!("unknown producer {producer_id}")))?;

        let consumer = Arc::new(FakeConsumer {
            id: new_id(),
            producer_id: producer_id.to_string(),
            kind,
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
            close_callbacks: Mutex::new(Vec::new()),
        });
        {
            let mut producers = lock(&self.router.producers);
            let attached = producers
                .get_mut(producer_id)
                .ok_or_else(|| MediaError::ConsumerError(format!("producer {producer_id} not on router")))?;
            attached.push(Arc::downgrade(&consumer));
        }
        lock(&self.consumers).push(consumer.clone());
        lock(&registry.consumers).insert(consumer.id.clone(), consumer.clone());
        Ok(consumer)
    }

    fn on_close(&self, callback: CloseCallback) {
        if self.is_closed() {
            callback();
        } else {
            lock(&self.close_callbacks).push(callback);
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let consumers: Vec<_> = lock(&self.consumers).drain(..).collect();
        for consumer in consumers {
            consumer.close();
        }
        let producers: Vec<_> = lock(&self.producers).drain(..).collect();
        for producer in producers {
            producer.close();
        }
        let callbacks: Vec<_> = lock(&self.close_callbacks).drain(..).collect();
        fire(callbacks);
    }
}

pub struct FakeProducer {
    id: String,
    kind: MediaKind,
    router: Arc<FakeRouter>,
    closed: AtomicBool,
    close_callbacks: Mutex<Vec<CloseCallback>>,
}

impl FakeProducer {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl MediaProducer for FakeProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn on_close(&self, callback: CloseCallback) {
        if self.is_closed() {
            callback();
        } else {
            lock(&self.close_callbacks).push(callback);
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let attached = lock(&self.router.producers).remove(&self.id).unwrap_or_default();
        for consumer in attached.iter().filter_map(Weak::upgrade) {
            consumer.close();
        }
        let callbacks: Vec<_> = lock(&self.close_callbacks).drain(..).collect();
        fire(callbacks);
    }
}

pub struct FakeConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    paused: AtomicBool,
    closed: AtomicBool,
    close_callbacks: Mutex<Vec<CloseCallback>>,
}

impl FakeConsumer {
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaConsumer for FakeConsumer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn producer_id(&self) -> String {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        RtpParameters::default()
    }

    async fn resume(&self) -> MediaResult<()> {
        if self.is_closed() {
            return Err(MediaError::Closed(self.id.clone()));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn on_close(&self, callback: CloseCallback) {
        if self.is_closed() {
            callback();
        } else {
            lock(&self.close_callbacks).push(callback);
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks: Vec<_> = lock(&self.close_callbacks).drain(..).collect();
        fire(callbacks);
    }
}

type Rewrite = Box<dyn Fn(&mut ParticipantRecord) + Send>;

/// Memory store that can fail `hset` and can simulate another writer
/// changing a participant record just before each compare-and-swap
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    fail_hset: AtomicBool,
    interference: Mutex<Option<(usize, Rewrite)>>,
    swaps: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fail_hset: AtomicBool::new(false),
            interference: Mutex::new(None),
            swaps: AtomicUsize::new(0),
        }
    }

    pub fn fail_hset(&self, fail: bool) {
        self.fail_hset.store(fail, Ordering::SeqCst);
    }

    /// Rewrites the record with `rewrite` before each of the next `times` swaps
    pub fn interfere(&self, times: usize, rewrite: impl Fn(&mut ParticipantRecord) + Send + 'static) {
        *lock(&self.interference) = Some((times, Box::new(rewrite)));
    }

    /// Compare-and-swap attempts seen so far
    pub fn swaps(&self) -> usize {
        self.swaps.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.inner.set(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        self.inner.del(key).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        if self.fail_hset.load(Ordering::SeqCst) {
            return Err(StoreError::Command(format!("HSET {key} refused")));
        }
        self.inner.hset(key, field, value).await
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        self.inner.hget(key, field).await
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        self.inner.hdel(key, field).await
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.inner.hgetall(key).await
    }

    async fn hlen(&self, key: &str) -> StoreResult<usize> {
        self.inner.hlen(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.inner.expire(key, ttl).await
    }

    async fn persist(&self, key: &str) -> StoreResult<()> {
        self.inner.persist(key).await
    }

    async fn hset_if_eq(&self, key: &str, field: &str, expected: &str, value: &str) -> StoreResult<bool> {
        self.swaps.fetch_add(1, Ordering::SeqCst);

        if let Some(current) = self.inner.hget(key, field).await? {
            let rewritten = {
                let mut interference = lock(&self.interference);
                match interference.as_mut() {
                    Some((remaining, rewrite)) if *remaining > 0 => {
                        *remaining -= 1;
                        let mut record: ParticipantRecord = serde_json::from_str(&current)?;
                        rewrite(&mut record);
                        Some(serde_json::to_string(&record)?)
                    }
                    _ => None,
                }
            };
            if let Some(rewritten) = rewritten {
                self.inner.hset(key, field, &rewritten).await?;
            }
        }

        self.inner.hset_if_eq(key, field, expected, value).await
    }
}

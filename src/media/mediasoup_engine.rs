#![forbid(unsafe_code)]

// mediasoup-backed implementation of the media engine capability interface.
//
// mediasoup closes an object when its last handle is dropped, so each wrapper
// keeps the single owned handle behind an Option and `close()` takes it.

use crate::media::config::{RouterConfig, WebRtcTransportConfig, WorkerConfig};
use crate::media::engine::{
    CloseCallback, MediaConsumer, MediaEngine, MediaProducer, MediaRouter, MediaTransport,
    MediaWorker,
};
use crate::media::types::{MediaError, MediaResult, ProducerMeta, TransportDirection, TransportInfo};
use async_trait::async_trait;
use mediasoup::prelude::*;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

fn take_handle<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

fn clone_handle<T: Clone>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

/// Spawns mediasoup worker processes
pub struct MediasoupEngine {
    manager: mediasoup::worker_manager::WorkerManager,
}

impl MediasoupEngine {
    pub fn new() -> Self {
        Self {
            manager: mediasoup::worker_manager::WorkerManager::new(),
        }
    }
}

impl Default for MediasoupEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    async fn create_worker(&self, config: &WorkerConfig) -> MediaResult<Arc<dyn MediaWorker>> {
        let worker = self
            .manager
            .create_worker(config.to_worker_settings())
            .await
            .map_err(|e| MediaError::WorkerError(format!("Failed to create worker: {e}")))?;

        Ok(Arc::new(MediasoupWorker {
            id: worker.id().to_string(),
            inner: Mutex::new(Some(worker)),
        }))
    }
}

struct MediasoupWorker {
    id: String,
    inner: Mutex<Option<Worker>>,
}

#[async_trait]
impl MediaWorker for MediasoupWorker {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn closed(&self) -> bool {
        clone_handle(&self.inner).map_or(true, |w| w.closed())
    }

    fn on_dead(&self, callback: CloseCallback) {
        let Some(worker) = clone_handle(&self.inner) else {
            callback();
            return;
        };
        let worker_id = self.id.clone();
        // `Worker::on_dead` requires `Sync`; the mutex makes the boxed callback shareable.
        let callback = std::sync::Mutex::new(callback);
        worker
            .on_dead(move |reason| {
                error!("mediasoup worker {} exited: {:?}", worker_id, reason);
                let callback = callback.into_inner().unwrap_or_else(|e| e.into_inner());
                callback();
            })
            .detach();
    }

    async fn create_router(&self, config: &RouterConfig) -> MediaResult<Arc<dyn MediaRouter>> {
        let worker = clone_handle(&self.inner).ok_or_else(|| MediaError::Closed(self.id.clone()))?;

        let router = worker
            .create_router(config.to_router_options())
            .await
            .map_err(|e| MediaError::RouterError(format!("Failed to create router: {e}")))?;

        let router_id = router.id().to_string();
        router
            .on_worker_close({
                let router_id = router_id.clone();
                move || {
                    warn!("Worker closed under router {}", router_id);
                }
            })
            .detach();

        Ok(Arc::new(MediasoupRouter {
            id: router_id,
            capabilities: router.rtp_capabilities().clone(),
            inner: Mutex::new(Some(router)),
        }))
    }

    fn close(&self) {
        if take_handle(&self.inner).is_some() {
            debug!("Closed worker {}", self.id);
        }
    }
}

struct MediasoupRouter {
    id: String,
    capabilities: RtpCapabilitiesFinalized,
    inner: Mutex<Option<Router>>,
}

#[async_trait]
impl MediaRouter for MediasoupRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn closed(&self) -> bool {
        clone_handle(&self.inner).map_or(true, |r| r.closed())
    }

    fn rtp_capabilities(&self) -> RtpCapabilitiesFinalized {
        self.capabilities.clone()
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool {
        let Ok(producer_id) = producer_id.parse::<ProducerId>() else {
            return false;
        };
        clone_handle(&self.inner).map_or(false, |r| r.can_consume(&producer_id, rtp_capabilities))
    }

    async fn create_transport(
        &self,
        direction: TransportDirection,
        config: &WebRtcTransportConfig,
    ) -> MediaResult<Arc<dyn MediaTransport>> {
        let router = clone_handle(&self.inner).ok_or_else(|| MediaError::Closed(self.id.clone()))?;

        let transport = router
            .create_webrtc_transport(config.to_transport_options())
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to create {direction} transport: {e}")))?;

        let transport_id = transport.id().to_string();
        transport
            .on_dtls_state_change({
                let transport_id = transport_id.clone();
                move |dtls_state| {
                    debug!("DTLS state {:?} for {} transport {}", dtls_state, direction, transport_id);
                }
            })
            .detach();

        info!("WebRTC transport {} created ({})", transport_id, direction);

        Ok(Arc::new(MediasoupTransport {
            id: transport_id,
            info: TransportInfo::from(&transport),
            inner: Mutex::new(Some(transport)),
        }))
    }

    fn close(&self) {
        if take_handle(&self.inner).is_some() {
            debug!("Closed router {}", self.id);
        }
    }
}

struct MediasoupTransport {
    id: String,
    info: TransportInfo,
    inner: Mutex<Option<WebRtcTransport>>,
}

impl MediasoupTransport {
    fn transport(&self) -> MediaResult<WebRtcTransport> {
        clone_handle(&self.inner).ok_or_else(|| MediaError::Closed(self.id.clone()))
    }
}

#[async_trait]
impl MediaTransport for MediasoupTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn info(&self) -> TransportInfo {
        self.info.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> MediaResult<()> {
        self.transport()?
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to connect transport: {e}")))
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        meta: ProducerMeta,
    ) -> MediaResult<Arc<dyn MediaProducer>> {
        let transport = self.transport()?;

        let mut options = ProducerOptions::new(kind, rtp_parameters);
        options.app_data = AppData::new(meta);

        let producer = transport
            .produce(options)
            .await
            .map_err(|e| MediaError::ProducerError(format!("Failed to create producer: {e}")))?;

        Ok(Arc::new(MediasoupProducer {
            id: producer.id().to_string(),
            kind,
            inner: Mutex::new(Some(producer)),
        }))
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> MediaResult<Arc<dyn MediaConsumer>> {
        let transport = self.transport()?;
        let producer_id: ProducerId = producer_id
            .parse()
            .map_err(|_| MediaError::ConsumerError(format!("Invalid producer ID: {producer_id}")))?;

        let mut options = ConsumerOptions::new(producer_id, rtp_capabilities);
        options.paused = paused;

        let consumer = transport
            .consume(options)
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to create consumer: {e}")))?;

        Ok(Arc::new(MediasoupConsumer {
            id: consumer.id().to_string(),
            producer_id: consumer.producer_id().to_string(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters().clone(),
            inner: Mutex::new(Some(consumer)),
        }))
    }

    fn on_close(&self, callback: CloseCallback) {
        match clone_handle(&self.inner) {
            Some(transport) => transport.on_close(callback).detach(),
            None => callback(),
        }
    }

    fn close(&self) {
        if take_handle(&self.inner).is_some() {
            debug!("Closed transport {}", self.id);
        }
    }
}

struct MediasoupProducer {
    id: String,
    kind: MediaKind,
    inner: Mutex<Option<Producer>>,
}

impl MediaProducer for MediasoupProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn on_close(&self, callback: CloseCallback) {
        match clone_handle(&self.inner) {
            Some(producer) => producer.on_close(callback).detach(),
            None => callback(),
        }
    }

    fn close(&self) {
        if take_handle(&self.inner).is_some() {
            debug!("Closed producer {}", self.id);
        }
    }
}

struct MediasoupConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    inner: Mutex<Option<Consumer>>,
}

#[async_trait]
impl MediaConsumer for MediasoupConsumer {
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
        self.rtp_parameters.clone()
    }

    async fn resume(&self) -> MediaResult<()> {
        let consumer = clone_handle(&self.inner).ok_or_else(|| MediaError::Closed(self.id.clone()))?;
        consumer
            .resume()
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to resume consumer: {e}")))
    }

    fn on_close(&self, callback: CloseCallback) {
        match clone_handle(&self.inner) {
            Some(consumer) => consumer.on_close(callback).detach(),
            None => callback(),
        }
    }

    fn close(&self) {
        if take_handle(&self.inner).is_some() {
            debug!("Closed consumer {}", self.id);
        }
    }
}

#![forbid(unsafe_code)]

// Capability interface over the media transport engine.
//
// Everything above this module talks to workers, routers, transports,
// producers and consumers through these traits only. `MediasoupEngine`
// is the production implementation; tests plug in an in-memory fake.

use crate::media::config::{RouterConfig, WebRtcTransportConfig, WorkerConfig};
use crate::media::types::{MediaResult, ProducerMeta, TransportDirection, TransportInfo};
use async_trait::async_trait;
use mediasoup::prelude::*;
use std::sync::Arc;

/// One-shot notification fired when an engine object goes away
pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// Spawns media workers
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_worker(&self, config: &WorkerConfig) -> MediaResult<Arc<dyn MediaWorker>>;
}

/// One media-processing worker
#[async_trait]
pub trait MediaWorker: Send + Sync {
    fn id(&self) -> String;

    fn closed(&self) -> bool;

    /// Registers a callback fired once when the worker dies unexpectedly
    fn on_dead(&self, callback: CloseCallback);

    async fn create_router(&self, config: &RouterConfig) -> MediaResult<Arc<dyn MediaRouter>>;

    fn close(&self);
}

/// Per-channel routing context
#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn id(&self) -> String;

    /// Router is closed, either explicitly or because its worker died
    fn closed(&self) -> bool;

    fn rtp_capabilities(&self) -> RtpCapabilitiesFinalized;

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn create_transport(
        &self,
        direction: TransportDirection,
        config: &WebRtcTransportConfig,
    ) -> MediaResult<Arc<dyn MediaTransport>>;

    fn close(&self);
}

/// Directional WebRTC transport
#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> String;

    fn info(&self) -> TransportInfo;

    async fn connect(&self, dtls_parameters: DtlsParameters) -> MediaResult<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        meta: ProducerMeta,
    ) -> MediaResult<Arc<dyn MediaProducer>>;

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> MediaResult<Arc<dyn MediaConsumer>>;

    fn on_close(&self, callback: CloseCallback);

    fn close(&self);
}

/// Outbound media stream
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> String;

    fn kind(&self) -> MediaKind;

    /// Fires on explicit close and on cascading close from the transport
    fn on_close(&self, callback: CloseCallback);

    fn close(&self);
}

/// Inbound subscription to a producer
#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> String;

    fn producer_id(&self) -> String;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    async fn resume(&self) -> MediaResult<()>;

    /// Fires on explicit close and on cascading close from transport or producer
    fn on_close(&self, callback: CloseCallback);

    fn close(&self);
}

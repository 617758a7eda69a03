#![forbid(unsafe_code)]

// Media module - worker supervision, channel routers, and the engine interface
// that transports, producers, and consumers are created through

pub mod config;
pub mod engine;
pub mod mediasoup_engine;
pub mod router_registry;
pub mod types;
pub mod worker_pool;

pub use config::{MediaConfig, RouterConfig, WebRtcTransportConfig, WorkerConfig};
pub use engine::{MediaConsumer, MediaEngine, MediaProducer, MediaRouter, MediaTransport, MediaWorker};
pub use mediasoup_engine::MediasoupEngine;
pub use router_registry::ChannelRouterRegistry;
pub use types::{
    MediaError, MediaResult, MediaRole, ProducerMeta, ProducerType, RouterCapabilities,
    TransportDirection, TransportInfo,
};
pub use worker_pool::{RespawnPolicy, WorkerPool};

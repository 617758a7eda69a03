#![forbid(unsafe_code)]

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice_service::config::ServiceConfig;
use voice_service::media::{ChannelRouterRegistry, MediasoupEngine, WorkerPool};
use voice_service::metrics::ServiceMetrics;
use voice_service::room::RoomStore;
use voice_service::signaling::{ConnectionRegistry, Dispatcher, SignalingServer};
use voice_service::store::{MemoryStore, RedisStore, StateStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_service=debug,mediasoup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServiceConfig::from_env()?;
    info!("Voice service starting ({})", config.environment);
    info!("Announcing {} for ICE candidates", config.public_ip);

    let media_config = config.media_config();
    let metrics = ServiceMetrics::new();

    let workers = WorkerPool::new(
        Arc::new(MediasoupEngine::new()),
        media_config.worker_config.clone(),
        config.respawn,
        metrics.clone(),
    );
    workers.initialize().await?;
    info!("Worker pool initialized with {} workers", workers.size());

    let store: Arc<dyn StateStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisStore::connect(url).await?),
        None => {
            warn!("REDIS_URL not set, keeping room state in process memory");
            Arc::new(MemoryStore::new())
        }
    };

    let routers = Arc::new(ChannelRouterRegistry::new(
        workers.clone(),
        media_config.router_config.clone(),
    ));
    let rooms = RoomStore::new(store, routers, config.room_grace, metrics.clone());
    let connections = Arc::new(ConnectionRegistry::new(metrics.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        connections,
        rooms.clone(),
        media_config.webrtc_transport_config.clone(),
        metrics.clone(),
    ));

    let server = SignalingServer::new(
        dispatcher,
        workers.clone(),
        metrics,
        &config.jwt_secret,
        &config.environment,
        config.max_connections,
    );

    // Run server with graceful shutdown
    tokio::select! {
        result = server.serve(config.port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    rooms.shutdown();
    workers.shutdown();

    info!("Server shutdown complete");
    Ok(())
}

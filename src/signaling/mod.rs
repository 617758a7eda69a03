#![forbid(unsafe_code)]

// Signaling module - HTTP surface and WebSocket signaling server

pub mod connection;
pub mod connections;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod queue;

pub use connections::ConnectionRegistry;
pub use dispatcher::Dispatcher;
pub use error::SignalingError;

use crate::auth;
use crate::media::worker_pool::WorkerPool;
use crate::metrics::ServiceMetrics;
use crate::room::participant::now_millis;
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    dispatcher: Arc<Dispatcher>,
    workers: Arc<WorkerPool>,
    metrics: ServiceMetrics,
    connection_semaphore: Arc<Semaphore>,
    jwt_secret: Arc<str>,
    environment: Arc<str>,
}

impl SignalingServer {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        workers: Arc<WorkerPool>,
        metrics: ServiceMetrics,
        jwt_secret: &str,
        environment: &str,
        max_connections: usize,
    ) -> Self {
        info!("Max connections: {}", max_connections);
        Self {
            dispatcher,
            workers,
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            jwt_secret: Arc::from(jwt_secret),
            environment: Arc::from(environment),
        }
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/signaling", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/rtp-capabilities", get(capabilities_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Starts the signaling server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = self.router();

        axum::serve(listener, app).await?;

        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "voice-service",
        "timestamp": now_millis(),
        "environment": &*server.environment,
        "rooms": server.dispatcher.rooms().room_count(),
        "connections": server.dispatcher.connections().connection_count(),
    }))
}

/// Codec capabilities shared by every channel router
async fn capabilities_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let capabilities = server.dispatcher.rooms().routers().capabilities();
    Json(serde_json::json!({ "rtpCapabilities": capabilities }))
}

/// Metrics handler - Prometheus text exposition format
async fn metrics_handler(State(server): State<SignalingServer>) -> Response {
    let rooms = server.dispatcher.rooms();
    let body = server.metrics.render_prometheus(
        rooms.room_count(),
        rooms.routers().router_count(),
        server.workers.live_count(),
    );
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// WebSocket upgrade handler. The bearer credential is checked before the
/// upgrade and before any connection state exists.
async fn ws_handler(
    State(server): State<SignalingServer>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let claims = match auth::authenticate(&headers, &server.jwt_secret) {
        Ok(claims) => claims,
        Err(e) => {
            warn!("Rejecting signaling upgrade: {}", e);
            return e.into_response();
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(65_536)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, server.dispatcher, server.metrics, claims.user_id, permit)
        })
}

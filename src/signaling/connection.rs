#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::dispatcher::Dispatcher;
use super::protocol::ServerMessage;
use super::queue::InboundQueue;
use crate::metrics::ServiceMetrics;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded outbound queue per client. Messages beyond this are dropped.
const CHANNEL_CAPACITY: usize = 64;

/// Handles a single authenticated WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Arc<Dispatcher>,
    metrics: ServiceMetrics,
    user_id: String,
    _permit: OwnedSemaphorePermit,
) {
    let connection_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection {} for user {}", connection_id, user_id);

    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let connections = dispatcher.connections().clone();
    connections.add(&connection_id, &user_id, tx);
    connections.send(
        &connection_id,
        &ServerMessage::Connected {
            connection_id: connection_id.clone(),
        },
    );

    let send_connection_id = connection_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for connection {}", send_connection_id);
    });

    let queue = InboundQueue::spawn(dispatcher.clone(), connection_id.clone());

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                debug!("WebSocket error on connection {}: {}", connection_id, e);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                if !queue.push(text.as_str().to_owned()).await {
                    break;
                }
            }
            Message::Close(_) => {
                info!("Client {} closed connection", connection_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            Message::Binary(_) => {
                warn!("Ignoring binary frame from connection {}", connection_id);
            }
        }
    }

    // Messages already received are still handled before teardown
    queue.finish().await;
    dispatcher.disconnect(&connection_id).await;

    // The registry held the last sender, so the send task ends on its own
    let _ = send_task.await;

    info!("Connection handler finished for {}", connection_id);
}

#![forbid(unsafe_code)]

// Connection registry - live signaling connections and their channel scope

use super::protocol::ServerMessage;
use crate::metrics::ServiceMetrics;
use mediasoup::prelude::RtpCapabilities;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct Connection {
    user_id: String,
    channel_id: Option<String>,
    rtp_capabilities: Option<RtpCapabilities>,
    sender: mpsc::Sender<Arc<String>>,
}

/// Read-only view of one connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub user_id: String,
    pub channel_id: Option<String>,
    pub rtp_capabilities: Option<RtpCapabilities>,
}

#[derive(Default)]
struct Tables {
    connections: HashMap<String, Connection>,
    by_user: HashMap<String, String>,
}

fn deliver(
    sender: &mpsc::Sender<Arc<String>>,
    json: Arc<String>,
    connection_id: &str,
    metrics: &ServiceMetrics,
) {
    match sender.try_send(json) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            metrics.inc_messages_dropped();
            warn!("Channel full for connection {}, dropping message", connection_id);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Channel closed for connection {} (disconnected)", connection_id);
        }
    }
}

fn serialize(message: &ServerMessage) -> Option<Arc<String>> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Arc::new(json)),
        Err(e) => {
            warn!("Failed to serialize message: {}", e);
            None
        }
    }
}

/// All live connections of this process, keyed by connection id, with the
/// inverse user id mapping.
pub struct ConnectionRegistry {
    tables: StdRwLock<Tables>,
    metrics: ServiceMetrics,
}

impl ConnectionRegistry {
    pub fn new(metrics: ServiceMetrics) -> Self {
        Self {
            tables: StdRwLock::new(Tables::default()),
            metrics,
        }
    }

    /// Registers a connection. A newer connection of the same user takes over
    /// the user mapping; the older one stays registered.
    pub fn add(&self, connection_id: &str, user_id: &str, sender: mpsc::Sender<Arc<String>>) {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        tables.connections.insert(
            connection_id.to_string(),
            Connection {
                user_id: user_id.to_string(),
                channel_id: None,
                rtp_capabilities: None,
                sender,
            },
        );
        if let Some(previous) = tables.by_user.insert(user_id.to_string(), connection_id.to_string()) {
            if previous != connection_id {
                info!("User {} superseded connection {} with {}", user_id, previous, connection_id);
            }
        }
    }

    /// Unregisters a connection and returns its final state
    pub fn remove(&self, connection_id: &str) -> Option<ConnectionInfo> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let connection = tables.connections.remove(connection_id)?;
        if tables.by_user.get(&connection.user_id).is_some_and(|c| c == connection_id) {
            tables.by_user.remove(&connection.user_id);
        }
        Some(ConnectionInfo {
            connection_id: connection_id.to_string(),
            user_id: connection.user_id,
            channel_id: connection.channel_id,
            rtp_capabilities: connection.rtp_capabilities,
        })
    }

    pub fn info(&self, connection_id: &str) -> Option<ConnectionInfo> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.connections.get(connection_id).map(|c| ConnectionInfo {
            connection_id: connection_id.to_string(),
            user_id: c.user_id.clone(),
            channel_id: c.channel_id.clone(),
            rtp_capabilities: c.rtp_capabilities.clone(),
        })
    }

    pub fn connection_for_user(&self, user_id: &str) -> Option<String> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.by_user.get(user_id).cloned()
    }

    /// Scopes the connection to a channel. Returns false if it is gone.
    pub fn set_channel(
        &self,
        connection_id: &str,
        channel_id: &str,
        rtp_capabilities: Option<RtpCapabilities>,
    ) -> bool {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        match tables.connections.get_mut(connection_id) {
            Some(connection) => {
                connection.channel_id = Some(channel_id.to_string());
                connection.rtp_capabilities = rtp_capabilities;
                true
            }
            None => false,
        }
    }

    pub fn clear_channel(&self, connection_id: &str) {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if let Some(connection) = tables.connections.get_mut(connection_id) {
            connection.channel_id = None;
            connection.rtp_capabilities = None;
        }
    }

    /// Delivers to one connection; silently does nothing if it is gone
    pub fn send(&self, connection_id: &str, message: &ServerMessage) {
        let sender = {
            let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
            tables.connections.get(connection_id).map(|c| c.sender.clone())
        };
        let Some(sender) = sender else {
            debug!("Dropping message for unknown connection {}", connection_id);
            return;
        };
        if let Some(json) = serialize(message) {
            deliver(&sender, json, connection_id, &self.metrics);
        }
    }

    /// Delivers to the user's current connection, if any
    pub fn send_to_user(&self, user_id: &str, message: &ServerMessage) {
        match self.connection_for_user(user_id) {
            Some(connection_id) => self.send(&connection_id, message),
            None => debug!("Dropping message for user {} with no connection", user_id),
        }
    }

    /// Delivers one copy to every connection scoped to the channel, except
    /// those of `except_user`. The message is serialized once.
    pub fn broadcast_to_channel(&self, channel_id: &str, message: &ServerMessage, except_user: Option<&str>) {
        let Some(json) = serialize(message) else {
            return;
        };

        let recipients: Vec<(String, mpsc::Sender<Arc<String>>)> = {
            let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
            tables
                .connections
                .iter()
                .filter(|(_, c)| c.channel_id.as_deref() == Some(channel_id))
                .filter(|(_, c)| except_user != Some(c.user_id.as_str()))
                .map(|(id, c)| (id.clone(), c.sender.clone()))
                .collect()
        };

        for (connection_id, sender) in recipients {
            deliver(&sender, json.clone(), &connection_id, &self.metrics);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.tables.read().unwrap_or_else(|e| e.into_inner()).connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv_all(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(json) = rx.try_recv() {
            out.push(serde_json::from_str(&json).unwrap());
        }
        out
    }

    fn joined(user: &str) -> ServerMessage {
        ServerMessage::UserJoined { user_id: user.into() }
    }

    #[test]
    fn broadcast_targets_channel_minus_excluded_user() {
        let registry = ConnectionRegistry::new(ServiceMetrics::new());
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let (tx_c, mut rx_c) = mpsc::channel(8);
        let (tx_d, mut rx_d) = mpsc::channel(8);
        registry.add("ca", "alice", tx_a);
        registry.add("cb", "bob", tx_b);
        registry.add("cc", "carol", tx_c);
        registry.add("cd", "dave", tx_d);
        registry.set_channel("ca", "general", None);
        registry.set_channel("cb", "general", None);
        registry.set_channel("cc", "random", None);

        registry.broadcast_to_channel("general", &joined("alice"), Some("alice"));

        assert!(recv_all(&mut rx_a).is_empty());
        assert_eq!(recv_all(&mut rx_b), vec![serde_json::json!({ "type": "userJoined", "userId": "alice" })]);
        assert!(recv_all(&mut rx_c).is_empty());
        assert!(recv_all(&mut rx_d).is_empty());

        registry.broadcast_to_channel("general", &joined("x"), None);
        assert_eq!(recv_all(&mut rx_a).len(), 1);
        assert_eq!(recv_all(&mut rx_b).len(), 1);
    }

    #[test]
    fn closed_recipient_does_not_block_others() {
        let registry = ConnectionRegistry::new(ServiceMetrics::new());
        let (tx_a, rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(1);
        registry.add("ca", "alice", tx_a);
        registry.add("cb", "bob", tx_b);
        registry.set_channel("ca", "general", None);
        registry.set_channel("cb", "general", None);
        drop(rx_a);

        registry.broadcast_to_channel("general", &joined("x"), None);
        // bob's queue is now full; the next copy is dropped
        registry.broadcast_to_channel("general", &joined("y"), None);

        let got = recv_all(&mut rx_b);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["userId"], "x");
    }

    #[test]
    fn send_to_unknown_connection_is_a_no_op() {
        let registry = ConnectionRegistry::new(ServiceMetrics::new());
        registry.send("nope", &joined("x"));

        let (tx, mut rx) = mpsc::channel(8);
        registry.add("c1", "alice", tx);
        registry.send("c1", &joined("x"));
        assert_eq!(recv_all(&mut rx).len(), 1);
    }

    #[test]
    fn newer_connection_supersedes_user_mapping() {
        let registry = ConnectionRegistry::new(ServiceMetrics::new());
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);
        registry.add("old", "alice", tx1);
        registry.add("new", "alice", tx2);
        assert_eq!(registry.connection_for_user("alice").as_deref(), Some("new"));

        let removed = registry.remove("old").unwrap();
        assert_eq!(removed.user_id, "alice");
        assert_eq!(registry.connection_for_user("alice").as_deref(), Some("new"));
        assert_eq!(registry.connection_count(), 1);

        registry.remove("new");
        assert!(registry.connection_for_user("alice").is_none());
        assert!(registry.remove("new").is_none());
    }

    #[test]
    fn send_to_user_follows_current_connection() {
        let registry = ConnectionRegistry::new(ServiceMetrics::new());
        registry.send_to_user("alice", &joined("x"));

        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        registry.add("old", "alice", tx1);
        registry.send_to_user("alice", &joined("x"));
        assert_eq!(recv_all(&mut rx1).len(), 1);

        registry.add("new", "alice", tx2);
        registry.send_to_user("alice", &joined("y"));
        assert!(recv_all(&mut rx1).is_empty());
        assert_eq!(recv_all(&mut rx2)[0]["userId"], "y");
    }

    #[test]
    fn channel_scope_round_trip() {
        let registry = ConnectionRegistry::new(ServiceMetrics::new());
        let (tx, _rx) = mpsc::channel(8);
        registry.add("c1", "alice", tx);
        assert!(registry.set_channel("c1", "general", None));
        assert_eq!(registry.info("c1").unwrap().channel_id.as_deref(), Some("general"));

        registry.clear_channel("c1");
        assert!(registry.info("c1").unwrap().channel_id.is_none());
        assert!(!registry.set_channel("gone", "general", None));
    }
}

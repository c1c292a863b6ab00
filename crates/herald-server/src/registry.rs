use std::sync::Arc;

use dashmap::DashMap;
use herald_core::ConnectionId;
use herald_telemetry::MetricsRecorder;
use tracing::debug;

use crate::connection::ClientConnection;
use crate::metrics::RELAY_CONNECTIONS;

/// Registry of all connected WebSocket clients.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ClientConnection>>,
    metrics: Arc<MetricsRecorder>,
}

impl ConnectionRegistry {
    pub fn new(metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            connections: DashMap::new(),
            metrics,
        }
    }

    /// Add a connection. Registering an id twice replaces the earlier entry.
    pub fn register(&self, connection: Arc<ClientConnection>) {
        let id = connection.id.clone();
        if let Some(previous) = self.connections.insert(id.clone(), connection.clone()) {
            if !Arc::ptr_eq(&previous, &connection) {
                debug!(conn_id = %id, "replaced existing connection");
                previous.close();
            }
        }
        self.publish_count();
    }

    /// Remove a connection and close it. Unknown ids are a no-op.
    pub fn unregister(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        let removed = self.connections.remove(id).map(|(_, conn)| conn);
        if let Some(conn) = &removed {
            conn.close();
            self.publish_count();
        }
        removed
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    /// Point-in-time copy of the live connections, in no particular order.
    pub fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of connected clients.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn publish_count(&self) {
        self.metrics
            .gauge_set(RELAY_CONNECTIONS, &[], self.connections.len() as f64);
    }
}

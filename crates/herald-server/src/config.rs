//! Server configuration.

use std::time::Duration;

use crate::delivery::DeliveryPolicy;

/// Configuration for the relay listener and its connections.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"0.0.0.0"`).
    pub host: String,
    /// Port to bind. `0` picks a free port.
    pub port: u16,
    /// Ping cadence.
    pub heartbeat_interval: Duration,
    /// Close a connection after this long without any inbound frame.
    pub heartbeat_timeout: Duration,
    /// Frames buffered per connection writer.
    pub max_send_queue: usize,
    /// How long shutdown waits for tasks before giving up on them.
    pub shutdown_timeout: Duration,
    pub delivery: DeliveryPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            max_send_queue: 64,
            shutdown_timeout: Duration::from_secs(5),
            delivery: DeliveryPolicy::default(),
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

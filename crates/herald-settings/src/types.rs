//! Settings type definitions.
//!
//! Field names are camelCase on disk. Every section is `#[serde(default)]`,
//! so a settings file only needs the keys it changes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type for the relay.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "queue": { "path": "/var/lib/herald/reminder.json" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeraldSettings {
    pub server: ServerSettings,
    pub queue: QueueSettings,
    pub delivery: DeliverySettings,
    pub logging: LoggingSettings,
}

impl HeraldSettings {
    /// Reject values the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(SettingsError::InvalidValue("server.port must not be 0".into()));
        }
        if self.server.host.trim().is_empty() {
            return Err(SettingsError::InvalidValue("server.host must not be empty".into()));
        }
        if self.queue.path.as_os_str().is_empty() {
            return Err(SettingsError::InvalidValue("queue.path must not be empty".into()));
        }
        if self.delivery.broadcast_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "delivery.broadcastIntervalMs must be positive".into(),
            ));
        }
        if self.delivery.resend_every_cycles == 0 {
            return Err(SettingsError::InvalidValue(
                "delivery.resendEveryCycles must be at least 1".into(),
            ));
        }
        if self.server.heartbeat_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatIntervalSecs must be positive".into(),
            ));
        }
        if self.server.heartbeat_timeout_secs < self.server.heartbeat_interval_secs {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatTimeoutSecs must not be shorter than the interval".into(),
            ));
        }
        Ok(())
    }

    /// `host:port` the listener binds.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Listener and per-connection settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// WebSocket (and health) port.
    pub port: u16,
    /// Ping cadence in seconds.
    pub heartbeat_interval_secs: u64,
    /// A connection silent for this long is dropped.
    pub heartbeat_timeout_secs: u64,
    /// Outbound frames buffered per connection before sends start failing.
    pub max_send_queue: usize,
    /// Grace period for connection tasks on shutdown.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_send_queue: 64,
            shutdown_timeout_secs: 5,
        }
    }
}

impl ServerSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Where the queue document lives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueSettings {
    pub path: PathBuf,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("reminder.json"),
        }
    }
}

/// Broadcast cadence and retry policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliverySettings {
    pub broadcast_interval_ms: u64,
    /// Send the same head to the same connection once every N cycles.
    pub resend_every_cycles: u32,
    /// Cycles a connection skips an item after answering it with a failure.
    pub nack_backoff_cycles: u32,
    pub send_timeout_ms: u64,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            broadcast_interval_ms: 1000,
            resend_every_cycles: 1,
            nack_backoff_cycles: 1,
            send_timeout_ms: 2000,
        }
    }
}

impl DeliverySettings {
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level (`trace`..`error`). `RUST_LOG` wins when set.
    pub level: String,
    /// One JSON object per line.
    pub json: bool,
    /// Per-module overrides, e.g. `{"herald_server": "debug"}`.
    pub module_levels: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            module_levels: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = HeraldSettings::default();
        assert_eq!(s.bind_address(), "0.0.0.0:8080");
        assert_eq!(s.queue.path, PathBuf::from("reminder.json"));
        assert_eq!(s.delivery.broadcast_interval(), Duration::from_secs(1));
        assert_eq!(s.delivery.send_timeout(), Duration::from_secs(2));
        assert_eq!(s.server.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(s.server.heartbeat_timeout(), Duration::from_secs(90));
        assert_eq!(s.server.shutdown_timeout(), Duration::from_secs(5));
        assert_eq!(s.logging.level, "info");
        s.validate().unwrap();
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(HeraldSettings::default()).unwrap();
        assert_eq!(json["delivery"]["broadcastIntervalMs"], 1000);
        assert_eq!(json["server"]["heartbeatTimeoutSecs"], 90);
        assert_eq!(json["logging"]["moduleLevels"], serde_json::json!({}));
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let s: HeraldSettings =
            serde_json::from_str(r#"{"delivery": {"sendTimeoutMs": 500}}"#).unwrap();
        assert_eq!(s.delivery.send_timeout_ms, 500);
        assert_eq!(s.delivery.broadcast_interval_ms, 1000);
        assert_eq!(s.server.port, 8080);
    }

    #[test]
    fn validate_rejects_zero_interval() {
        let mut s = HeraldSettings::default();
        s.delivery.broadcast_interval_ms = 0;
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_zero_port() {
        let mut s = HeraldSettings::default();
        s.server.port = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_heartbeat_interval() {
        let mut s = HeraldSettings::default();
        s.server.heartbeat_interval_secs = 0;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("heartbeatIntervalSecs"), "{err}");
    }

    #[test]
    fn validate_rejects_timeout_below_interval() {
        let mut s = HeraldSettings::default();
        s.server.heartbeat_timeout_secs = 10;
        assert!(s.validate().is_err());
    }
}

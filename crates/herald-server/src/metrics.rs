// Metric name constants shared by the relay components.

/// Broadcast cycles run (counter).
pub const RELAY_CYCLES: &str = "relay.cycles";
/// Frames handed to connection writers (counter).
pub const RELAY_ITEMS_SENT: &str = "relay.items_sent";
/// Sends that failed or timed out (counter).
pub const RELAY_SEND_FAILURES: &str = "relay.send_failures";
/// Inbound client messages by handling result (counter, labels: outcome).
pub const RELAY_ACKS: &str = "relay.acks";
/// Registered connections (gauge).
pub const RELAY_CONNECTIONS: &str = "relay.connections";
/// Wall time of one broadcast cycle in milliseconds (histogram).
pub const RELAY_CYCLE_MS: &str = "relay.cycle_ms";

//! Liveness monitoring for idle connections.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::connection::ClientConnection;

/// Shortest interval the heartbeat and ping timers run at.
pub(crate) const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The client stopped responding within the timeout window.
    TimedOut,
    /// The heartbeat was cancelled externally.
    Cancelled,
}

/// Watch a connection's alive flag.
///
/// At each `interval` tick the flag is checked and reset. Once
/// `timeout / interval` consecutive ticks (at least 1) pass with no inbound
/// frame, the connection is considered dead. The writer task sends the pings
/// that keep well-behaved clients answering.
pub async fn run_heartbeat(
    connection: Arc<ClientConnection>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let interval = interval.max(MIN_HEARTBEAT_INTERVAL);
    let mut check_interval = time::interval(interval);
    // first tick completes immediately
    check_interval.tick().await;

    let mut missed: u32 = 0;
    let max_missed = u32::try_from(timeout.as_millis() / interval.as_millis().max(1))
        .unwrap_or(u32::MAX)
        .max(1);

    loop {
        tokio::select! {
            _ = check_interval.tick() => {
                if connection.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= max_missed {
                        return HeartbeatResult::TimedOut;
                    }
                }
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}

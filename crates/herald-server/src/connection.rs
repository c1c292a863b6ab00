//! WebSocket client connection state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use herald_core::{ConnectionId, ItemId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::delivery::{Decision, DeliveryPolicy, DeliveryState};
use crate::error::SendError;

/// A connected WebSocket client.
///
/// Frames go through a bounded channel to the connection's writer task; the
/// socket itself is owned by that task.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Send channel to the client's WebSocket write task.
    tx: mpsc::Sender<Arc<str>>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Whether the client has sent anything since the last heartbeat check.
    pub is_alive: AtomicBool,
    /// When the last inbound frame was received.
    last_seen: Mutex<Instant>,
    delivery: Mutex<DeliveryState>,
    /// Cancelled when the connection should wind down.
    close: CancellationToken,
}

impl ClientConnection {
    /// Create a connection whose close token is a child of `parent`, so
    /// server shutdown closes it too.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Arc<str>>, parent: &CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            id,
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_seen: Mutex::new(now),
            delivery: Mutex::new(DeliveryState::default()),
            close: parent.child_token(),
        }
    }

    /// Hand a frame to the writer, waiting at most `timeout` for buffer space.
    pub async fn send(&self, frame: Arc<str>, timeout: Duration) -> Result<(), SendError> {
        match tokio::time::timeout(timeout, self.tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Closed),
            Err(_) => Err(SendError::TimedOut(timeout)),
        }
    }

    /// Ask the delivery policy whether `head` goes out to this client now.
    pub fn decide(&self, policy: &DeliveryPolicy, head: &ItemId) -> Decision {
        policy.decide(&mut self.delivery.lock(), head)
    }

    /// The client answered `request_id` with a non-completion status.
    pub fn record_nack(&self, policy: &DeliveryPolicy, request_id: &str) {
        policy.record_nack(&mut self.delivery.lock(), request_id);
    }

    /// Mark the connection as alive (any inbound frame).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    /// Duration since the last inbound frame (or connection establishment).
    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Signal the reader, writer and heartbeat tasks to stop. Idempotent.
    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) was called or the server shut down.
    pub async fn closed(&self) {
        self.close.cancelled().await;
    }

    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

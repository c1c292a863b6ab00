//! Periodic fan-out of the queue head.
//!
//! Each cycle reads the store, serializes the first item once and hands the
//! frame to every connection the delivery policy lets through. Nothing is
//! removed here: items leave the queue only through [`AckHandler`].
//!
//! [`AckHandler`]: crate::ack::AckHandler

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use herald_core::ItemId;
use herald_store::QueueStore;
use herald_telemetry::MetricsRecorder;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::delivery::{Decision, DeliveryPolicy};
use crate::metrics::{RELAY_CYCLES, RELAY_CYCLE_MS, RELAY_ITEMS_SENT, RELAY_SEND_FAILURES};
use crate::registry::ConnectionRegistry;

/// What one cycle did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Item at the head of the queue, if any.
    pub head: Option<ItemId>,
    /// Connections the frame was handed to.
    pub delivered: usize,
    /// Connections skipped by the delivery policy.
    pub suppressed: usize,
    /// Connections unregistered after a failed or timed-out send.
    pub dropped: usize,
}

pub struct BroadcastLoop {
    store: Arc<QueueStore>,
    registry: Arc<ConnectionRegistry>,
    policy: DeliveryPolicy,
    metrics: Arc<MetricsRecorder>,
}

impl BroadcastLoop {
    pub fn new(
        store: Arc<QueueStore>,
        registry: Arc<ConnectionRegistry>,
        policy: DeliveryPolicy,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            store,
            registry,
            policy,
            metrics,
        }
    }

    pub fn policy(&self) -> &DeliveryPolicy {
        &self.policy
    }

    /// Run one broadcast cycle.
    pub async fn run_cycle(&self) -> CycleReport {
        let started = Instant::now();
        let report = self.deliver_head().await;

        self.metrics.counter_inc(RELAY_CYCLES, &[], 1);
        self.metrics
            .histogram_observe(RELAY_CYCLE_MS, &[], started.elapsed().as_secs_f64() * 1000.0);
        report
    }

    async fn deliver_head(&self) -> CycleReport {
        let store = Arc::clone(&self.store);
        let head = match tokio::task::spawn_blocking(move || store.head()).await {
            Ok(head) => head,
            Err(e) => {
                error!(error = %e, "queue read task failed");
                return CycleReport::default();
            }
        };
        let Some(item) = head else {
            return CycleReport::default();
        };

        let mut report = CycleReport {
            head: Some(item.request_id.clone()),
            ..CycleReport::default()
        };

        let frame: Arc<str> = match item.to_wire() {
            Ok(text) => Arc::from(text),
            Err(e) => {
                error!(request_id = %item.request_id, error = %e, "failed to serialize queue head");
                return report;
            }
        };

        let targets: Vec<_> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|conn| match conn.decide(&self.policy, &item.request_id) {
                Decision::Send => true,
                Decision::Suppress => {
                    report.suppressed += 1;
                    false
                }
            })
            .collect();

        let timeout = self.policy.send_timeout;
        let sends = targets.into_iter().map(|conn| {
            let frame = Arc::clone(&frame);
            async move {
                let result = conn.send(frame, timeout).await;
                (conn, result)
            }
        });

        for (conn, result) in join_all(sends).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(conn_id = %conn.id, error = %e, "send failed, dropping connection");
                    self.registry.unregister(&conn.id);
                    report.dropped += 1;
                }
            }
        }

        if report.delivered > 0 {
            self.metrics
                .counter_inc(RELAY_ITEMS_SENT, &[], report.delivered as u64);
        }
        if report.dropped > 0 {
            self.metrics
                .counter_inc(RELAY_SEND_FAILURES, &[], report.dropped as u64);
        }
        debug!(
            request_id = %item.request_id,
            delivered = report.delivered,
            suppressed = report.suppressed,
            dropped = report.dropped,
            "broadcast cycle"
        );
        report
    }

    /// Run cycles every `policy.interval` until `cancel` fires. A cycle in
    /// progress finishes before the loop exits.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.policy.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.policy.interval.as_millis() as u64, "broadcast loop started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
            }
        }
        info!("broadcast loop stopped");
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ClientConnection;
    use herald_core::{ConnectionId, QueueItem};
    use serde_json::Map;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Fixture {
        _dir: TempDir,
        store: Arc<QueueStore>,
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<MetricsRecorder>,
        shutdown: CancellationToken,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let store = Arc::new(QueueStore::new(dir.path().join("reminder.json")));
            let metrics = Arc::new(MetricsRecorder::new());
            let registry = Arc::new(ConnectionRegistry::new(metrics.clone()));
            Self {
                _dir: dir,
                store,
                registry,
                metrics,
                shutdown: CancellationToken::new(),
            }
        }

        fn broadcaster(&self, policy: DeliveryPolicy) -> BroadcastLoop {
            BroadcastLoop::new(
                self.store.clone(),
                self.registry.clone(),
                policy,
                self.metrics.clone(),
            )
        }

        fn connect(&self, id: &str, capacity: usize) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<str>>) {
            let (tx, rx) = mpsc::channel(capacity);
            let conn = Arc::new(ClientConnection::new(ConnectionId::from_raw(id), tx, &self.shutdown));
            self.registry.register(conn.clone());
            (conn, rx)
        }

        fn push(&self, id: &str) {
            let mut item = QueueItem::new("reminder", "add", Map::new());
            item.request_id = ItemId::from_raw(id);
            self.store.append(item).unwrap();
        }
    }

    fn policy() -> DeliveryPolicy {
        DeliveryPolicy {
            send_timeout: Duration::from_millis(50),
            ..DeliveryPolicy::default()
        }
    }

    fn request_id(frame: &str) -> String {
        let value: serde_json::Value = serde_json::from_str(frame).unwrap();
        value["request_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn empty_store_sends_nothing() {
        let fx = Fixture::new();
        let (_conn, mut rx) = fx.connect("a", 4);

        let report = fx.broadcaster(policy()).run_cycle().await;
        assert_eq!(report, CycleReport::default());
        assert!(rx.try_recv().is_err());
        assert!(!fx.store.path().exists());
        assert_eq!(fx.metrics.counter_get(RELAY_CYCLES, &[]), 1);
    }

    #[tokio::test]
    async fn head_goes_to_every_connection() {
        let fx = Fixture::new();
        fx.push("A");
        fx.push("B");
        let (_a, mut rx_a) = fx.connect("a", 4);
        let (_b, mut rx_b) = fx.connect("b", 4);

        let report = fx.broadcaster(policy()).run_cycle().await;
        assert_eq!(report.head, Some(ItemId::from_raw("A")));
        assert_eq!(report.delivered, 2);

        let frame_a = rx_a.recv().await.unwrap();
        let frame_b = rx_b.recv().await.unwrap();
        assert_eq!(request_id(&frame_a), "A");
        assert_eq!(frame_a, frame_b);
        assert_eq!(fx.metrics.counter_get(RELAY_ITEMS_SENT, &[]), 2);
    }

    #[tokio::test]
    async fn unacknowledged_head_repeats_every_cycle() {
        let fx = Fixture::new();
        fx.push("A");
        let (_conn, mut rx) = fx.connect("a", 8);
        let broadcaster = fx.broadcaster(policy());

        for _ in 0..3 {
            broadcaster.run_cycle().await;
        }
        for _ in 0..3 {
            assert_eq!(request_id(&rx.recv().await.unwrap()), "A");
        }
        assert_eq!(fx.store.len(), 1);
    }

    #[tokio::test]
    async fn frame_is_the_stored_item_unmodified() {
        let fx = Fixture::new();
        std::fs::write(
            fx.store.path(),
            r#"[{"request_id":"X","type":"timer","action":"start","payload":{"duration_seconds":5},"timestamp":"2025-01-01T00:00:00","source":"watch"}]"#,
        )
        .unwrap();
        let (_conn, mut rx) = fx.connect("a", 1);

        fx.broadcaster(policy()).run_cycle().await;
        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["source"], "watch");
        assert_eq!(frame["payload"]["duration_seconds"], 5);
    }

    #[tokio::test]
    async fn closed_connection_is_dropped_others_still_served() {
        let fx = Fixture::new();
        fx.push("A");
        let (gone, rx_gone) = fx.connect("gone", 4);
        let (_ok, mut rx_ok) = fx.connect("ok", 4);
        drop(rx_gone);

        let report = fx.broadcaster(policy()).run_cycle().await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(request_id(&rx_ok.recv().await.unwrap()), "A");
        assert!(fx.registry.get(&gone.id).is_none());
        assert!(gone.is_closed());
        assert_eq!(fx.metrics.counter_get(RELAY_SEND_FAILURES, &[]), 1);
    }

    #[tokio::test]
    async fn stalled_connection_times_out() {
        let fx = Fixture::new();
        fx.push("A");
        let (_stalled, _rx_stalled) = fx.connect("stalled", 1);
        let (_ok, mut rx_ok) = fx.connect("ok", 4);
        let broadcaster = fx.broadcaster(policy());

        // fills the stalled writer's buffer
        broadcaster.run_cycle().await;
        let report = broadcaster.run_cycle().await;

        assert_eq!(report.dropped, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(fx.registry.count(), 1);
        assert_eq!(request_id(&rx_ok.recv().await.unwrap()), "A");
    }

    #[tokio::test]
    async fn late_joiner_receives_current_head() {
        let fx = Fixture::new();
        fx.push("A");
        let broadcaster = fx.broadcaster(policy());
        broadcaster.run_cycle().await;

        let (_late, mut rx) = fx.connect("late", 1);
        let report = broadcaster.run_cycle().await;
        assert_eq!(report.delivered, 1);
        assert_eq!(request_id(&rx.recv().await.unwrap()), "A");
    }

    #[tokio::test]
    async fn nacked_connection_is_suppressed_for_backoff() {
        let fx = Fixture::new();
        fx.push("A");
        let (conn, mut rx) = fx.connect("a", 8);
        let broadcaster = fx.broadcaster(policy());

        assert_eq!(broadcaster.run_cycle().await.delivered, 1);
        conn.record_nack(broadcaster.policy(), "A");

        let report = broadcaster.run_cycle().await;
        assert_eq!(report.suppressed, 1);
        assert_eq!(report.delivered, 0);

        assert_eq!(broadcaster.run_cycle().await.delivered, 1);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn head_advances_after_removal() {
        let fx = Fixture::new();
        fx.push("A");
        fx.push("B");
        let (_conn, mut rx) = fx.connect("a", 4);
        let broadcaster = fx.broadcaster(policy());

        broadcaster.run_cycle().await;
        fx.store.remove_by_id("A").unwrap();
        let report = broadcaster.run_cycle().await;

        assert_eq!(report.head, Some(ItemId::from_raw("B")));
        assert_eq!(request_id(&rx.recv().await.unwrap()), "A");
        assert_eq!(request_id(&rx.recv().await.unwrap()), "B");
    }

    #[tokio::test]
    async fn corrupt_store_is_treated_as_empty() {
        let fx = Fixture::new();
        std::fs::write(fx.store.path(), "{ not json").unwrap();
        let (_conn, mut rx) = fx.connect("a", 1);

        let report = fx.broadcaster(policy()).run_cycle().await;
        assert_eq!(report.head, None);
        assert!(rx.try_recv().is_err());
        assert_eq!(std::fs::read_to_string(fx.store.path()).unwrap(), "{ not json");
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let fx = Fixture::new();
        fx.push("A");
        let (_conn, mut rx) = fx.connect("a", 64);
        let broadcaster = Arc::new(fx.broadcaster(DeliveryPolicy {
            interval: Duration::from_millis(10),
            ..policy()
        }));

        let cancel = CancellationToken::new();
        let handle = broadcaster.spawn(cancel.clone());
        assert_eq!(request_id(&rx.recv().await.unwrap()), "A");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

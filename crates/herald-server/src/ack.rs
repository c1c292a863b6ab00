use std::sync::Arc;

use herald_core::{Acknowledgment, ResultMessage};
use herald_store::QueueStore;
use herald_telemetry::MetricsRecorder;
use tracing::{debug, info, warn};

use crate::connection::ClientConnection;
use crate::delivery::DeliveryPolicy;
use crate::metrics::RELAY_ACKS;

/// Result of handling one inbound text frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// Completion status; the item was removed from the queue.
    Removed(String),
    /// Completion status for an id no longer (or never) queued.
    Unknown(String),
    /// Non-completion status; the item stays and this connection backs off.
    Deferred(String),
    /// Well-formed but not a result message.
    Ignored,
    /// Not a JSON object of the expected shape.
    Malformed,
    /// The store could not be updated; the item stays queued.
    Failed(String),
}

impl AckOutcome {
    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Removed(_) => "removed",
            Self::Unknown(_) => "unknown",
            Self::Deferred(_) => "deferred",
            Self::Ignored => "ignored",
            Self::Malformed => "malformed",
            Self::Failed(_) => "failed",
        }
    }
}

/// Interprets client result messages. Never closes the connection.
pub struct AckHandler {
    store: Arc<QueueStore>,
    policy: DeliveryPolicy,
    metrics: Arc<MetricsRecorder>,
}

impl AckHandler {
    pub fn new(store: Arc<QueueStore>, policy: DeliveryPolicy, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            store,
            policy,
            metrics,
        }
    }

    pub async fn handle(&self, conn: &ClientConnection, text: &str) -> AckOutcome {
        let outcome = self.interpret(conn, text).await;
        self.metrics
            .counter_inc(RELAY_ACKS, &[("outcome", outcome.label())], 1);
        outcome
    }

    async fn interpret(&self, conn: &ClientConnection, text: &str) -> AckOutcome {
        let message = match ResultMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(conn_id = %conn.id, error = %e, "ignoring malformed client message");
                return AckOutcome::Malformed;
            }
        };

        match message.classify() {
            Acknowledgment::Complete { request_id, status } => {
                let store = Arc::clone(&self.store);
                let id = request_id.clone();
                match tokio::task::spawn_blocking(move || store.remove_by_id(&id)).await {
                    Ok(Ok(true)) => {
                        info!(conn_id = %conn.id, request_id = %request_id, status = status.as_str(), "item acknowledged");
                        AckOutcome::Removed(request_id)
                    }
                    Ok(Ok(false)) => {
                        debug!(conn_id = %conn.id, request_id = %request_id, "acknowledgment for unknown item");
                        AckOutcome::Unknown(request_id)
                    }
                    Ok(Err(e)) => {
                        warn!(request_id = %request_id, error = %e, "failed to remove acknowledged item");
                        AckOutcome::Failed(request_id)
                    }
                    Err(e) => {
                        warn!(request_id = %request_id, error = %e, "remove task failed");
                        AckOutcome::Failed(request_id)
                    }
                }
            }
            Acknowledgment::Defer { request_id, status } => {
                debug!(conn_id = %conn.id, request_id = %request_id, status = status.as_str(), "client deferred item");
                conn.record_nack(&self.policy, &request_id);
                AckOutcome::Deferred(request_id)
            }
            Acknowledgment::Irrelevant => AckOutcome::Ignored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::Decision;
    use herald_core::{ConnectionId, ItemId, QueueItem};
    use serde_json::Map;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        _dir: TempDir,
        store: Arc<QueueStore>,
        metrics: Arc<MetricsRecorder>,
        handler: AckHandler,
        conn: ClientConnection,
        _rx: mpsc::Receiver<Arc<str>>,
    }

    fn fixture(ids: &[&str]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(QueueStore::new(dir.path().join("reminder.json")));
        for id in ids {
            let mut item = QueueItem::new("reminder", "add", Map::new());
            item.request_id = ItemId::from_raw(*id);
            store.append(item).unwrap();
        }
        let metrics = Arc::new(MetricsRecorder::new());
        let handler = AckHandler::new(store.clone(), DeliveryPolicy::default(), metrics.clone());
        let (tx, rx) = mpsc::channel(4);
        let conn = ClientConnection::new(ConnectionId::new(), tx, &CancellationToken::new());
        Fixture {
            _dir: dir,
            store,
            metrics,
            handler,
            conn,
            _rx: rx,
        }
    }

    fn ids(store: &QueueStore) -> Vec<String> {
        store
            .load()
            .into_iter()
            .map(|i| i.request_id.to_string())
            .collect()
    }

    #[tokio::test]
    async fn success_removes_item() {
        let fx = fixture(&["A", "B"]);
        let outcome = fx
            .handler
            .handle(
                &fx.conn,
                r#"{"action":"result","type":"reminder","status":"success","request_id":"A"}"#,
            )
            .await;
        assert_eq!(outcome, AckOutcome::Removed("A".into()));
        assert_eq!(ids(&fx.store), ["B"]);
        assert_eq!(fx.metrics.counter_get(RELAY_ACKS, &[("outcome", "removed")]), 1);
    }

    #[tokio::test]
    async fn skipped_removes_item() {
        let fx = fixture(&["A", "B"]);
        let outcome = fx
            .handler
            .handle(&fx.conn, r#"{"action":"result","status":"skipped","request_id":"B"}"#)
            .await;
        assert_eq!(outcome, AckOutcome::Removed("B".into()));
        assert_eq!(ids(&fx.store), ["A"]);
    }

    #[tokio::test]
    async fn any_type_is_accepted() {
        let fx = fixture(&["G"]);
        let outcome = fx
            .handler
            .handle(
                &fx.conn,
                r#"{"action":"result","type":"guidemap","status":"success","request_id":"G"}"#,
            )
            .await;
        assert_eq!(outcome, AckOutcome::Removed("G".into()));
        assert!(fx.store.is_empty());
    }

    #[tokio::test]
    async fn repeated_ack_is_unknown_and_leaves_file_alone() {
        let fx = fixture(&["A", "B"]);
        let msg = r#"{"action":"result","status":"success","request_id":"A"}"#;
        fx.handler.handle(&fx.conn, msg).await;
        let before = std::fs::read(fx.store.path()).unwrap();

        let outcome = fx.handler.handle(&fx.conn, msg).await;
        assert_eq!(outcome, AckOutcome::Unknown("A".into()));
        assert_eq!(std::fs::read(fx.store.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn failed_status_defers_for_this_connection() {
        let fx = fixture(&["A"]);
        let head = ItemId::from_raw("A");
        fx.conn.decide(&DeliveryPolicy::default(), &head);

        let outcome = fx
            .handler
            .handle(&fx.conn, r#"{"action":"result","status":"failed","request_id":"A"}"#)
            .await;
        assert_eq!(outcome, AckOutcome::Deferred("A".into()));
        assert_eq!(ids(&fx.store), ["A"]);
        assert_eq!(
            fx.conn.decide(&DeliveryPolicy::default(), &head),
            Decision::Suppress
        );
    }

    #[tokio::test]
    async fn malformed_messages_change_nothing() {
        let fx = fixture(&["A"]);
        let before = std::fs::read(fx.store.path()).unwrap();
        for text in ["not json", "[1,2,3]", r#"{"request_id": 5}"#, ""] {
            assert_eq!(fx.handler.handle(&fx.conn, text).await, AckOutcome::Malformed, "{text:?}");
        }
        assert_eq!(std::fs::read(fx.store.path()).unwrap(), before);
        assert!(!fx.conn.is_closed());
        assert_eq!(fx.metrics.counter_get(RELAY_ACKS, &[("outcome", "malformed")]), 4);
    }

    #[tokio::test]
    async fn non_result_messages_are_ignored() {
        let fx = fixture(&["A"]);
        for text in [
            r#"{"action":"hello"}"#,
            r#"{"action":"result","status":"success"}"#,
            r#"{"action":"result","request_id":"A"}"#,
            "{}",
        ] {
            assert_eq!(fx.handler.handle(&fx.conn, text).await, AckOutcome::Ignored, "{text}");
        }
        assert_eq!(ids(&fx.store), ["A"]);
    }

    #[tokio::test]
    async fn missing_store_file_is_not_created() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(QueueStore::new(dir.path().join("absent.json")));
        let handler = AckHandler::new(
            store.clone(),
            DeliveryPolicy::default(),
            Arc::new(MetricsRecorder::new()),
        );
        let (tx, _rx) = mpsc::channel(1);
        let conn = ClientConnection::new(ConnectionId::new(), tx, &CancellationToken::new());

        let outcome = handler
            .handle(&conn, r#"{"action":"result","status":"success","request_id":"A"}"#)
            .await;
        assert_eq!(outcome, AckOutcome::Unknown("A".into()));
        assert!(!store.path().exists());
    }
}

//! `RelayServer`: Axum HTTP + WebSocket listener.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use herald_core::ConnectionId;
use herald_store::QueueStore;
use herald_telemetry::MetricsRecorder;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, trace, warn};

use crate::ack::AckHandler;
use crate::broadcast::BroadcastLoop;
use crate::config::ServerConfig;
use crate::connection::ClientConnection;
use crate::error::ServerError;
use crate::health::{self, HealthResponse};
use crate::heartbeat::{run_heartbeat, HeartbeatResult, MIN_HEARTBEAT_INTERVAL};
use crate::registry::ConnectionRegistry;
use crate::shutdown::ShutdownCoordinator;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub store: Arc<QueueStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub acks: Arc<AckHandler>,
    pub metrics: Arc<MetricsRecorder>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub start_time: Instant,
}

/// The relay: listener, broadcast loop and shared state.
pub struct RelayServer {
    state: AppState,
    broadcast: Arc<BroadcastLoop>,
}

impl RelayServer {
    pub fn new(config: ServerConfig, store: Arc<QueueStore>, metrics: Arc<MetricsRecorder>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(metrics.clone()));
        let acks = Arc::new(AckHandler::new(
            store.clone(),
            config.delivery.clone(),
            metrics.clone(),
        ));
        let broadcast = Arc::new(BroadcastLoop::new(
            store.clone(),
            registry.clone(),
            config.delivery.clone(),
            metrics.clone(),
        ));
        Self {
            state: AppState {
                config: Arc::new(config),
                store,
                registry,
                acks,
                metrics,
                shutdown: Arc::new(ShutdownCoordinator::new()),
                start_time: Instant::now(),
            },
            broadcast,
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(ws_handler))
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.state.registry
    }

    /// Bind the listener and start serving. A bind failure is the only error.
    pub async fn start(self) -> Result<RelayHandle, ServerError> {
        let addr = self.state.config.bind_address();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, queue = %self.state.store.path().display(), "relay listening");
        announce(local_addr);

        let token = self.state.shutdown.token();
        let broadcast = self.broadcast.clone().spawn(token.clone());

        let router = self.router();
        let serve_token = token.clone();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(serve_token.cancelled_owned())
                .await;
            if let Err(e) = result {
                warn!(error = %e, "listener stopped with error");
            }
        });

        Ok(RelayHandle {
            local_addr,
            registry: self.state.registry.clone(),
            shutdown: self.state.shutdown.clone(),
            shutdown_timeout: self.state.config.shutdown_timeout,
            tasks: vec![server, broadcast],
        })
    }
}

/// Handle returned by [`RelayServer::start`]; owns the background tasks.
pub struct RelayHandle {
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
    shutdown_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Stop accepting, close every connection and wait for tasks to finish.
    pub async fn shutdown(self) {
        info!("relay shutting down");
        self.shutdown
            .graceful_shutdown(self.tasks, self.shutdown_timeout)
            .await;
        info!("relay stopped");
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let tracker = state.shutdown.tracker();
    ws.on_upgrade(move |socket| tracker.track_future(handle_socket(socket, state)))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let store = state.store.clone();
    let queue_depth = tokio::task::spawn_blocking(move || store.len())
        .await
        .unwrap_or_default();
    Json(health::health_check(
        state.start_time,
        state.registry.count(),
        queue_depth,
        state.metrics.snapshot(),
    ))
}

/// Run one client connection from registration to unregistration.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (tx, rx) = mpsc::channel(state.config.max_send_queue.max(1));
    let conn = Arc::new(ClientConnection::new(
        ConnectionId::new(),
        tx,
        &state.shutdown.token(),
    ));
    state.registry.register(conn.clone());
    info!(conn_id = %conn.id, connections = state.registry.count(), "client connected");

    let (ws_tx, ws_rx) = socket.split();
    let writer = tokio::spawn(write_loop(
        ws_tx,
        rx,
        conn.clone(),
        state.config.heartbeat_interval,
    ));

    let watched = conn.clone();
    let interval = state.config.heartbeat_interval;
    let timeout = state.config.heartbeat_timeout;
    let heartbeat = tokio::spawn(async move {
        let token = watched.close_token();
        if run_heartbeat(watched.clone(), interval, timeout, token).await == HeartbeatResult::TimedOut {
            warn!(conn_id = %watched.id, idle_secs = watched.last_seen_elapsed().as_secs(), "client heartbeat timed out");
            watched.close();
        }
    });

    read_loop(ws_rx, &conn, &state.acks).await;

    state.registry.unregister(&conn.id);
    conn.close();
    for (task, result) in [("writer", writer.await), ("heartbeat", heartbeat.await)] {
        if let Err(e) = result {
            warn!(conn_id = %conn.id, task, error = %e, "connection task failed");
        }
    }
    info!(
        conn_id = %conn.id,
        connected_secs = conn.age().as_secs(),
        connections = state.registry.count(),
        "client disconnected"
    );
}

/// Hand every inbound text frame to the acknowledgment handler, in order.
async fn read_loop(mut ws_rx: SplitStream<WebSocket>, conn: &ClientConnection, acks: &AckHandler) {
    loop {
        tokio::select! {
            () = conn.closed() => break,
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    conn.mark_alive();
                    let outcome = acks.handle(conn, text.as_str()).await;
                    trace!(conn_id = %conn.id, outcome = outcome.label(), "client message handled");
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => conn.mark_alive(),
                Some(Err(e)) => {
                    debug!(conn_id = %conn.id, error = %e, "websocket receive error");
                    break;
                }
            }
        }
    }
}

/// Forward queued frames to the socket and ping on `ping_every`.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Arc<str>>,
    conn: Arc<ClientConnection>,
    ping_every: Duration,
) {
    let mut ping_interval = tokio::time::interval(ping_every.max(MIN_HEARTBEAT_INTERVAL));
    // first tick completes immediately
    ping_interval.tick().await;

    loop {
        tokio::select! {
            biased;
            () = conn.closed() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if ws_tx.send(Message::Text(frame.to_string().into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = ping_interval.tick() => {
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                trace!(conn_id = %conn.id, "sent ping");
            }
        }
    }

    conn.close();
}

/// Log the LAN address clients should use.
fn announce(local_addr: SocketAddr) {
    match lan_ip() {
        Some(ip) => info!("clients can connect at ws://{}:{}", ip, local_addr.port()),
        None => info!("clients can connect at ws://{}", local_addr),
    }
}

/// Primary outbound interface address, found by routing a UDP socket
/// towards a public address. No packet is sent.
pub fn lan_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

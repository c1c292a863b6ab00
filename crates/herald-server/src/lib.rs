//! # herald-server
//!
//! WebSocket relay for the queue document.
//!
//! - [`BroadcastLoop`] pushes the queue head to every connection each cycle
//! - [`AckHandler`] removes items when a client reports them done
//! - [`ConnectionRegistry`] tracks live connections
//! - [`RelayServer`] binds the listener and wires the pieces together
//! - Graceful shutdown via `tokio::signal` + `CancellationToken`

#![deny(unsafe_code)]

pub mod ack;
pub mod broadcast;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod error;
pub mod health;
pub mod heartbeat;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod shutdown;

pub use ack::{AckHandler, AckOutcome};
pub use broadcast::{BroadcastLoop, CycleReport};
pub use config::ServerConfig;
pub use connection::ClientConnection;
pub use delivery::DeliveryPolicy;
pub use error::ServerError;
pub use registry::ConnectionRegistry;
pub use server::{RelayHandle, RelayServer};
pub use shutdown::ShutdownCoordinator;

//! # herald
//!
//! Relay binary: serves the queue over WebSocket and offers producer and
//! maintenance commands against the same queue document.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use herald_core::producer;
use herald_server::shutdown::wait_for_signal;
use herald_server::{DeliveryPolicy, RelayServer, ServerConfig};
use herald_settings::HeraldSettings;
use herald_store::QueueStore;
use herald_telemetry::{init_telemetry, parse_level, MetricsRecorder, TelemetryConfig};
use tracing::{info, warn};

/// File-backed notification relay over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "herald", version, about)]
struct Cli {
    /// Settings file (default `~/.herald/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Queue document (overrides settings and `HERALD_QUEUE_PATH`).
    #[arg(long, global = true)]
    queue: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay until SIGINT/SIGTERM.
    Serve(ServeArgs),
    /// Append an item to the queue.
    #[command(subcommand)]
    Push(PushCommand),
    /// Print the queue as JSON.
    List,
    /// Remove an item by request id, as a client acknowledgment would.
    Remove { request_id: String },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind.
    #[arg(long)]
    port: Option<u16>,

    /// Milliseconds between broadcast cycles.
    #[arg(long)]
    interval_ms: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum PushCommand {
    Reminder {
        #[arg(long)]
        title: String,
        /// The user's original phrasing.
        #[arg(long, default_value = "")]
        text: String,
        /// ISO-8601 time, with or without offset.
        #[arg(long)]
        time: String,
    },
    Guidemap {
        #[arg(long)]
        destination: String,
        #[arg(long, default_value = "driving")]
        mode: String,
        #[arg(long)]
        time: String,
    },
    Timer {
        #[arg(long)]
        seconds: u64,
        #[arg(long, default_value = "")]
        title: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = resolve_settings(&cli)?;

    let (telemetry, rejected_levels) = telemetry_config(&settings);
    let telemetry = init_telemetry(telemetry);
    for entry in rejected_levels {
        warn!(entry = %entry, "ignoring unknown log level");
    }

    let store = Arc::new(QueueStore::new(settings.queue.path.clone()));

    match cli.command {
        Command::Serve(_) => serve(&settings, store, telemetry.metrics()).await,
        Command::Push(push) => push_item(&store, push),
        Command::List => list(&store),
        Command::Remove { request_id } => remove(&store, &request_id),
    }
}

async fn serve(
    settings: &HeraldSettings,
    store: Arc<QueueStore>,
    metrics: Arc<MetricsRecorder>,
) -> Result<()> {
    let handle = RelayServer::new(server_config(settings), store, metrics)
        .start()
        .await
        .context("failed to start relay")?;
    info!(addr = %handle.local_addr(), "herald ready");

    wait_for_signal().await;
    handle.shutdown().await;
    Ok(())
}

fn push_item(store: &QueueStore, command: PushCommand) -> Result<()> {
    let item = match command {
        PushCommand::Reminder { title, text, time } => producer::reminder(&title, &text, &time)?,
        PushCommand::Guidemap {
            destination,
            mode,
            time,
        } => producer::guidemap(&destination, &mode, &time)?,
        PushCommand::Timer { seconds, title } => producer::timer(seconds, &title),
    };
    let request_id = item.request_id.clone();
    store
        .append(item)
        .with_context(|| format!("failed to append to {}", store.path().display()))?;
    println!("{request_id}");
    Ok(())
}

fn list(store: &QueueStore) -> Result<()> {
    let items = store
        .try_load()
        .with_context(|| format!("failed to read {}", store.path().display()))?;
    println!("{}", serde_json::to_string_pretty(&items)?);
    Ok(())
}

fn remove(store: &QueueStore, request_id: &str) -> Result<()> {
    let removed = store
        .remove_by_id(request_id)
        .with_context(|| format!("failed to update {}", store.path().display()))?;
    if !removed {
        bail!("no queued item with request_id {request_id}");
    }
    println!("removed {request_id}");
    Ok(())
}

/// Settings file and environment, then command-line flags, validated once.
fn resolve_settings(cli: &Cli) -> Result<HeraldSettings> {
    let settings_path = cli
        .settings
        .clone()
        .unwrap_or_else(herald_settings::settings_path);
    let mut settings = herald_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("failed to load settings from {}", settings_path.display()))?;
    apply_cli_overrides(&mut settings, cli);
    settings.validate().context("invalid settings")?;
    Ok(settings)
}

/// Command-line flags win over every settings layer.
fn apply_cli_overrides(settings: &mut HeraldSettings, cli: &Cli) {
    if let Some(queue) = &cli.queue {
        settings.queue.path = queue.clone();
    }
    if let Command::Serve(args) = &cli.command {
        if let Some(host) = &args.host {
            settings.server.host = host.clone();
        }
        if let Some(port) = args.port {
            settings.server.port = port;
        }
        if let Some(interval_ms) = args.interval_ms {
            settings.delivery.broadcast_interval_ms = interval_ms;
        }
    }
}

fn server_config(settings: &HeraldSettings) -> ServerConfig {
    ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        heartbeat_interval: settings.server.heartbeat_interval(),
        heartbeat_timeout: settings.server.heartbeat_timeout(),
        max_send_queue: settings.server.max_send_queue,
        shutdown_timeout: settings.server.shutdown_timeout(),
        delivery: DeliveryPolicy {
            interval: settings.delivery.broadcast_interval(),
            resend_every_cycles: settings.delivery.resend_every_cycles,
            nack_backoff_cycles: settings.delivery.nack_backoff_cycles,
            send_timeout: settings.delivery.send_timeout(),
        },
    }
}

/// Telemetry config plus any `module=level` entries that did not parse.
fn telemetry_config(settings: &HeraldSettings) -> (TelemetryConfig, Vec<String>) {
    let mut rejected = Vec::new();
    let log_level = parse_level(&settings.logging.level).unwrap_or_else(|| {
        rejected.push(settings.logging.level.clone());
        tracing::Level::INFO
    });
    let module_levels = settings
        .logging
        .module_levels
        .iter()
        .filter_map(|(module, level)| match parse_level(level) {
            Some(level) => Some((module.clone(), level)),
            None => {
                rejected.push(format!("{module}={level}"));
                None
            }
        })
        .collect();
    (
        TelemetryConfig {
            log_level,
            module_levels,
            json: settings.logging.json,
        },
        rejected,
    )
}

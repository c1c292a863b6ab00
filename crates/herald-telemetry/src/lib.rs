mod metrics;

pub use metrics::{HistogramSummary, MetricType, MetricValue, MetricsRecorder, MetricsSnapshot};

use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "herald_server" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit one JSON object per line instead of human-readable text.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// `EnvFilter` directive string built from the configured levels.
    pub fn filter_directives(&self) -> String {
        let mut filter_str = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter_str
    }
}

/// Handle returned by [`init_telemetry`]. Owns the process-wide metrics recorder.
pub struct TelemetryGuard {
    metrics_recorder: Arc<MetricsRecorder>,
}

impl TelemetryGuard {
    /// Shared metrics recorder.
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        self.metrics_recorder.clone()
    }
}

/// Initialize logging (to stderr) and metrics. Call once at startup.
///
/// A second call (or a subscriber already installed by a test harness) keeps
/// the existing subscriber and still returns a fresh recorder.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed()
    };

    if let Err(e) = tracing_subscriber::registry().with(fmt_layer).try_init() {
        eprintln!("herald-telemetry: subscriber already installed: {e}");
    }

    TelemetryGuard {
        metrics_recorder: Arc::new(MetricsRecorder::new()),
    }
}

/// Parse a level name as accepted in settings (`warn`, `INFO`, ...).
pub fn parse_level(raw: &str) -> Option<Level> {
    raw.trim().parse().ok()
}

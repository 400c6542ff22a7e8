//! Telemetry: logging, tracing and metrics.
//!
//! - **Logging**: structured JSON/pretty output with sensitive data redaction
//! - **Tracing**: optional OTLP export through `tracing-opentelemetry`
//! - **Metrics**: Prometheus counters/histograms for jobs and settlements

pub mod logging;
pub mod metrics;
pub mod tracing;

pub use logging::{LogFormat, LoggingConfig, RedactionConfig, SensitiveFieldRedactor};
pub use metrics::{init_metrics, MetricsConfig, SettlementMetrics};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Initialize the complete telemetry stack. Call once at startup, inside
/// the tokio runtime.
pub fn init(config: &Config) -> anyhow::Result<TelemetryHandle> {
    init_metrics(&config.metrics, &config.tracing.service_name)?;

    let tracer = tracing::init_tracer(&config.tracing)?;
    let exporting = tracer.is_some();
    let otel_layer = tracer.map(|t| tracing_opentelemetry::layer().with_tracer(t));

    tracing_subscriber::registry()
        .with(logging::fmt_layer::<tracing_subscriber::Registry>(&config.logging))
        .with(logging::build_filter(&config.logging)?)
        .with(otel_layer)
        .try_init()?;

    Ok(TelemetryHandle { exporting })
}

/// Handle for managing telemetry lifecycle.
pub struct TelemetryHandle {
    exporting: bool,
}

impl TelemetryHandle {
    /// Flush pending spans.
    pub fn shutdown(self) {
        if self.exporting {
            tracing::shutdown_tracing();
        }
        ::tracing::info!("Telemetry shutdown complete");
    }
}

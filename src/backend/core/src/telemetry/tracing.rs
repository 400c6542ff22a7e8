//! OpenTelemetry trace export over OTLP.

use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::Tracer;

use crate::config::TracingConfig;

/// Build an OTLP batch tracer when an endpoint is configured.
pub fn init_tracer(config: &TracingConfig) -> anyhow::Result<Option<Tracer>> {
    let Some(endpoint) = config.otlp_endpoint.as_deref() else {
        return Ok(None);
    };

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(opentelemetry_sdk::trace::config().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                opentelemetry::KeyValue::new("service.name", config.service_name.clone()),
                opentelemetry::KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    Ok(Some(tracer))
}

/// Flush and stop the global tracer provider.
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
}

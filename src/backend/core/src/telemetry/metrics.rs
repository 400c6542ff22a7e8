//! Prometheus metrics for job runs, queue saturation and settlements.
//!
//! Recording goes through the `metrics` facade, so the helpers below are
//! no-ops until [`init_metrics`] installs the Prometheus recorder.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Prometheus scrape endpoint (e.g., "0.0.0.0:9090")
    #[serde(default = "default_metrics_endpoint")]
    pub endpoint: String,

    /// Histogram buckets for job durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_metrics_endpoint(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_endpoint() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.05, 0.25, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]
}

/// Install the Prometheus recorder and its scrape listener.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config.endpoint.parse()?;
    let mut builder = PrometheusBuilder::new()
        .with_http_listener(addr)
        .add_global_label("service", service_name);

    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    builder = builder.set_buckets(&config.duration_buckets)?;
    builder.install()?;

    register_metric_descriptions();

    tracing::info!(
        service_name = %service_name,
        endpoint = %config.endpoint,
        "Metrics initialized"
    );
    Ok(())
}

fn register_metric_descriptions() {
    describe_counter!("settlement_job_runs_total", "Job runs by outcome");
    describe_histogram!(
        "settlement_job_duration_seconds",
        "Job handler wall time in seconds"
    );
    describe_gauge!(
        "settlement_task_queue_active",
        "Tasks currently executing in a task queue"
    );
    describe_gauge!(
        "settlement_task_queue_pending",
        "Tasks waiting in a task queue"
    );
    describe_counter!(
        "settlement_positions_settled_total",
        "Positions moved to a terminal state"
    );
    describe_counter!("settlement_rewards_total", "Referral rewards written");
    describe_counter!("settlement_errors_total", "Errors by code");
}

/// Business metric helpers used across the engine.
pub struct SettlementMetrics;

impl SettlementMetrics {
    pub fn record_job_run(job: &str, success: bool, duration_seconds: f64) {
        let outcome = if success { "completed" } else { "failed" };
        counter!(
            "settlement_job_runs_total",
            "job" => job.to_string(),
            "outcome" => outcome,
        )
        .increment(1);
        histogram!("settlement_job_duration_seconds", "job" => job.to_string())
            .record(duration_seconds);
    }

    pub fn set_queue_depth(queue: &str, active: usize, pending: usize) {
        gauge!("settlement_task_queue_active", "queue" => queue.to_string()).set(active as f64);
        gauge!("settlement_task_queue_pending", "queue" => queue.to_string()).set(pending as f64);
    }

    pub fn record_settlement(kind: &str, outcome: &str) {
        counter!(
            "settlement_positions_settled_total",
            "kind" => kind.to_string(),
            "outcome" => outcome.to_string(),
        )
        .increment(1);
    }

    pub fn record_reward(mode: &str, count: u64) {
        counter!("settlement_rewards_total", "mode" => mode.to_string()).increment(count);
    }
}

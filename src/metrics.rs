//! Prometheus metrics
//!
//! ## Counters
//! - `usage_reports_accepted_total` / `usage_reports_rejected_total` - ingress items
//! - `usage_batches_processed_total` - batches written by the consumer
//! - `usage_store_retries_total` - transient store failures retried
//! - `usage_dead_letters_total` - batches given up on
//! - `schema_checks_total` - schema checks by outcome
//! - `usage_lookup_timeouts_total` - usage reads that fell back to "all used"
//! - `http_requests_total` - HTTP requests by method, path, status
//!
//! ## Histograms
//! - `http_request_duration_seconds`

use std::time::Instant;

use axum::{extract::Request, middleware::Next, response::Response};
use ::metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::{Deserialize, Serialize};

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether the Prometheus exporter is installed
    #[serde(default)]
    pub enabled: bool,
    /// Listen address of the exporter's scrape endpoint
    #[serde(default = "default_metrics_addr")]
    pub listen_addr: String,
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_metrics_addr(),
        }
    }
}

/// Install the Prometheus exporter; call once at startup
pub fn init_metrics(config: &MetricsConfig) -> Result<(), String> {
    if !config.enabled {
        tracing::info!("Metrics disabled");
        return Ok(());
    }

    let addr: std::net::SocketAddr = config
        .listen_addr
        .parse()
        .map_err(|e| format!("Invalid metrics address {}: {}", config.listen_addr, e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("Failed to install metrics recorder: {}", e))?;

    tracing::info!(%addr, "Metrics initialized");
    Ok(())
}

pub fn record_reports(accepted: usize, rejected: usize) {
    counter!("usage_reports_accepted_total").increment(accepted as u64);
    counter!("usage_reports_rejected_total").increment(rejected as u64);
}

pub fn record_batch_processed(events: usize) {
    counter!("usage_batches_processed_total").increment(1);
    counter!("usage_events_written_total").increment(events as u64);
}

pub fn record_store_retry() {
    counter!("usage_store_retries_total").increment(1);
}

pub fn record_dead_letter() {
    counter!("usage_dead_letters_total").increment(1);
}

pub fn record_schema_check(valid: bool) {
    let outcome = if valid { "valid" } else { "invalid" };
    counter!("schema_checks_total", "outcome" => outcome).increment(1);
}

pub fn record_usage_lookup_timeout() {
    counter!("usage_lookup_timeouts_total").increment(1);
}

/// Record one HTTP request
pub fn record_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", path.to_string()),
        ("status", status.to_string()),
    ];

    counter!("http_requests_total", &labels).increment(1);
    histogram!("http_request_duration_seconds", &labels).record(duration_secs);
}

/// Middleware recording request counts and latencies
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    record_request(
        &method,
        &path,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

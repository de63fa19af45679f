//! Metrics collection and exposition.
//!
//! # Metrics
//! - `discovery_reconcile_total` (counter): published passes, by provider
//! - `discovery_reconcile_errors_total` (counter): failed runs, by provider
//! - `discovery_merge_conflicts_total` (counter): dropped names, by provider and kind
//! - `discovery_entities` (gauge): entities that contributed to the last pass
//! - `discovery_backoff_seconds` (gauge): last retry delay, by provider
//!
//! # Design Decisions
//! - Recording is a no-op until `init_metrics` installs the exporter
//! - Label values are provider names and fixed kinds, never entity names

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter with its own HTTP listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_reconcile(provider: &str) {
    metrics::counter!("discovery_reconcile_total", "provider" => provider.to_string()).increment(1);
}

pub fn record_reconcile_error(provider: &str) {
    metrics::counter!("discovery_reconcile_errors_total", "provider" => provider.to_string()).increment(1);
}

pub fn record_merge_conflict(provider: &str, kind: &'static str) {
    metrics::counter!(
        "discovery_merge_conflicts_total",
        "provider" => provider.to_string(),
        "kind" => kind
    )
    .increment(1);
}

pub fn record_entities(provider: &str, count: usize) {
    metrics::gauge!("discovery_entities", "provider" => provider.to_string()).set(count as f64);
}

pub fn record_backoff(provider: &str, delay: Duration) {
    metrics::gauge!("discovery_backoff_seconds", "provider" => provider.to_string()).set(delay.as_secs_f64());
}

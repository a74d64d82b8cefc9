//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define proxy metrics (exchanges, errors, upgrades, connections)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `proxy_exchanges_total` (counter): finished exchanges by kind, outcome
//! - `proxy_errors_total` (counter): terminal errors by kind, status
//! - `proxy_upgrades_total` (counter): upgrade tunnels established
//! - `proxy_active_connections` (gauge): current client connection count

use std::net::SocketAddr;

use http::StatusCode;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::http::request::ExchangeKind;

/// Install the Prometheus recorder and its scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_exchange(kind: ExchangeKind, outcome: &'static str) {
    counter!("proxy_exchanges_total", "kind" => kind.as_str(), "outcome" => outcome).increment(1);
}

pub fn record_error(kind: ExchangeKind, status: StatusCode) {
    counter!(
        "proxy_errors_total",
        "kind" => kind.as_str(),
        "status" => status.as_u16().to_string()
    )
    .increment(1);
}

pub fn record_upgrade() {
    counter!("proxy_upgrades_total").increment(1);
}

pub fn connection_opened() {
    gauge!("proxy_active_connections").increment(1.0);
}

pub fn connection_closed() {
    gauge!("proxy_active_connections").decrement(1.0);
}

//! # Metrics Module
//!
//! Exposes the adapter counters to external observability systems via a
//! Prometheus exporter. The counters themselves are recorded through the
//! `metrics` facade by the stats reporter.

use anyhow::Result;
use std::net::SocketAddr;

#[cfg(not(test))]
pub fn install_prometheus_recorder(prometheus_addr: SocketAddr) -> Result<()> {
    use metrics::describe_counter;
    use metrics_exporter_prometheus::PrometheusBuilder;

    PrometheusBuilder::new()
        .with_http_listener(prometheus_addr)
        .install()
        .map_err(anyhow::Error::from)?;

    describe_counter!(
        "trident_adapter_rx_packets_total",
        "Datagrams received with a valid trident header"
    );
    describe_counter!(
        "trident_adapter_rx_dropped_total",
        "Packets declared lost by reorder windows"
    );
    describe_counter!(
        "trident_adapter_rx_expired_total",
        "Stale out-of-order packets discarded"
    );
    describe_counter!(
        "trident_adapter_rx_errors_total",
        "Datagrams with a malformed trident header"
    );
    describe_counter!(
        "trident_adapter_tx_packets_total",
        "Packets handed to downstream queues"
    );
    Ok(())
}

#[cfg(test)]
pub fn install_prometheus_recorder(_prometheus_addr: SocketAddr) -> Result<()> {
    // Do nothing in tests to avoid starting a server and hanging.
    Ok(())
}

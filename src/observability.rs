use std::net::SocketAddr;

// ── RED metrics (command-driven) ────────────────────────────────

/// Counter: committed events. Labels: type.
pub const EVENTS_TOTAL: &str = "tapline_events_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: live stream subscriptions.
pub const STREAMS_ACTIVE: &str = "tapline_streams_active";

/// Counter: holds expired by the sweeper.
pub const HOLDS_EXPIRED_TOTAL: &str = "tapline_holds_expired_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "tapline_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "tapline_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Install a plain fmt tracing subscriber; integrators embedding the
/// engine in a larger process bring their own.
pub fn init_tracing() {
    tracing_subscriber::fmt::init();
}

use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total SQL commands executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "spot_queries_total";

/// Histogram: SQL command latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "spot_query_duration_seconds";

/// Counter: booking admissions. Labels: outcome (admitted or an error kind).
pub const ADMISSIONS_TOTAL: &str = "spot_admissions_total";

/// Histogram: admission latency in seconds, lock wait and commit included.
pub const ADMISSION_DURATION_SECONDS: &str = "spot_admission_duration_seconds";

/// Counter: availability queries.
pub const SLOT_QUERIES_TOTAL: &str = "spot_slot_queries_total";

/// Histogram: availability query latency in seconds.
pub const SLOT_QUERY_DURATION_SECONDS: &str = "spot_slot_query_duration_seconds";

/// Counter: confirmation e-mails. Labels: status (sent, failed, dropped).
pub const NOTIFICATIONS_TOTAL: &str = "spot_notifications_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "spot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "spot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "spot_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "spot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "spot_wal_flush_batch_size";

/// fmt subscriber filtered by `RUST_LOG`, `info` when unset.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init_metrics(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "staybook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "staybook_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "staybook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "staybook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "staybook_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "staybook_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "staybook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "staybook_wal_flush_batch_size";

// ── Booking domain ──────────────────────────────────────────────

pub const RESERVATIONS_CREATED_TOTAL: &str = "staybook_reservations_created_total";

/// Counter: creations or date changes rejected by an overlap or buffer clash.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "staybook_reservation_conflicts_total";

/// Counter: unpaid holds cancelled by the expiry job.
pub const RESERVATIONS_EXPIRED_TOTAL: &str = "staybook_reservations_expired_total";

/// Counter: background jobs that returned an error. Labels: job.
pub const JOBS_FAILED_TOTAL: &str = "staybook_jobs_failed_total";

// ── Search cache ────────────────────────────────────────────────

/// Counters. Labels: kind (availability, search).
pub const CACHE_HITS_TOTAL: &str = "staybook_cache_hits_total";
pub const CACHE_MISSES_TOTAL: &str = "staybook_cache_misses_total";
pub const CACHE_ERRORS_TOTAL: &str = "staybook_cache_errors_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertListing(_) => "insert_listing",
        Command::UpdateListing { .. } => "update_listing",
        Command::DeleteListing { .. } => "delete_listing",
        Command::SelectListing { .. } => "select_listing",
        Command::SearchListings(_) => "search_listings",
        Command::InsertOverride { .. } => "insert_override",
        Command::UpdateOverride { .. } => "update_override",
        Command::DeleteOverride { .. } => "delete_override",
        Command::SelectOverrides { .. } => "select_overrides",
        Command::SelectBookHash(_) => "select_book_hash",
        Command::InsertPreReservation(_) => "insert_pre_reservation",
        Command::SelectPreReservation { .. } => "select_pre_reservation",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::UpdateReservation { .. } => "update_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectReservations(_) => "select_reservations",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectHostSummary { .. } => "select_host_summary",
    }
}

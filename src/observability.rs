use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "venuebook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "venuebook_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "venuebook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "venuebook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "venuebook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "venuebook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "venuebook_wal_flush_batch_size";

/// Counter: journal compactions. Labels: status.
pub const COMPACTIONS_TOTAL: &str = "venuebook_compactions_total";

// ── Domain ──────────────────────────────────────────────────────

/// Counter: booking requests accepted as pending.
pub const BOOKINGS_SUBMITTED_TOTAL: &str = "venuebook_bookings_submitted_total";

/// Counter: admin decisions. Labels: decision, outcome.
pub const DECISIONS_TOTAL: &str = "venuebook_decisions_total";

/// Counter: approvals refused because the slot was already taken.
pub const SLOT_CONFLICTS_TOTAL: &str = "venuebook_slot_conflicts_total";

/// Counter: venue catalog edits. Labels: change.
pub const CATALOG_CHANGES_TOTAL: &str = "venuebook_catalog_changes_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertVenue { .. } => "insert_venue",
        Command::DeleteVenue { .. } => "delete_venue",
        Command::InsertUser { .. } => "insert_user",
        Command::InsertBooking { .. } => "insert_booking",
        Command::Decide { .. } => "decide",
        Command::Rescind { .. } => "rescind",
        Command::SelectVenues => "select_venues",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectPending => "select_pending",
        Command::SelectSchedule { .. } => "select_schedule",
        Command::SelectAvailability { .. } => "select_availability",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
    }
}

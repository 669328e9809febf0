use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "agenda_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "agenda_query_duration_seconds";

/// Counter: transaction bodies re-run after a stale read. Labels: op.
pub const TX_RETRIES_TOTAL: &str = "agenda_tx_retries_total";

/// Counter: transactions abandoned after exhausting their retries. Labels: op.
pub const TX_CONFLICTS_TOTAL: &str = "agenda_tx_conflicts_total";

/// Counter: booking requests rejected for overlapping an existing booking.
pub const BOOKING_CONFLICTS_TOTAL: &str = "agenda_booking_conflicts_total";

// ── Reminders ───────────────────────────────────────────────────

/// Counter: reminder runs. Labels: status.
pub const REMINDER_RUNS_TOTAL: &str = "agenda_reminder_runs_total";

/// Counter: push sends attempted. Labels: status.
pub const REMINDER_SENDS_TOTAL: &str = "agenda_reminder_sends_total";

/// Counter: bookings whose client had no reachable device.
pub const REMINDER_SKIPPED_TOTAL: &str = "agenda_reminder_skipped_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "agenda_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "agenda_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "agenda_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "agenda_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (commits per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "agenda_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "agenda_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a command in metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SelectAvailability { .. } => "select_availability",
        Command::InsertBooking { .. } => "insert_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::TransitionBooking { .. } => "transition_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::InsertUser { .. } => "insert_user",
        Command::SelectUser => "select_user",
        Command::DeleteUser { .. } => "delete_user",
        Command::InsertPushToken { .. } => "insert_push_token",
        Command::UpsertBusiness { .. } => "upsert_business",
        Command::SelectBusiness { .. } => "select_business",
    }
}

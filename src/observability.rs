use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "dayhold_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "dayhold_request_duration_seconds";

// ── Ledger metrics ──────────────────────────────────────────────

/// Counter: holds placed.
pub const HOLDS_PLACED_TOTAL: &str = "dayhold_holds_placed_total";

/// Counter: hold requests refused. Labels: reason.
pub const HOLDS_REJECTED_TOTAL: &str = "dayhold_holds_rejected_total";

/// Counter: holds that left ACTIVE. Labels: outcome (released, confirmed, expired).
pub const HOLDS_FINISHED_TOTAL: &str = "dayhold_holds_finished_total";

/// Counter: retried requests answered from an existing hold.
pub const IDEMPOTENT_REPLAYS_TOTAL: &str = "dayhold_idempotent_replays_total";

/// Gauge: ACTIVE holds.
pub const HOLDS_ACTIVE: &str = "dayhold_holds_active";

/// Histogram: seconds a sweep took.
pub const SWEEP_DURATION_SECONDS: &str = "dayhold_sweep_duration_seconds";

/// Counter: holds the sweeper failed to expire.
pub const SWEEP_FAILURES_TOTAL: &str = "dayhold_sweep_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: open client connections.
pub const CONNECTIONS_ACTIVE: &str = "dayhold_connections_active";

/// Counter: connections accepted.
pub const CONNECTIONS_TOTAL: &str = "dayhold_connections_total";

/// Counter: connections refused at the limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "dayhold_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "dayhold_wal_flush_duration_seconds";

/// Histogram: events per WAL group commit.
pub const WAL_FLUSH_BATCH_SIZE: &str = "dayhold_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "dayhold_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a request, for metrics and spans.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::UpsertResource { .. } => "upsert_resource",
        Request::GetResource { .. } => "get_resource",
        Request::ListResources { .. } => "list_resources",
        Request::SetCapacity { .. } => "set_capacity",
        Request::DayLedger { .. } => "day_ledger",
        Request::Availability { .. } => "availability",
        Request::AvailableDates { .. } => "available_dates",
        Request::CreateHold { .. } => "create_hold",
        Request::CreateHoldGroup { .. } => "create_hold_group",
        Request::GetHold { .. } => "get_hold",
        Request::ActiveHolds { .. } => "active_holds",
        Request::ExtendHold { .. } => "extend_hold",
        Request::ReleaseHold { .. } => "release_hold",
        Request::ConfirmHold { .. } => "confirm_hold",
        Request::CreateBlackout { .. } => "create_blackout",
        Request::DeleteBlackout { .. } => "delete_blackout",
        Request::ListBlackouts { .. } => "list_blackouts",
        Request::Allocations { .. } => "allocations",
        Request::AllocationsOn { .. } => "allocations_on",
        Request::SweepExpiredHolds => "sweep_expired_holds",
        Request::Stats => "stats",
        Request::Subscribe { .. } => "subscribe",
    }
}

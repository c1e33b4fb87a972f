//! Prometheus Metrics Module
//!
//! Exposes gateway metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Connections**: Accepted upgrades, live clients, closes by reason
//! - **Events**: Inbound events by type, handler errors, unknown types
//! - **Fan-out**: Broadcasts, targeted deliveries, evictions, fan-out latency
//! - **Store**: Subscription store operations by outcome
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the gateway HTTP port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Calling it again returns the handle installed by the first call.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Connections
    describe_counter!(
        "fanout_gateway_connections_total",
        "Total WebSocket connections accepted"
    );
    describe_gauge!(
        "fanout_gateway_active_clients",
        "Number of clients in the hub's live set"
    );
    describe_counter!(
        "fanout_gateway_connection_closes_total",
        "Total connections closed, by reason"
    );

    // Events
    describe_counter!(
        "fanout_gateway_events_received_total",
        "Total inbound events dispatched, by type"
    );
    describe_counter!(
        "fanout_gateway_handler_errors_total",
        "Total handler failures reported to clients"
    );
    describe_counter!(
        "fanout_gateway_unknown_events_total",
        "Total inbound events with no registered handler"
    );

    // Fan-out
    describe_counter!(
        "fanout_gateway_broadcasts_total",
        "Total events fanned out to the live set"
    );
    describe_counter!(
        "fanout_gateway_deliveries_total",
        "Total targeted deliveries requested"
    );
    describe_counter!(
        "fanout_gateway_evictions_total",
        "Total clients evicted for a full mailbox"
    );
    describe_histogram!(
        "fanout_gateway_fanout_seconds",
        "Time to enqueue one event to every recipient"
    );

    // Store
    describe_counter!(
        "fanout_gateway_store_operations_total",
        "Total subscription store operations, by outcome"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Why a connection left the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed or the socket failed.
    Disconnected,
    /// Inbound frame was not a valid event or exceeded the size limit.
    Protocol,
    /// No frame or pong arrived within the read deadline.
    ReadTimeout,
    /// A send did not complete within the write deadline.
    WriteTimeout,
    /// Mailbox could not take a reply.
    Backpressure,
    /// Server is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Label value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Protocol => "protocol",
            Self::ReadTimeout => "read_timeout",
            Self::WriteTimeout => "write_timeout",
            Self::Backpressure => "backpressure",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Record an accepted WebSocket upgrade.
pub fn record_connection_opened() {
    counter!("fanout_gateway_connections_total").increment(1);
}

/// Record a connection close.
pub fn record_connection_closed(reason: CloseReason) {
    counter!(
        "fanout_gateway_connection_closes_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Update the live client count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_clients(count: usize) {
    gauge!("fanout_gateway_active_clients").set(count as f64);
}

/// Record a dispatched inbound event.
pub fn record_event_received(event_type: &str) {
    counter!(
        "fanout_gateway_events_received_total",
        "event_type" => event_type.to_string()
    )
    .increment(1);
}

/// Record a handler failure.
pub fn record_handler_error(event_type: &str) {
    counter!(
        "fanout_gateway_handler_errors_total",
        "event_type" => event_type.to_string()
    )
    .increment(1);
}

/// Record an inbound event with no handler.
pub fn record_unknown_event() {
    counter!("fanout_gateway_unknown_events_total").increment(1);
}

/// Record one broadcast fan-out.
pub fn record_broadcast(duration: Duration) {
    counter!("fanout_gateway_broadcasts_total").increment(1);
    histogram!("fanout_gateway_fanout_seconds", "kind" => "broadcast")
        .record(duration.as_secs_f64());
}

/// Record one targeted delivery.
pub fn record_delivery(duration: Duration) {
    counter!("fanout_gateway_deliveries_total").increment(1);
    histogram!("fanout_gateway_fanout_seconds", "kind" => "deliver")
        .record(duration.as_secs_f64());
}

/// Record evicted clients.
pub fn record_evictions(count: u64) {
    counter!("fanout_gateway_evictions_total").increment(count);
}

/// Record a subscription store operation.
pub fn record_store_operation(operation: &'static str, ok: bool) {
    counter!(
        "fanout_gateway_store_operations_total",
        "operation" => operation,
        "outcome" => if ok { "ok" } else { "error" }
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================

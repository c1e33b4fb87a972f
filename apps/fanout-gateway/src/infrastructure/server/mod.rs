//! Gateway HTTP Server
//!
//! Serves the WebSocket endpoint alongside health, liveness, metrics and an
//! informational root, all on one port.
//!
//! # Endpoints
//!
//! - `GET /ws` - WebSocket upgrade; each socket becomes a hub connection
//! - `GET /health` - JSON health status with connected client count
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /` - Service name, version and endpoint paths

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::domain::event::new_client_id;
use crate::infrastructure::hub::{Connection, HubHandle, Keepalive, read_pump, write_pump};
use crate::infrastructure::metrics::{self, get_metrics_handle};

/// Path of the WebSocket endpoint.
pub const WS_PATH: &str = "/ws";

// =============================================================================
// Response Types
// =============================================================================

/// `/health` response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the process serves requests.
    pub status: &'static str,
    /// Clients in the hub's live set.
    pub connected_clients: usize,
    /// Time since startup, e.g. `1h2m3.5s`.
    pub uptime: String,
    /// Current time.
    pub timestamp: DateTime<Utc>,
}

/// `/` response.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    /// Service name.
    pub service: &'static str,
    /// Service version.
    pub version: String,
    /// WebSocket endpoint path.
    pub websocket: &'static str,
    /// Health endpoint path.
    pub health: &'static str,
}

// =============================================================================
// Server State
// =============================================================================

/// Shared state for the gateway routes.
#[derive(Debug)]
pub struct GatewayState {
    version: String,
    started_at: Instant,
    hub: HubHandle,
    keepalive: Keepalive,
}

impl GatewayState {
    /// Create state for a running hub.
    ///
    /// `started_at` is taken once at process start and reported as uptime.
    #[must_use]
    pub fn new(version: impl Into<String>, started_at: Instant, hub: HubHandle) -> Self {
        Self {
            version: version.into(),
            started_at,
            hub,
            keepalive: Keepalive::STANDARD,
        }
    }

    /// Override socket deadlines.
    #[must_use]
    pub fn with_keepalive(mut self, keepalive: Keepalive) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Hub behind the WebSocket endpoint.
    #[must_use]
    pub const fn hub(&self) -> &HubHandle {
        &self.hub
    }
}

/// Build the gateway router.
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route(WS_PATH, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// Gateway Server
// =============================================================================

/// Gateway HTTP server.
pub struct GatewayServer {
    port: u16,
    state: Arc<GatewayState>,
    cancel: CancellationToken,
}

impl GatewayServer {
    /// Create a new gateway server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<GatewayState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Bind to the configured port and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(self.port, e.to_string()))?;

        self.serve(listener).await
    }

    /// Serve on an already bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if the HTTP server fails while running.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        let local = listener
            .local_addr()
            .map_err(|e| ServerError::ServerFailed(e.to_string()))?;
        tracing::info!(addr = %local, "Gateway listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| ServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Gateway server stopped");
        Ok(())
    }
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn ws_handler(
    State(state): State<Arc<GatewayState>>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            tracing::warn!(error = %rejection, "WebSocket upgrade rejected");
            return rejection.into_response();
        }
    };

    upgrade
        .max_message_size(state.keepalive.max_message_size)
        .on_failed_upgrade(|e| tracing::warn!(error = %e, "WebSocket upgrade failed"))
        .on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(socket: WebSocket, state: Arc<GatewayState>) {
    let keepalive = state.keepalive;
    let (conn, mailbox) = Connection::new(new_client_id());

    if let Err(e) = state.hub.register(conn.clone()).await {
        tracing::warn!(client_id = %conn.id(), error = %e, "Rejecting connection");
        return;
    }
    metrics::record_connection_opened();

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(conn.clone(), mailbox, sink, keepalive));
    read_pump(conn.clone(), state.hub.clone(), stream, keepalive).await;

    if let Err(e) = writer.await {
        tracing::error!(client_id = %conn.id(), error = %e, "Write pump panicked");
    }
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        connected_clients: state.hub.num_clients(),
        uptime: format_uptime(state.started_at.elapsed()),
        timestamp: Utc::now(),
    })
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn root_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(ServiceInfo {
        service: env!("CARGO_PKG_NAME"),
        version: state.version.clone(),
        websocket: WS_PATH,
        health: "/health",
    })
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

// =============================================================================
// Uptime Formatting
// =============================================================================

/// Format a duration as `72h3m0.5s`, the largest unit first.
///
/// Durations under one second use `ms`, `µs` or `ns`. Zero is `0s`.
#[must_use]
pub fn format_uptime(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < 1_000 {
        return format!("{nanos}ns");
    }
    if nanos < 1_000_000 {
        return format!("{}µs", with_fraction(nanos / 1_000, nanos % 1_000, 3));
    }
    if nanos < 1_000_000_000 {
        return format!("{}ms", with_fraction(nanos / 1_000_000, nanos % 1_000_000, 6));
    }

    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    let seconds = with_fraction(
        u128::from(seconds),
        u128::from(duration.subsec_nanos()),
        9,
    );

    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

fn with_fraction(whole: u128, fraction: u128, digits: usize) -> String {
    if fraction == 0 {
        return whole.to_string();
    }
    let padded = format!("{fraction:0digits$}");
    format!("{whole}.{}", padded.trim_end_matches('0'))
}

// =============================================================================
// Errors
// =============================================================================

/// Gateway server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

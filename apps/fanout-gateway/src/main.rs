//! Fan-out Gateway Binary
//!
//! Starts the WebSocket hub and its HTTP server.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin fanout-gateway
//! ```
//!
//! # Environment Variables
//!
//! - `GATEWAY_PORT` (or `PORT`): HTTP/WebSocket port (default: 8080)
//! - `SUBSCRIPTION_BACKEND`: redis | memory (default: redis)
//! - `REDIS_URL`: Redis connection URL for a single node
//! - `REDIS_NODE_{1..6}_HOST`, `REDIS_NODE_{1..6}_PORT`, `REDIS_PASSWORD`: used when
//!   `REDIS_URL` is unset; two or more nodes select Redis Cluster
//! - `SUBSCRIPTION_STORE_TIMEOUT_MS`: Per-operation store deadline (default: 2000)
//! - `HUB_INTENT_CAPACITY`: Hub intent channel capacity (default: 1024)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: fanout-gateway)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use fanout_gateway::application::ports::SetStorePort;
use fanout_gateway::infrastructure::telemetry;
use fanout_gateway::{
    GatewayConfig, GatewayServer, GatewayState, Hub, InMemorySetStore, RedisSetStore,
    StoreBackend, SubscriptionStore, init_metrics, register_subscription_handlers,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Time allowed for the hub to close connections after shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let started_at = Instant::now();

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting fan-out gateway");

    let _metrics_handle = init_metrics();

    let config = GatewayConfig::from_env().context("invalid gateway configuration")?;
    log_config(&config);

    let backend = connect_store(&config).await?;
    let store = SubscriptionStore::new(backend, config.store.timeout);

    let shutdown_token = CancellationToken::new();

    let mut hub = Hub::new().with_intent_capacity(config.hub.intent_capacity);
    register_subscription_handlers(&mut hub, &store);
    tracing::info!(
        event_types = ?hub.handlers().event_types(),
        "Event handlers registered"
    );
    let (hub, hub_task) = hub.start(shutdown_token.clone());

    let state = Arc::new(GatewayState::new(
        env!("CARGO_PKG_VERSION"),
        started_at,
        hub,
    ));
    let server = GatewayServer::new(config.server.port, state, shutdown_token.clone());
    let server_task = tokio::spawn(server.run());

    tracing::info!("Gateway ready");

    tokio::select! {
        () = await_shutdown() => {}
        result = server_task => {
            match result {
                Ok(Ok(())) => tracing::warn!("Gateway server exited"),
                Ok(Err(e)) => tracing::error!(error = %e, "Gateway server error"),
                Err(e) => tracing::error!(error = %e, "Gateway server task panicked"),
            }
        }
    }

    shutdown_token.cancel();
    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, hub_task).await.is_err() {
        tracing::warn!("Hub did not stop before the shutdown timeout");
    }

    tracing::info!("Gateway stopped");
    Ok(())
}

/// Build the configured set store backend.
async fn connect_store(config: &GatewayConfig) -> anyhow::Result<Arc<dyn SetStorePort>> {
    match config.store.backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory subscription index; state is not shared");
            Ok(Arc::new(InMemorySetStore::new()))
        }
        StoreBackend::Redis => {
            let store = RedisSetStore::connect(&config.store.redis_nodes)
                .await
                .with_context(|| {
                    format!(
                        "failed to connect to {}",
                        config.store.redacted_nodes().join(",")
                    )
                })?;
            match tokio::time::timeout(config.store.timeout, store.ping()).await {
                Ok(Ok(())) => tracing::info!("Redis subscription index reachable"),
                Ok(Err(e)) => tracing::warn!(error = %e, "Redis ping failed"),
                Err(_) => tracing::warn!("Redis ping timed out"),
            }
            Ok(Arc::new(store))
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &GatewayConfig) {
    tracing::info!(
        port = config.server.port,
        backend = config.store.backend.as_str(),
        cluster = config.store.is_cluster(),
        store_timeout_ms = u64::try_from(config.store.timeout.as_millis()).unwrap_or(u64::MAX),
        intent_capacity = config.hub.intent_capacity,
        "Configuration loaded"
    );
    tracing::debug!(
        redis_nodes = ?config.store.redacted_nodes(),
        "Subscription store endpoints"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}

//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the WebSocket hub and the HTTP
//! surface that feeds it.

/// Configuration loading.
pub mod config;

/// Connection registry, socket pumps and event handlers.
pub mod hub;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// HTTP server with the WebSocket endpoint and health routes.
pub mod server;

/// Set store adapters (Redis, in-memory).
pub mod store;

/// OpenTelemetry tracing integration.
pub mod telemetry;

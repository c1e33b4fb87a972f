#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Fan-out Gateway - Real-time WebSocket Event Hub
//!
//! Accepts WebSocket clients, routes each typed event to a registered
//! handler, fans broadcasts out to every live connection and keeps a
//! bidirectional client <-> symbol subscription index in Redis for the
//! market data feed.
//!
//! # Layers (inside -> outside)
//!
//! - **Domain**: Wire events and subscription types
//!   - `event`: JSON event envelope and client identifiers
//!   - `subscription`: Asset classes, symbol updates, index key layout
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Set store interface
//!   - `services`: Subscription index maintenance
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `hub`: Connection registry, read/write pumps, event handlers
//!   - `store`: Redis and in-memory set stores
//!   - `server`: WebSocket endpoint, health and metrics routes
//!   - `config`: Environment configuration
//!
//! # Data Flow
//!
//! ```text
//!              +-------------+   intents   +-------------+
//! Client 1 --->| read pump   |------------>|     Hub     |
//! Client 2 --->| + handlers  |             | control loop|
//!              +------+------+             +------+------+
//!                     |                           | fan-out
//!                     v                           v
//!              +-------------+             +-------------+
//!              | Subscription|             |  mailboxes  |---> write pumps ---> Clients
//!              |    Store    |             +-------------+
//!              +------+------+
//!                     v
//!                   Redis
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Wire events and subscription types.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::event::{ClientId, Event, new_client_id};
pub use domain::subscription::{
    AssetClass, ClientSub, SubscribePayload, SubscriptionSnapshot, Symbol, SymbolUpdate,
};

// Ports and services
pub use application::ports::{SetBatch, SetCommand, SetStorePort, StoreError};
pub use application::services::SubscriptionStore;

// Hub
pub use infrastructure::hub::{
    Connection, DisconnectHook, EventHandler, HandlerContext, HandlerError, Hub, HubError,
    HubHandle, Keepalive, register_subscription_handlers,
};

// Stores
pub use infrastructure::store::{InMemorySetStore, RedisSetStore};

// Server
pub use infrastructure::server::{GatewayServer, GatewayState, ServerError};

// Infrastructure config
pub use infrastructure::config::{ConfigError, GatewayConfig, StoreBackend};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};

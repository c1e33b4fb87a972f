//! Configuration Module
//!
//! Environment-driven configuration for the gateway process.

mod settings;

pub use settings::{
    ConfigError, GatewayConfig, HubSettings, ServerSettings, StoreBackend, StoreSettings,
};

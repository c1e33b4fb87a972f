//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and the port interfaces
//! that define how the domain reaches external systems.

/// Port interfaces for external systems (set storage).
pub mod ports;

/// Application services for the subscription index.
pub mod services;

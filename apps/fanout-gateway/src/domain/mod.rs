//! Domain Layer - Wire events and subscription types.
//!
//! Pure types with serialization support. Nothing here performs I/O.

/// Wire event envelope and client identifiers.
pub mod event;

/// Asset classes, symbol updates and index key layout.
pub mod subscription;

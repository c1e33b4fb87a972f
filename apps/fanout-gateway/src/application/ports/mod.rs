//! Application Ports (Driven)
//!
//! Ports define the interfaces the application uses to reach external
//! systems. Infrastructure adapters implement them.
//!
//! - `SetStorePort`: key -> set-of-strings storage backing the subscription index

mod set_store_port;

pub use set_store_port::{SetBatch, SetCommand, SetStorePort, StoreError};

#[cfg(test)]
pub use set_store_port::MockSetStorePort;

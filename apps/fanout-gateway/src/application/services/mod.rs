//! Application Services
//!
//! Services that orchestrate domain logic over the ports.
//!
//! - `SubscriptionStore`: bidirectional client <-> symbol index

mod subscription_store;

pub use subscription_store::{DEFAULT_STORE_TIMEOUT, SubscriptionStore};

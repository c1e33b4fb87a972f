//! Set Store Adapters
//!
//! Implementations of [`SetStorePort`](crate::application::ports::SetStorePort):
//!
//! - `RedisSetStore`: a single Redis node or a Redis Cluster
//! - `InMemorySetStore`: process-local sets for development and tests

mod memory_store;
mod redis_store;

pub use memory_store::InMemorySetStore;
pub use redis_store::RedisSetStore;

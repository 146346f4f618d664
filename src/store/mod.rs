//! Security store backends
//!
//! This module provides the [`SecurityStore`] abstraction and its backends:
//! - `memory`: in-process map with per-category locks
//! - `redis`: shared store for multi-instance deployments
//! - `failover`: shared store with an in-process fallback

pub mod failover;
pub mod memory;
pub mod redis;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use failover::FailoverStore;
pub use memory::MemoryStore;
pub use self::redis::{RedisStore, RedisStoreConfig};
pub use traits::{bounded, key_category, SecurityStore};

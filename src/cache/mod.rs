//! Versioned response cache with offline support.
//!
//! This module provides:
//! - Named stores (one per deployed version) mapping request keys to responses
//! - Atomic manifest population for the install phase
//! - Network-first and cache-first fetch strategies
//! - A persistent queue for deferred order delivery

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, CachedResponse, QueueStorage, QueuedOrder, SqliteStorage};
pub use traits::{CacheResult, CacheSource};

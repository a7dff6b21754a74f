//! Tagged key/value storage used by the runtime for caching configuration
//! and deployment state. Entries carry an optional lifetime and a set of
//! tags allowing bulk invalidation.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;

use crate::config::{StorageConfig, StorageType};

mod memory;
pub use memory::MemoryStore;

/// Shared cache abstraction. Implementations must tolerate concurrent
/// access from every worker thread.
///
/// A `get` for a missing, removed or expired id is a miss, never an error.
/// `flush_by_tag` only touches entries carrying that tag.
pub trait Storage: Send + Sync {
    /// Upsert: replaces any existing entry with the same id, including its
    /// tags and lifetime.
    fn set(&self, id: &str, data: Bytes, tags: &[String], lifetime: Option<Duration>);

    fn get(&self, id: &str) -> Option<Bytes>;

    /// Returns whether an entry was actually removed.
    fn remove(&self, id: &str) -> bool;

    /// Drop every entry.
    fn flush(&self);

    /// Drop every entry carrying the tag; returns how many were removed.
    fn flush_by_tag(&self, tag: &str) -> usize;

    fn get_by_tag(&self, tag: &str) -> Vec<(String, Bytes)>;

    fn keys(&self) -> Vec<String>;

    /// Evict entries whose lifetime has passed; returns how many were
    /// evicted. Expired entries already miss on `get`, this only reclaims
    /// the memory.
    fn collect_garbage(&self) -> usize;
}

/// Resolve the configured backend type to a storage implementation.
pub fn build(config: &StorageConfig) -> Arc<dyn Storage> {
    match config.kind {
        StorageType::InMemory => Arc::new(MemoryStore::default()),
    }
}

//! Backend primitives consumed by the coordination components
//!
//! Each component depends on one narrow trait so that etcd, Redis and the
//! in-memory backends can be swapped without touching allocation, locking or
//! registry logic.

pub mod etcd;
pub mod factory;
pub mod memory;
pub mod redis;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

pub use factory::{CacheHandles, StoreBuilder};

/// A key/value pair read from an [`IdentityStore`], with the revision of its
/// last modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    pub revision: i64,
}

/// Precondition for [`IdentityStore::cas_put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutCondition {
    /// The key must not exist.
    Absent,
    /// The key must exist and still be at this modification revision.
    Revision(i64),
}

/// Consensus-backed store holding node identity records
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Read a single key
    async fn get(&self, key: &str) -> Result<Option<KvPair>>;

    /// List every key starting with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>>;

    /// Write `value` only if `condition` holds; returns whether the write happened
    async fn cas_put(&self, key: &str, value: &[u8], condition: PutCondition) -> Result<bool>;
}

/// Cache primitives used by the distributed mutex
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Create `key` with `value` and expiry `ttl` unless it already exists
    async fn set_if_absent_with_expiry(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool>;

    /// Atomically delete `key` if its value equals `expected`
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;
}

/// Cache primitives used by the service registry
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Atomically increment a counter and return the new value
    async fn incr(&self, key: &str) -> Result<i64>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Remove a hash field; returns whether it existed
    async fn hdel(&self, key: &str, field: &str) -> Result<bool>;

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
}

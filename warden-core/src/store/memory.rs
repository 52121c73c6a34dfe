//! In-memory backends
//!
//! Single-process stand-ins for etcd and Redis. They honour the same atomicity
//! contracts (one mutex per store) and are used by the test suites and by the
//! `memory` backend for local runs. Expiry follows the tokio clock, so tests
//! running with paused time see keys expire deterministically.

use crate::error::{Result, WardenError};
use crate::store::{IdentityStore, KvPair, LockStore, PutCondition, RegistryStore};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

fn unavailable() -> WardenError {
    WardenError::Backend("memory store marked unavailable".to_string())
}

struct IdentityInner {
    revision: i64,
    entries: BTreeMap<String, (Vec<u8>, i64)>,
}

/// In-memory [`IdentityStore`] with a global revision counter
pub struct MemoryIdentityStore {
    inner: Mutex<IdentityInner>,
    offline: AtomicBool,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(IdentityInner {
                revision: 0,
                entries: BTreeMap::new(),
            }),
            offline: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail with a backend error until restored
    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    /// Write a raw value regardless of its current state
    pub async fn put_raw(&self, key: &str, value: &[u8]) -> i64 {
        let mut inner = self.inner.lock().await;
        inner.revision += 1;
        let revision = inner.revision;
        inner
            .entries
            .insert(key.to_string(), (value.to_vec(), revision));
        revision
    }

    fn check_available(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        Ok(())
    }
}

impl Default for MemoryIdentityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn get(&self, key: &str) -> Result<Option<KvPair>> {
        self.check_available()?;
        let inner = self.inner.lock().await;

        Ok(inner.entries.get(key).map(|(value, revision)| KvPair {
            key: key.to_string(),
            value: value.clone(),
            revision: *revision,
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>> {
        self.check_available()?;
        let inner = self.inner.lock().await;

        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, (value, revision))| KvPair {
                key: key.clone(),
                value: value.clone(),
                revision: *revision,
            })
            .collect())
    }

    async fn cas_put(&self, key: &str, value: &[u8], condition: PutCondition) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;

        let current = inner.entries.get(key).map(|(_, revision)| *revision);
        let allowed = match condition {
            PutCondition::Absent => current.is_none(),
            PutCondition::Revision(expected) => current == Some(expected),
        };

        if !allowed {
            return Ok(false);
        }

        inner.revision += 1;
        let revision = inner.revision;
        inner
            .entries
            .insert(key.to_string(), (value.to_vec(), revision));

        Ok(true)
    }
}

struct ExpiringValue {
    value: String,
    expires_at: Option<Instant>,
}

impl ExpiringValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| now < deadline)
    }
}

#[derive(Default)]
struct CacheInner {
    strings: HashMap<String, ExpiringValue>,
    counters: HashMap<String, i64>,
    hashes: HashMap<String, HashMap<String, String>>,
}

/// In-memory [`LockStore`] and [`RegistryStore`]
pub struct MemoryCacheStore {
    inner: Mutex<CacheInner>,
    offline: AtomicBool,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            offline: AtomicBool::new(false),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    /// Current value of a string key, ignoring expired entries
    pub async fn get(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .strings
            .get(key)
            .filter(|entry| entry.is_live(Instant::now()))
            .map(|entry| entry.value.clone())
    }

    fn check_available(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        Ok(())
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockStore for MemoryCacheStore {
    async fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        if inner
            .strings
            .get(key)
            .is_some_and(|entry| entry.is_live(now))
        {
            return Ok(false);
        }

        inner.strings.insert(
            key.to_string(),
            ExpiringValue {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );

        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;

        let matches = inner
            .strings
            .get(key)
            .is_some_and(|entry| entry.is_live(Instant::now()) && entry.value == expected);

        if matches {
            inner.strings.remove(key);
        }

        Ok(matches)
    }
}

#[async_trait]
impl RegistryStore for MemoryCacheStore {
    async fn incr(&self, key: &str) -> Result<i64> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let counter = inner.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        Ok(inner
            .hashes
            .get_mut(key)
            .is_some_and(|hash| hash.remove(field).is_some()))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }
}

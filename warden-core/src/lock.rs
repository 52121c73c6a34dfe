//! Token-based distributed mutex
//!
//! A mutex instance owns one random token for its whole life. Acquisition is
//! a single set-if-absent with a fixed expiry; release is a server-side
//! compare-and-delete, so a holder whose key already expired can never delete
//! a key re-acquired by someone else.
//!
//! Backend errors are logged and reported as "not acquired" / "not released":
//! callers treat both like contention.

use crate::store::LockStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

/// Lifetime of a lock record in the store
pub const LOCK_EXPIRE: Duration = Duration::from_millis(1000);

pub const DEFAULT_LOCK_PREFIX: &str = "lock:";

/// Maps logical lock names to store keys.
///
/// With `hash_tag` the logical key is wrapped in braces (`prefix{key}`) so
/// that Redis Cluster hashes only the logical key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockKeyspace {
    prefix: String,
    hash_tag: bool,
}

impl LockKeyspace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            hash_tag: false,
        }
    }

    pub fn hash_tagged(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            hash_tag: true,
        }
    }

    pub fn key(&self, logical: &str) -> String {
        if self.hash_tag {
            format!("{}{{{}}}", self.prefix, logical)
        } else {
            format!("{}{}", self.prefix, logical)
        }
    }
}

impl Default for LockKeyspace {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_PREFIX)
    }
}

/// Creates mutexes that share one store and key layout
#[derive(Clone)]
pub struct LockFactory {
    store: Arc<dyn LockStore>,
    keyspace: LockKeyspace,
}

impl LockFactory {
    pub fn new(store: Arc<dyn LockStore>, keyspace: LockKeyspace) -> Self {
        Self { store, keyspace }
    }

    pub fn keyspace(&self) -> &LockKeyspace {
        &self.keyspace
    }

    /// New mutex instance for `key` with a fresh token
    pub fn new_mutex(&self, key: &str) -> DistributedMutex {
        DistributedMutex {
            store: self.store.clone(),
            key: self.keyspace.key(key),
            token: Ulid::new().to_string(),
        }
    }
}

pub struct DistributedMutex {
    store: Arc<dyn LockStore>,
    key: String,
    token: String,
}

impl DistributedMutex {
    /// Store key guarded by this mutex
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// One acquisition attempt
    pub async fn lock(&self) -> bool {
        match self
            .store
            .set_if_absent_with_expiry(&self.key, &self.token, LOCK_EXPIRE)
            .await
        {
            Ok(acquired) => acquired,
            Err(error) => {
                tracing::warn!("lock acquire failed for key={}: {}", self.key, error);
                false
            }
        }
    }

    /// Up to `attempts` acquisition attempts, sleeping `sleep` between failures
    pub async fn try_lock(&self, attempts: usize, sleep: Duration) -> bool {
        for attempt in 1..=attempts {
            if self.lock().await {
                return true;
            }

            if attempt < attempts {
                tokio::time::sleep(sleep).await;
            }
        }

        false
    }

    /// Retry every `retry` until acquired or `deadline` passes.
    ///
    /// No attempt is issued once the deadline has passed. A request already
    /// sent cannot be recalled from the server: when the deadline cuts one
    /// short, a release is queued behind it so a late acquisition does not
    /// linger until [`LOCK_EXPIRE`].
    pub async fn lock_until(&self, deadline: Instant, retry: Duration) -> bool {
        loop {
            if Instant::now() >= deadline {
                return false;
            }

            match tokio::time::timeout_at(deadline, self.lock()).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(_) => {
                    self.release_abandoned().await;
                    return false;
                }
            }

            tokio::time::sleep_until((Instant::now() + retry).min(deadline)).await;
        }
    }

    /// Retry every `retry` until acquired or `cancel` fires.
    ///
    /// Cancellation is checked before every attempt; an attempt cut short by
    /// it is followed by a release, as in [`lock_until`](Self::lock_until).
    pub async fn lock_or_cancel(&self, retry: Duration, cancel: &CancellationToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }

            let acquired = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.release_abandoned().await;
                    return false;
                }
                acquired = self.lock() => acquired,
            };
            if acquired {
                return true;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(retry) => {}
            }
        }
    }

    async fn release_abandoned(&self) {
        if self.unlock().await {
            tracing::debug!("released abandoned acquisition of {}", self.key);
        }
    }

    /// Delete the key if it still holds this mutex's token
    pub async fn unlock(&self) -> bool {
        match self.store.compare_and_delete(&self.key, &self.token).await {
            Ok(deleted) => deleted,
            Err(error) => {
                tracing::warn!("lock release failed for key={}: {}", self.key, error);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryCacheStore;

    fn factory(store: &Arc<MemoryCacheStore>) -> LockFactory {
        LockFactory::new(store.clone(), LockKeyspace::default())
    }

    #[test]
    fn keyspace_formats() {
        assert_eq!(LockKeyspace::default().key("user"), "lock:user");
        assert_eq!(
            LockKeyspace::hash_tagged("ffa:game:lock:").key("42"),
            "ffa:game:lock:{42}"
        );
    }

    #[tokio::test]
    async fn tokens_are_per_instance() {
        let store = Arc::new(MemoryCacheStore::new());
        let a = factory(&store).new_mutex("room:1");
        let b = factory(&store).new_mutex("room:1");

        assert_eq!(a.key(), b.key());
        assert_ne!(a.token(), b.token());

        assert!(a.lock().await);
        assert_eq!(store.get("lock:room:1").await.as_deref(), Some(a.token()));
        assert!(!a.lock().await);
    }

    #[tokio::test(start_paused = true)]
    async fn try_lock_waits_for_expiry() {
        let store = Arc::new(MemoryCacheStore::new());
        let holder = factory(&store).new_mutex("job");
        let waiter = factory(&store).new_mutex("job");

        assert!(holder.lock().await);
        assert!(waiter.try_lock(3, Duration::from_millis(600)).await);
        assert_eq!(store.get("lock:job").await.as_deref(), Some(waiter.token()));
    }

    #[tokio::test(start_paused = true)]
    async fn try_lock_does_not_sleep_after_last_attempt() {
        let store = Arc::new(MemoryCacheStore::new());
        let holder = factory(&store).new_mutex("job");
        let waiter = factory(&store).new_mutex("job");
        assert!(holder.lock().await);

        let started = Instant::now();
        assert!(!waiter.try_lock(2, Duration::from_millis(100)).await);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn lock_until_gives_up_at_deadline() {
        let store = Arc::new(MemoryCacheStore::new());
        let holder = factory(&store).new_mutex("job");
        let waiter = factory(&store).new_mutex("job");
        assert!(holder.lock().await);

        let deadline = Instant::now() + Duration::from_millis(500);
        assert!(!waiter.lock_until(deadline, Duration::from_millis(50)).await);
        assert!(Instant::now() >= deadline);

        let deadline = Instant::now() + Duration::from_secs(2);
        assert!(waiter.lock_until(deadline, Duration::from_millis(50)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_or_cancel_stops_on_signal() {
        let store = Arc::new(MemoryCacheStore::new());
        let holder = factory(&store).new_mutex("job");
        let waiter = factory(&store).new_mutex("job");
        assert!(holder.lock().await);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        assert!(!waiter.lock_or_cancel(Duration::from_millis(50), &cancel).await);
        assert_eq!(store.get("lock:job").await.as_deref(), Some(holder.token()));
    }

    #[tokio::test(start_paused = true)]
    async fn no_attempt_after_deadline_or_cancel() {
        let store = Arc::new(MemoryCacheStore::new());
        let mutex = factory(&store).new_mutex("job");

        let past = Instant::now();
        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(!mutex.lock_until(past, Duration::from_millis(50)).await);
        assert_eq!(store.get("lock:job").await, None);

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!mutex.lock_or_cancel(Duration::from_millis(50), &cancel).await);
        assert_eq!(store.get("lock:job").await, None);
    }

    #[tokio::test]
    async fn store_errors_read_as_not_acquired() {
        let store = Arc::new(MemoryCacheStore::new());
        let mutex = factory(&store).new_mutex("job");

        store.set_available(false);
        assert!(!mutex.lock().await);
        assert!(!mutex.unlock().await);

        store.set_available(true);
        assert!(mutex.lock().await);
        assert!(mutex.unlock().await);
    }
}

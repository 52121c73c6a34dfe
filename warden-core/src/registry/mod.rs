//! Self-refreshing service registry
//!
//! Every endpoint is one field of a shared hash whose value is the Unix second
//! of its last refresh. Readers treat fields older than the expiry window as
//! stale. A registry instance keeps only the fields it registered itself
//! alive: one background task sleeps until the oldest tracked field reaches the
//! window, rewrites that single field, and goes back to sleep until the next
//! oldest one is due.

mod server_info;

pub use server_info::{SERVER_TYPE_BASE, ServerInfo};

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, WardenError};
use crate::store::RegistryStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Hash holding every registered endpoint
pub const REGISTRY_KEY: &str = "module:server";

/// Age after which readers consider an entry stale
pub const REGISTRY_EXPIRE: Duration = Duration::from_secs(60);

/// Added to the per-type sequence so dynamic node ids stay clear of the
/// statically assigned low range
pub const NODE_ID_OFFSET: i64 = 100;

/// Wake-up interval while nothing is tracked
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Wake-up interval after a failed refresh
const RETRY_DELAY: Duration = Duration::from_secs(1);

fn sequence_key(server_type: u32) -> String {
    format!("serverType:{}:nodoId", server_type)
}

#[derive(Clone)]
pub struct RegistryOptions {
    pub key: String,
    pub expiry: Duration,
    pub clock: Arc<dyn Clock>,
}

impl RegistryOptions {
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Expiry window, at least one second
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry.max(Duration::from_secs(1));
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn expiry_secs(&self) -> i64 {
        self.expiry.as_secs().max(1) as i64
    }
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            key: REGISTRY_KEY.to_string(),
            expiry: REGISTRY_EXPIRE,
            clock: Arc::new(SystemClock),
        }
    }
}

/// A registry field as seen by readers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub info: ServerInfo,
    pub refreshed_at: i64,
}

impl RegistryEntry {
    pub fn age(&self, now: i64) -> i64 {
        now - self.refreshed_at
    }

    pub fn is_stale(&self, now: i64, expiry: Duration) -> bool {
        self.age(now) > expiry.as_secs() as i64
    }
}

pub struct ServiceRegistry {
    store: Arc<dyn RegistryStore>,
    options: RegistryOptions,
    tracked: RwLock<HashMap<String, i64>>,
    wake: Notify,
    /// Cancellation token of the current refresh loop
    active: Mutex<Option<CancellationToken>>,
}

impl ServiceRegistry {
    pub fn new(store: Arc<dyn RegistryStore>, options: RegistryOptions) -> Arc<Self> {
        Arc::new(Self {
            store,
            options,
            tracked: RwLock::new(HashMap::new()),
            wake: Notify::new(),
            active: Mutex::new(None),
        })
    }

    /// Build a registry and start its refresh loop
    pub fn start(
        store: Arc<dyn RegistryStore>,
        options: RegistryOptions,
    ) -> Result<(Arc<Self>, RefreshHandle)> {
        let registry = Self::new(store, options);
        let handle = registry.start_refresh()?;
        Ok((registry, handle))
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    /// Spawn the refresh loop. Only one live loop may run per registry; once
    /// the previous handle is stopped or dropped a new loop can start at once.
    /// A loop that was only signalled exits at its next await point, and every
    /// tick runs under the tracked-map lock, so the two never refresh
    /// concurrently.
    pub fn start_refresh(self: &Arc<Self>) -> Result<RefreshHandle> {
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if active.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return Err(WardenError::Internal(
                "registry refresh loop already running".to_string(),
            ));
        }

        let cancel = CancellationToken::new();
        *active = Some(cancel.clone());
        drop(active);

        let registry = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            registry.run_refresh(token).await;
        });

        Ok(RefreshHandle {
            cancel,
            task: Some(task),
        })
    }

    /// Register an endpoint under a freshly sequenced node id and return the
    /// registered info
    pub async fn register(&self, mut info: ServerInfo) -> Result<ServerInfo> {
        let sequence = self.store.incr(&sequence_key(info.server_type)).await?;
        info.node_id = ((sequence + NODE_ID_OFFSET) % SERVER_TYPE_BASE as i64) as u32;
        let field = info.encode()?;

        let mut tracked = self.tracked.write().await;
        if tracked.contains_key(&field) {
            tracing::debug!("registry entry {} already tracked", field);
            return Ok(info);
        }

        let now = self.options.clock.now_unix();
        self.store
            .hset(&self.options.key, &field, &now.to_string())
            .await?;

        tracked.insert(field.clone(), now);
        drop(tracked);
        self.wake.notify_one();

        tracing::info!("registered service entry {}", field);
        Ok(info)
    }

    /// Remove an endpoint registered by this instance; returns whether it was
    /// tracked
    pub async fn deregister(&self, info: &ServerInfo) -> Result<bool> {
        let field = info.encode()?;

        // held across the delete so a refresh tick cannot write the field back
        let mut tracked = self.tracked.write().await;
        if !tracked.contains_key(&field) {
            return Ok(false);
        }

        self.store.hdel(&self.options.key, &field).await?;

        tracked.remove(&field);
        drop(tracked);
        self.wake.notify_one();

        tracing::info!("deregistered service entry {}", field);
        Ok(true)
    }

    /// Every decodable entry of the shared hash with its refresh time
    pub async fn list_entries(&self) -> Result<Vec<RegistryEntry>> {
        let fields = self.store.hgetall(&self.options.key).await?;

        let mut entries = Vec::with_capacity(fields.len());
        for (field, value) in fields {
            match field.parse::<ServerInfo>() {
                Ok(info) => entries.push(RegistryEntry {
                    info,
                    refreshed_at: value.trim().parse::<i64>().unwrap_or(0),
                }),
                Err(error) => {
                    tracing::debug!("skipping registry field {}: {}", field, error);
                }
            }
        }

        Ok(entries)
    }

    pub async fn list_services(&self) -> Result<Vec<ServerInfo>> {
        Ok(self
            .list_entries()
            .await?
            .into_iter()
            .map(|entry| entry.info)
            .collect())
    }

    pub async fn get_service(&self, server_type: u32) -> Result<Vec<ServerInfo>> {
        if server_type == 0 {
            return Ok(Vec::new());
        }

        Ok(self
            .list_services()
            .await?
            .into_iter()
            .filter(|info| info.server_type == server_type)
            .collect())
    }

    /// Entries not older than the expiry window, optionally of one type
    pub async fn live_services(&self, server_type: Option<u32>) -> Result<Vec<ServerInfo>> {
        let now = self.options.clock.now_unix();
        Ok(self
            .list_entries()
            .await?
            .into_iter()
            .filter(|entry| !entry.is_stale(now, self.options.expiry))
            .filter(|entry| server_type.is_none_or(|wanted| entry.info.server_type == wanted))
            .map(|entry| entry.info)
            .collect())
    }

    /// Locally tracked fields and their last refresh time
    pub async fn tracked(&self) -> HashMap<String, i64> {
        self.tracked.read().await.clone()
    }

    /// One refresh-loop tick: refresh the oldest tracked entry if it reached
    /// the expiry window and return how long to sleep before the next tick.
    pub async fn refresh_oldest(&self) -> Duration {
        let mut tracked = self.tracked.write().await;
        let expiry = self.options.expiry_secs();
        let now = self.options.clock.now_unix();

        let Some((field, refreshed_at)) = oldest(&tracked) else {
            return IDLE_POLL;
        };

        if now - refreshed_at >= expiry {
            match self
                .store
                .hset(&self.options.key, &field, &now.to_string())
                .await
            {
                Ok(()) => {
                    tracked.insert(field.clone(), now);
                    tracing::info!("update key's expire time in registry: {}", field);
                }
                Err(error) => {
                    tracing::error!("update expire time failed for {}: {}", field, error);
                    return RETRY_DELAY;
                }
            }
        }

        match oldest(&tracked) {
            Some((_, refreshed_at)) => {
                let remaining = expiry - (now - refreshed_at);
                Duration::from_secs(remaining.max(0) as u64)
            }
            None => IDLE_POLL,
        }
    }

    async fn run_refresh(&self, cancel: CancellationToken) {
        let mut delay = Duration::ZERO;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }

            delay = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = self.refresh_oldest() => next,
            };
        }

        tracing::debug!("registry refresh loop stopped");
    }
}

fn oldest(tracked: &HashMap<String, i64>) -> Option<(String, i64)> {
    tracked
        .iter()
        .min_by_key(|(_, refreshed_at)| **refreshed_at)
        .map(|(field, refreshed_at)| (field.clone(), *refreshed_at))
}

/// Owner of a running refresh loop.
///
/// `stop` cancels the loop and waits for it to exit. Dropping the handle only
/// signals the cancellation, but the registry accepts a new loop right away.
pub struct RefreshHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RefreshHandle {
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(error) = task.await
        {
            tracing::warn!("registry refresh task ended abnormally: {}", error);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|task| task.is_finished())
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryCacheStore;
    use async_trait::async_trait;
    use std::net::IpAddr;
    use tokio::time::Instant;

    /// Memory store whose deletes stay in flight for a while after applying
    struct SlowDeleteStore {
        inner: Arc<MemoryCacheStore>,
        delay: Duration,
    }

    #[async_trait]
    impl RegistryStore for SlowDeleteStore {
        async fn incr(&self, key: &str) -> Result<i64> {
            self.inner.incr(key).await
        }

        async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
            self.inner.hset(key, field, value).await
        }

        async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
            self.inner.hget(key, field).await
        }

        async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
            let removed = self.inner.hdel(key, field).await?;
            tokio::time::sleep(self.delay).await;
            Ok(removed)
        }

        async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
            self.inner.hgetall(key).await
        }
    }

    /// Wall clock that advances with tokio's (possibly paused) clock
    struct TokioClock {
        origin_unix: i64,
        origin: Instant,
    }

    impl TokioClock {
        fn new(origin_unix: i64) -> Self {
            Self {
                origin_unix,
                origin: Instant::now(),
            }
        }
    }

    impl Clock for TokioClock {
        fn now_unix(&self) -> i64 {
            self.origin_unix + self.origin.elapsed().as_secs() as i64
        }
    }

    const T0: i64 = 1_700_000_000;

    fn registry(store: &Arc<MemoryCacheStore>) -> Arc<ServiceRegistry> {
        let options = RegistryOptions::default().with_clock(Arc::new(TokioClock::new(T0)));
        ServiceRegistry::new(store.clone(), options)
    }

    fn endpoint(server_type: u32, port: u16) -> ServerInfo {
        ServerInfo::new(server_type, IpAddr::from([10, 0, 0, 1]), port)
    }

    async fn stored_at(store: &MemoryCacheStore, field: &str) -> Option<i64> {
        store
            .hget(REGISTRY_KEY, field)
            .await
            .unwrap()
            .map(|value| value.parse().unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn register_sequences_node_ids_per_type() {
        let store = Arc::new(MemoryCacheStore::new());
        let registry = registry(&store);

        let first = registry.register(endpoint(2, 9000)).await.unwrap();
        let second = registry.register(endpoint(2, 9001)).await.unwrap();
        let other = registry.register(endpoint(3, 9002)).await.unwrap();

        assert_eq!(first.node_id, 101);
        assert_eq!(second.node_id, 102);
        assert_eq!(other.node_id, 101);

        assert_eq!(stored_at(&store, "10.0.0.1:9000:20101").await, Some(T0));
        assert_eq!(registry.tracked().await.len(), 3);

        let mut type_two = registry.get_service(2).await.unwrap();
        type_two.sort_by_key(|info| info.port);
        assert_eq!(type_two, vec![first, second]);
        assert!(registry.get_service(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn listing_skips_foreign_garbage_but_keeps_foreign_entries() {
        let store = Arc::new(MemoryCacheStore::new());
        store.hset(REGISTRY_KEY, "garbage", "1").await.unwrap();
        store
            .hset(REGISTRY_KEY, "10.0.0.9:8000:40005", "12")
            .await
            .unwrap();

        let registry = registry(&store);
        let services = registry.list_services().await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].server_type, 4);
        assert_eq!(services[0].node_id, 5);
        assert!(registry.tracked().await.is_empty());
    }

    #[tokio::test]
    async fn deregister_only_touches_tracked_entries() {
        let store = Arc::new(MemoryCacheStore::new());
        store
            .hset(REGISTRY_KEY, "10.0.0.1:9000:20101", "12")
            .await
            .unwrap();

        let registry = registry(&store);
        let foreign = ServerInfo {
            node_id: 101,
            ..endpoint(2, 9000)
        };
        assert!(!registry.deregister(&foreign).await.unwrap());
        assert!(stored_at(&store, "10.0.0.1:9000:20101").await.is_some());

        let own = registry.register(endpoint(2, 9500)).await.unwrap();
        assert!(registry.deregister(&own).await.unwrap());
        assert!(stored_at(&store, &own.encode().unwrap()).await.is_none());
        assert!(registry.tracked().await.is_empty());
    }

    #[tokio::test]
    async fn register_propagates_backend_errors() {
        let store = Arc::new(MemoryCacheStore::new());
        let registry = registry(&store);
        store.set_available(false);

        let result = registry.register(endpoint(2, 9000)).await;
        assert!(matches!(result, Err(WardenError::Backend(_))));
        assert!(registry.tracked().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_tick_sleeps_until_oldest_is_due() {
        let store = Arc::new(MemoryCacheStore::new());
        let registry = registry(&store);

        assert_eq!(registry.refresh_oldest().await, IDLE_POLL);

        registry.register(endpoint(2, 9000)).await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(registry.refresh_oldest().await, Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_loop_refreshes_the_most_stale_entry_first() {
        let store = Arc::new(MemoryCacheStore::new());
        let registry = registry(&store);
        let handle = registry.start_refresh().unwrap();

        let a = registry.register(endpoint(2, 9000)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        let b = registry.register(endpoint(2, 9001)).await.unwrap();
        let a_field = a.encode().unwrap();
        let b_field = b.encode().unwrap();

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(stored_at(&store, &a_field).await, Some(T0 + 60));
        assert_eq!(stored_at(&store, &b_field).await, Some(T0 + 30));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(stored_at(&store, &b_field).await, Some(T0 + 90));

        let now = registry.options().clock.now_unix();
        for entry in registry.list_entries().await.unwrap() {
            assert!(!entry.is_stale(now, REGISTRY_EXPIRE));
        }

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_is_retried() {
        let store = Arc::new(MemoryCacheStore::new());
        let registry = registry(&store);
        let handle = registry.start_refresh().unwrap();

        let info = registry.register(endpoint(2, 9000)).await.unwrap();
        let field = info.encode().unwrap();

        tokio::time::sleep(Duration::from_secs(59)).await;
        store.set_available(false);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(registry.tracked().await.get(&field), Some(&T0));

        store.set_available(true);
        tokio::time::sleep(Duration::from_secs(2)).await;
        let refreshed = stored_at(&store, &field).await.unwrap();
        assert!(refreshed >= T0 + 62);
        assert_eq!(registry.tracked().await.get(&field), Some(&refreshed));

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn deregister_is_not_undone_by_a_due_refresh() {
        let store = Arc::new(MemoryCacheStore::new());
        let slow = Arc::new(SlowDeleteStore {
            inner: store.clone(),
            delay: Duration::from_secs(2),
        });
        let options = RegistryOptions::default().with_clock(Arc::new(TokioClock::new(T0)));
        let registry = ServiceRegistry::new(slow, options);
        let handle = registry.start_refresh().unwrap();

        let info = registry.register(endpoint(2, 9000)).await.unwrap();
        let field = info.encode().unwrap();

        tokio::time::sleep(Duration::from_millis(59_500)).await;
        assert!(registry.deregister(&info).await.unwrap());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(registry.tracked().await.is_empty());
        assert_eq!(stored_at(&store, &field).await, None);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handle_allows_an_immediate_restart() {
        let store = Arc::new(MemoryCacheStore::new());
        let registry = registry(&store);

        let first = registry.start_refresh().unwrap();
        drop(first);

        let second = registry.start_refresh().unwrap();
        assert!(registry.start_refresh().is_err());

        let info = registry.register(endpoint(2, 9000)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(
            stored_at(&store, &info.encode().unwrap()).await,
            Some(T0 + 60)
        );

        second.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_the_loop_and_releases_the_map() {
        let store = Arc::new(MemoryCacheStore::new());
        let registry = registry(&store);
        let handle = registry.start_refresh().unwrap();
        assert!(registry.start_refresh().is_err());

        let info = registry.register(endpoint(2, 9000)).await.unwrap();
        handle.stop().await;

        drop(registry.tracked.write().await);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(stored_at(&store, &info.encode().unwrap()).await, Some(T0));

        let restarted = registry.start_refresh().unwrap();
        assert!(!restarted.is_finished());
        restarted.stop().await;
    }
}

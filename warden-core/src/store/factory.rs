use super::etcd::EtcdIdentityStore;
use super::memory::{MemoryCacheStore, MemoryIdentityStore};
use super::redis::RedisStore;
use super::{IdentityStore, LockStore, RegistryStore};
use crate::{Result, WardenError};
use std::sync::Arc;

/// The two views of one cache backend connection
#[derive(Clone)]
pub struct CacheHandles {
    pub locks: Arc<dyn LockStore>,
    pub registry: Arc<dyn RegistryStore>,
}

#[derive(Debug, Clone, Default)]
pub struct StoreBuilder {
    identity_backend: Option<String>,
    cache_backend: Option<String>,
    etcd_endpoints: Option<Vec<String>>,
    redis_url: Option<String>,
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity_backend(mut self, backend: impl Into<String>) -> Self {
        self.identity_backend = Some(backend.into());
        self
    }

    pub fn cache_backend(mut self, backend: impl Into<String>) -> Self {
        self.cache_backend = Some(backend.into());
        self
    }

    pub fn etcd_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.etcd_endpoints = Some(endpoints);
        self
    }

    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    fn resolve_backend(value: Option<&str>, role: &str) -> Result<String> {
        let backend = value.unwrap_or_default().trim().to_ascii_lowercase();

        if backend.is_empty() {
            return Err(WardenError::Config(format!(
                "{} backend cannot be empty",
                role
            )));
        }

        Ok(backend)
    }

    pub async fn build_identity_store(&self) -> Result<Arc<dyn IdentityStore>> {
        let backend = Self::resolve_backend(self.identity_backend.as_deref(), "identity")?;

        match backend.as_str() {
            "etcd" => {
                let endpoints: Vec<String> = self
                    .etcd_endpoints
                    .clone()
                    .ok_or_else(|| {
                        WardenError::Config(
                            "etcd endpoints are required for etcd backend".to_string(),
                        )
                    })?
                    .into_iter()
                    .map(|endpoint| endpoint.trim().to_string())
                    .filter(|endpoint| !endpoint.is_empty())
                    .collect();

                if endpoints.is_empty() {
                    return Err(WardenError::Config(
                        "etcd endpoints cannot be empty for etcd backend".to_string(),
                    ));
                }

                let store = EtcdIdentityStore::connect(&endpoints).await?;
                Ok(Arc::new(store))
            }
            "memory" => Ok(Arc::new(MemoryIdentityStore::new())),
            other => Err(WardenError::Config(format!(
                "unsupported identity backend: {}",
                other
            ))),
        }
    }

    pub async fn build_cache_store(&self) -> Result<CacheHandles> {
        let backend = Self::resolve_backend(self.cache_backend.as_deref(), "cache")?;

        match backend.as_str() {
            "redis" => {
                let url = self.redis_url.as_deref().unwrap_or_default().trim();
                if url.is_empty() {
                    return Err(WardenError::Config(
                        "redis url is required for redis backend".to_string(),
                    ));
                }

                let store = Arc::new(RedisStore::connect(url).await?);
                Ok(CacheHandles {
                    locks: store.clone(),
                    registry: store,
                })
            }
            "memory" => {
                let store = Arc::new(MemoryCacheStore::new());
                Ok(CacheHandles {
                    locks: store.clone(),
                    registry: store,
                })
            }
            other => Err(WardenError::Config(format!(
                "unsupported cache backend: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_backend_is_a_config_error() {
        let err = StoreBuilder::new().build_identity_store().await.err();
        assert!(matches!(err, Some(WardenError::Config(_))));
    }

    #[tokio::test]
    async fn etcd_backend_requires_endpoints() {
        let err = StoreBuilder::new()
            .identity_backend("etcd")
            .etcd_endpoints(vec!["  ".to_string()])
            .build_identity_store()
            .await
            .err();
        assert!(matches!(err, Some(WardenError::Config(message)) if message.contains("cannot be empty")));
    }

    #[tokio::test]
    async fn redis_backend_requires_url() {
        let err = StoreBuilder::new()
            .cache_backend("Redis")
            .build_cache_store()
            .await
            .err();
        assert!(matches!(err, Some(WardenError::Config(message)) if message.contains("redis url")));
    }

    #[tokio::test]
    async fn memory_backends_share_one_cache() {
        let handles = StoreBuilder::new()
            .cache_backend("memory")
            .build_cache_store()
            .await
            .unwrap();

        assert_eq!(handles.registry.incr("n").await.unwrap(), 1);
        assert_eq!(handles.registry.incr("n").await.unwrap(), 2);

        let unknown = StoreBuilder::new()
            .cache_backend("memcached")
            .build_cache_store()
            .await
            .err();
        assert!(matches!(unknown, Some(WardenError::Config(_))));
    }
}

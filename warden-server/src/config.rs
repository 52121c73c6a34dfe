use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use warden_core::{
    DEFAULT_LOCK_PREFIX, IdentityDescriptor, LockKeyspace, REGISTRY_KEY, RegistryOptions, Result,
    ServerInfo, StoreBuilder, WardenError,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub service_key: String,
    pub local_ip: String,
    /// Defaults to the running executable
    #[serde(default)]
    pub local_path: Option<String>,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub backend: IdentityBackend,
    pub etcd: Option<EtcdConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityBackend {
    #[default]
    Etcd,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,
    pub redis: Option<RedisConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Redis,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub hash_tag: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            prefix: default_lock_prefix(),
            hash_tag: false,
        }
    }
}

fn default_lock_prefix() -> String {
    DEFAULT_LOCK_PREFIX.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_key")]
    pub key: String,
    #[serde(default = "default_registry_expiry_secs")]
    pub expiry_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            key: default_registry_key(),
            expiry_secs: default_registry_expiry_secs(),
        }
    }
}

fn default_registry_key() -> String {
    REGISTRY_KEY.to_string()
}

fn default_registry_expiry_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub server_type: u32,
    pub port: u16,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("WARDEN"))
            .build()
            .map_err(|e| WardenError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| WardenError::Config(e.to_string()))?;

        Ok(config)
    }

    pub fn store_builder(&self) -> StoreBuilder {
        let mut builder = StoreBuilder::new();

        builder = match self.identity.backend {
            IdentityBackend::Etcd => {
                let builder = builder.identity_backend("etcd");
                match &self.identity.etcd {
                    Some(etcd) => builder.etcd_endpoints(etcd.endpoints.clone()),
                    None => builder,
                }
            }
            IdentityBackend::Memory => builder.identity_backend("memory"),
        };

        match self.cache.backend {
            CacheBackend::Redis => {
                let builder = builder.cache_backend("redis");
                match &self.cache.redis {
                    Some(redis) => builder.redis_url(redis.url.clone()),
                    None => builder,
                }
            }
            CacheBackend::Memory => builder.cache_backend("memory"),
        }
    }

    pub fn lock_keyspace(&self) -> LockKeyspace {
        if self.lock.hash_tag {
            LockKeyspace::hash_tagged(self.lock.prefix.clone())
        } else {
            LockKeyspace::new(self.lock.prefix.clone())
        }
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions::default()
            .with_key(self.registry.key.clone())
            .with_expiry(Duration::from_secs(self.registry.expiry_secs))
    }

    pub fn descriptor(&self) -> Result<IdentityDescriptor> {
        match &self.local_path {
            Some(path) => Ok(IdentityDescriptor::new(
                self.service_key.clone(),
                self.local_ip.clone(),
                path.clone(),
            )),
            None => IdentityDescriptor::for_current_exe(
                self.service_key.clone(),
                self.local_ip.clone(),
            ),
        }
    }

    /// Configured endpoints on `local_ip`, node ids still unassigned
    pub fn server_infos(&self) -> Result<Vec<ServerInfo>> {
        let ip = self.local_ip.trim().parse::<IpAddr>().map_err(|_| {
            WardenError::Config(format!("local_ip is not an IP address: {}", self.local_ip))
        })?;

        Ok(self
            .endpoints
            .iter()
            .map(|endpoint| ServerInfo::new(endpoint.server_type, ip, endpoint.port))
            .collect())
    }
}

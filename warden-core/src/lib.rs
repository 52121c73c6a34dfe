//! Warden Core - node identity, distributed locking and service discovery
//! for fleets of game and backend service processes

pub mod clock;
pub mod error;
pub mod identity;
pub mod lock;
pub mod registry;
pub mod snowflake;
pub mod store;

pub use clock::{Clock, SystemClock};
pub use error::{Result, WardenError};
pub use identity::{
    FreeIdSet, IdentityDescriptor, NODE_ID_RETRY_COUNT, NodeClaim, NodeIdentityAllocator,
    node_key,
};
pub use lock::{DEFAULT_LOCK_PREFIX, DistributedMutex, LOCK_EXPIRE, LockFactory, LockKeyspace};
pub use registry::{
    REGISTRY_EXPIRE, REGISTRY_KEY, RefreshHandle, RegistryEntry, RegistryOptions, ServerInfo,
    ServiceRegistry,
};
pub use snowflake::{SnowflakeGenerator, SnowflakeParts};
pub use store::etcd::EtcdIdentityStore;
pub use store::memory::{MemoryCacheStore, MemoryIdentityStore};
pub use store::redis::RedisStore;
pub use store::{
    CacheHandles, IdentityStore, KvPair, LockStore, PutCondition, RegistryStore, StoreBuilder,
};

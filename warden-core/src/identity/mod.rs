//! Node identity allocation
//!
//! Each service process claims a small positive integer under
//! `<service_key>/nodeId/node_<NN>`. A restarted process with the same
//! address and binary path recovers its previous id instead of taking a new
//! one; otherwise the smallest free id is claimed with a create-if-absent
//! compare-and-swap.

mod free_ids;

pub use free_ids::FreeIdSet;

use crate::error::{Result, WardenError};
use crate::store::{IdentityStore, KvPair, PutCondition};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Allocation attempts before giving up on a contended keyspace
pub const NODE_ID_RETRY_COUNT: usize = 5;

const NODE_BUCKET: &str = "nodeId";
const NODE_PREFIX: &str = "node_";
const APPLY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Who is claiming a node id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityDescriptor {
    #[serde(default)]
    pub local_path: String,
    #[serde(default)]
    pub local_ip: String,
    #[serde(default)]
    pub apply_time: String,
    #[serde(skip)]
    pub service_key: String,
}

impl IdentityDescriptor {
    pub fn new(
        service_key: impl Into<String>,
        local_ip: impl Into<String>,
        local_path: impl Into<String>,
    ) -> Self {
        Self {
            local_path: local_path.into(),
            local_ip: local_ip.into(),
            apply_time: String::new(),
            service_key: service_key.into(),
        }
    }

    /// Describe the running executable on `local_ip`
    pub fn for_current_exe(
        service_key: impl Into<String>,
        local_ip: impl Into<String>,
    ) -> Result<Self> {
        let exe = std::env::current_exe()?;
        Ok(Self::new(
            service_key,
            local_ip,
            exe.to_string_lossy().into_owned(),
        ))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    fn same_holder(&self, other: &IdentityDescriptor) -> bool {
        self.local_ip == other.local_ip && self.local_path == other.local_path
    }

    fn stamp(&mut self) {
        self.apply_time = chrono::Local::now().format(APPLY_TIME_FORMAT).to_string();
    }
}

/// Result of a successful allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeClaim {
    pub node_id: u32,
    pub key: String,
    pub recovered: bool,
    pub descriptor: IdentityDescriptor,
}

pub fn node_key(service_key: &str, node_id: u32) -> String {
    format!("{}/{}/{}{:02}", service_key, NODE_BUCKET, NODE_PREFIX, node_id)
}

fn node_key_prefix(service_key: &str) -> String {
    format!("{}/{}/{}", service_key, NODE_BUCKET, NODE_PREFIX)
}

/// Parse the id suffix of a node key; `None` for anything that is not a
/// positive id
pub fn parse_node_id(key: &str) -> Option<u32> {
    key.rsplit('/')
        .next()?
        .strip_prefix(NODE_PREFIX)?
        .parse::<u32>()
        .ok()
        .filter(|id| *id > 0)
}

/// Make `path` absolute and lexically clean (`.` and `..` folded)
pub fn normalize_path(path: &str) -> Result<String> {
    let raw = Path::new(path);
    let absolute = if raw.as_os_str().is_empty() {
        std::env::current_dir()?
    } else if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        std::env::current_dir()?.join(raw)
    };

    let mut cleaned = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }

    Ok(cleaned.to_string_lossy().into_owned())
}

pub struct NodeIdentityAllocator {
    store: Arc<dyn IdentityStore>,
    retry_count: usize,
}

impl NodeIdentityAllocator {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self {
            store,
            retry_count: NODE_ID_RETRY_COUNT,
        }
    }

    pub fn with_retry_count(mut self, retry_count: usize) -> Self {
        self.retry_count = retry_count.max(1);
        self
    }

    /// Recover this holder's previous id, or claim the smallest free one
    pub async fn get_node_id(&self, descriptor: &IdentityDescriptor) -> Result<NodeClaim> {
        if descriptor.service_key.trim().is_empty() {
            return Err(WardenError::Config(
                "node id service key cannot be empty".to_string(),
            ));
        }

        let mut descriptor = descriptor.clone();
        descriptor.local_path = normalize_path(&descriptor.local_path)?;

        if let Some(claim) = self.recover_node_id(&descriptor).await? {
            return Ok(claim);
        }

        self.apply_node_id(&descriptor).await
    }

    /// Reclaim a record written earlier by the same address and binary path
    pub async fn recover_node_id(
        &self,
        descriptor: &IdentityDescriptor,
    ) -> Result<Option<NodeClaim>> {
        let pairs = self
            .store
            .list(&node_key_prefix(&descriptor.service_key))
            .await?;

        for pair in pairs {
            let Some(node_id) = parse_node_id(&pair.key) else {
                continue;
            };

            let stored = match IdentityDescriptor::decode(&pair.value) {
                Ok(stored) => stored,
                Err(error) => {
                    tracing::debug!("skipping undecodable node record {}: {}", pair.key, error);
                    continue;
                }
            };

            if !stored.same_holder(descriptor) {
                continue;
            }

            let mut claimed = descriptor.clone();
            if !self.try_hold(&pair, &mut claimed).await? {
                tracing::warn!(
                    "node record {} changed while reclaiming, allocating a new id",
                    pair.key
                );
                return Ok(None);
            }

            tracing::info!(
                "recovered node id {} for {} {}",
                node_id,
                claimed.local_ip,
                claimed.local_path
            );
            return Ok(Some(NodeClaim {
                node_id,
                key: pair.key,
                recovered: true,
                descriptor: claimed,
            }));
        }

        Ok(None)
    }

    /// Claim the smallest free id, retrying with a fresh scan when a
    /// concurrent claimer wins the same id
    pub async fn apply_node_id(&self, descriptor: &IdentityDescriptor) -> Result<NodeClaim> {
        let prefix = node_key_prefix(&descriptor.service_key);

        for attempt in 1..=self.retry_count {
            let pairs = self.store.list(&prefix).await?;
            let used: FreeIdSet = pairs
                .iter()
                .filter_map(|pair| parse_node_id(&pair.key))
                .collect();
            let node_id = used.smallest_free();

            let key = node_key(&descriptor.service_key, node_id);
            let mut claimed = descriptor.clone();
            claimed.stamp();

            if self
                .store
                .cas_put(&key, &claimed.encode()?, PutCondition::Absent)
                .await?
            {
                tracing::info!(
                    "claimed node id {} for {} {} (attempt {})",
                    node_id,
                    claimed.local_ip,
                    claimed.local_path,
                    attempt
                );
                return Ok(NodeClaim {
                    node_id,
                    key,
                    recovered: false,
                    descriptor: claimed,
                });
            }

            tracing::debug!("node id {} taken concurrently, rescanning", node_id);
        }

        Err(WardenError::NodeIdExhausted {
            attempts: self.retry_count,
        })
    }

    async fn try_hold(&self, listed: &KvPair, claimed: &mut IdentityDescriptor) -> Result<bool> {
        let condition = match self.store.get(&listed.key).await? {
            None => PutCondition::Absent,
            Some(current) if current.revision != listed.revision => return Ok(false),
            Some(_) => PutCondition::Revision(listed.revision),
        };

        claimed.stamp();
        self.store
            .cas_put(&listed.key, &claimed.encode()?, condition)
            .await
    }
}

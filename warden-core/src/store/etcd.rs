use crate::error::Result;
use crate::store::{IdentityStore, KvPair, PutCondition};
use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, GetOptions, KeyValue, Txn, TxnOp};

/// etcd-backed identity store
///
/// Compare-and-swap maps onto a single transaction: `create_revision == 0`
/// for create-if-absent, `mod_revision == r` for update-if-unchanged.
pub struct EtcdIdentityStore {
    client: Client,
}

impl EtcdIdentityStore {
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let client = Client::connect(endpoints, None).await?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn to_pair(kv: &KeyValue) -> KvPair {
    KvPair {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
        revision: kv.mod_revision(),
    }
}

#[async_trait]
impl IdentityStore for EtcdIdentityStore {
    async fn get(&self, key: &str) -> Result<Option<KvPair>> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await?;

        Ok(resp.kvs().first().map(to_pair))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        Ok(resp.kvs().iter().map(to_pair).collect())
    }

    async fn cas_put(&self, key: &str, value: &[u8], condition: PutCondition) -> Result<bool> {
        let compare = match condition {
            PutCondition::Absent => Compare::create_revision(key, CompareOp::Equal, 0),
            PutCondition::Revision(revision) => {
                Compare::mod_revision(key, CompareOp::Equal, revision)
            }
        };

        let txn = Txn::new()
            .when(vec![compare])
            .and_then(vec![TxnOp::put(key, value.to_vec(), None)]);

        let mut client = self.client.clone();
        let resp = client.txn(txn).await?;

        Ok(resp.succeeded())
    }
}

//! etcd-backed `KvStore`. TTLs map to per-key leases; the NX
//! primitive and list updates go through transactions compared on
//! key revisions so concurrent writers cannot interleave.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use etcd_client::{Client, Compare, CompareOp, GetOptions, PutOptions, Txn, TxnOp};
use tracing::info;

use micra_core::{MicraError, Result};

use crate::kv::{KvStore, pattern_to_regex};

pub struct EtcdKvStore {
    client: Client,
    /// Lease currently backing each key, so value updates keep the
    /// key's TTL.
    leases: DashMap<String, i64>,
}

fn store_err(e: etcd_client::Error) -> MicraError {
    MicraError::Store(e.to_string())
}

fn ttl_secs(ttl: Duration) -> i64 {
    ttl.as_secs().max(1) as i64
}

impl EtcdKvStore {
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let client = Client::connect(endpoints, None).await.map_err(store_err)?;
        info!("Connected to etcd at {:?}", endpoints);
        Ok(Self {
            client,
            leases: DashMap::new(),
        })
    }

    async fn grant(&self, ttl: Duration) -> Result<i64> {
        let mut client = self.client.clone();
        let lease = client
            .lease_grant(ttl_secs(ttl), None)
            .await
            .map_err(store_err)?;
        Ok(lease.id())
    }

    fn put_options(&self, key: &str, lease: Option<i64>) -> PutOptions {
        let lease = lease.or_else(|| self.leases.get(key).map(|l| *l));
        match lease {
            Some(id) => PutOptions::new().with_lease(id),
            None => PutOptions::new(),
        }
    }

    async fn fetch(&self, key: &str) -> Result<Option<(String, i64)>> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await.map_err(store_err)?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| {
                Ok::<_, MicraError>((
                    kv.value_str().map_err(store_err)?.to_string(),
                    kv.mod_revision(),
                ))
            })
            .transpose()?)
    }

    /// Compare-and-swap a whole-list value; retries on revision races.
    async fn swap_list<F>(&self, key: &str, mut apply: F) -> Result<(Vec<String>, Vec<String>)>
    where
        F: FnMut(Vec<String>) -> (Vec<String>, Vec<String>),
    {
        loop {
            let current = self.fetch(key).await?;
            let (list, revision) = match &current {
                Some((value, revision)) => (
                    serde_json::from_str::<Vec<String>>(value).unwrap_or_default(),
                    Some(*revision),
                ),
                None => (Vec::new(), None),
            };

            let (next, taken) = apply(list);
            let serialized = serde_json::to_string(&next)?;
            let compare = match revision {
                Some(revision) => Compare::mod_revision(key, CompareOp::Equal, revision),
                None => Compare::create_revision(key, CompareOp::Equal, 0),
            };
            let txn = Txn::new().when(vec![compare]).and_then(vec![TxnOp::put(
                key,
                serialized,
                Some(self.put_options(key, None)),
            )]);

            let mut client = self.client.clone();
            let resp = client.txn(txn).await.map_err(store_err)?;
            if resp.succeeded() {
                return Ok((next, taken));
            }
        }
    }
}

#[async_trait]
impl KvStore for EtcdKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.fetch(key).await?.map(|(value, _)| value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let lease = match ttl {
            Some(ttl) => {
                let id = self.grant(ttl).await?;
                self.leases.insert(key.to_string(), id);
                Some(id)
            }
            None => {
                self.leases.remove(key);
                None
            }
        };
        let mut client = self.client.clone();
        client
            .put(key, value, Some(self.put_options(key, lease)))
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let lease = match ttl {
            Some(ttl) => Some(self.grant(ttl).await?),
            None => None,
        };
        let options = match lease {
            Some(id) => Some(PutOptions::new().with_lease(id)),
            None => None,
        };
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, value, options)]);
        let mut client = self.client.clone();
        let resp = client.txn(txn).await.map_err(store_err)?;
        if resp.succeeded()
            && let Some(id) = lease
        {
            self.leases.insert(key.to_string(), id);
        }
        Ok(resp.succeeded())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let Some((value, revision)) = self.fetch(key).await? else {
            self.leases.remove(key);
            return Ok(false);
        };
        let lease = self.grant(ttl).await?;
        let txn = Txn::new()
            .when(vec![Compare::mod_revision(key, CompareOp::Equal, revision)])
            .and_then(vec![TxnOp::put(
                key,
                value,
                Some(PutOptions::new().with_lease(lease)),
            )]);
        let mut client = self.client.clone();
        let resp = client.txn(txn).await.map_err(store_err)?;
        if resp.succeeded() {
            self.leases.insert(key.to_string(), lease);
        }
        // A lost race still means the key is alive.
        Ok(true)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        let mut removed = 0u64;
        let mut client = self.client.clone();
        for key in keys {
            let resp = client.delete(key.as_str(), None).await.map_err(store_err)?;
            removed += resp.deleted() as u64;
            self.leases.remove(key);
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.fetch(key).await?.is_some())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let prefix: String = pattern.chars().take_while(|c| *c != '*').collect();
        let re = pattern_to_regex(pattern)?;
        let mut client = self.client.clone();
        let resp = client
            .get(
                prefix.as_str(),
                Some(GetOptions::new().with_prefix().with_keys_only()),
            )
            .await
            .map_err(store_err)?;
        let mut matched = Vec::new();
        for kv in resp.kvs() {
            let key = kv.key_str().map_err(store_err)?;
            if re.is_match(key) {
                matched.push(key.to_string());
            }
        }
        matched.sort();
        Ok(matched)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64> {
        let value = value.to_string();
        let (list, _) = self
            .swap_list(key, move |mut list| {
                list.push(value.clone());
                (list, Vec::new())
            })
            .await?;
        Ok(list.len() as u64)
    }

    async fn lpop(&self, key: &str, count: usize) -> Result<Vec<String>> {
        if !self.exists(key).await? {
            return Ok(Vec::new());
        }
        let (_, taken) = self
            .swap_list(key, move |mut list| {
                let take = count.min(list.len());
                let taken: Vec<String> = list.drain(..take).collect();
                (list, taken)
            })
            .await?;
        Ok(taken)
    }
}

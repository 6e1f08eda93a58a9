//! In-memory `KvStore` backend. One instance shared by several
//! runtime components behaves like a single external store, which is
//! what the standalone deployment and the test suites run on.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use micra_core::Result;

use crate::kv::{KvStore, pattern_to_regex};

#[derive(Debug, Clone)]
enum Stored {
    Text(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Stored,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Reference in-memory backend with lazy TTL eviction.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, Entry>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    fn live_entry(&self, key: &str) -> Option<Entry> {
        let entry = self.entries.get(key)?;
        if entry.expired() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.clone())
    }

    fn deadline(ttl: Option<Duration>) -> Option<Instant> {
        ttl.map(|ttl| Instant::now() + ttl)
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.live_entry(key).and_then(|e| match e.value {
            Stored::Text(s) => Some(s),
            Stored::List(_) => None,
        }))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Stored::Text(value.to_string()),
                expires_at: Self::deadline(ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        // Entry-based to keep check-and-set atomic per key.
        let fresh = Entry {
            value: Stored::Text(value.to_string()),
            expires_at: Self::deadline(ttl),
        };
        use dashmap::mapref::entry::Entry as MapEntry;
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().expired() {
                    occupied.insert(fresh);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(false);
        };
        if entry.expired() {
            drop(entry);
            self.entries.remove(key);
            return Ok(false);
        }
        entry.expires_at = Some(Instant::now() + ttl);
        Ok(true)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        let mut removed = 0u64;
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(key)
                && !entry.expired()
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.live_entry(key).is_some())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let re = pattern_to_regex(pattern)?;
        let mut matched = Vec::new();
        for item in self.entries.iter() {
            if !item.value().expired() && re.is_match(item.key()) {
                matched.push(item.key().clone());
            }
        }
        matched.sort();
        Ok(matched)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64> {
        let mut slot = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Stored::List(VecDeque::new()),
            expires_at: None,
        });
        if slot.expired() {
            *slot = Entry {
                value: Stored::List(VecDeque::new()),
                expires_at: None,
            };
        }
        match &mut slot.value {
            Stored::List(list) => {
                list.push_back(value.to_string());
                Ok(list.len() as u64)
            }
            Stored::Text(_) => Err(micra_core::MicraError::Store(format!(
                "key [{}] holds a scalar, not a list",
                key
            ))),
        }
    }

    async fn lpop(&self, key: &str, count: usize) -> Result<Vec<String>> {
        let Some(mut slot) = self.entries.get_mut(key) else {
            return Ok(Vec::new());
        };
        if slot.expired() {
            drop(slot);
            self.entries.remove(key);
            return Ok(Vec::new());
        }
        match &mut slot.value {
            Stored::List(list) => {
                let take = count.min(list.len());
                Ok(list.drain(..take).collect())
            }
            Stored::Text(_) => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let store = MemoryKvStore::new();
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(store.exists("k").await.unwrap());
        assert_eq!(store.delete(&["k".to_string()]).await.unwrap(), 1);
        assert!(store.get("k").await.unwrap().is_none());
        assert_eq!(store.delete(&["k".to_string()]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ttl_expires_keys() {
        let store = MemoryKvStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(store.exists("k").await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!store.exists("k").await.unwrap());
        assert!(!store.expire("k", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn expire_renews_live_key() {
        let store = MemoryKvStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(store.expire("k", Duration::from_secs(5)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn set_nx_only_first_wins() {
        let store = MemoryKvStore::new();
        assert!(store.set_nx("m", "a", None).await.unwrap());
        assert!(!store.set_nx("m", "b", None).await.unwrap());
        assert_eq!(store.get("m").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn set_nx_after_expiry_wins() {
        let store = MemoryKvStore::new();
        assert!(
            store
                .set_nx("m", "a", Some(Duration::from_millis(20)))
                .await
                .unwrap()
        );
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.set_nx("m", "b", None).await.unwrap());
        assert_eq!(store.get("m").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn list_push_pop_fifo() {
        let store = MemoryKvStore::new();
        assert_eq!(store.rpush("q", "1").await.unwrap(), 1);
        assert_eq!(store.rpush("q", "2").await.unwrap(), 2);
        assert_eq!(store.rpush("q", "3").await.unwrap(), 3);
        assert_eq!(store.lpop("q", 2).await.unwrap(), vec!["1", "2"]);
        assert_eq!(store.lpop("q", 5).await.unwrap(), vec!["3"]);
        assert!(store.lpop("q", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn keys_pattern_filtering() {
        let store = MemoryKvStore::new();
        store.set("{$a$}{$1$}", "x", None).await.unwrap();
        store.set("{$a$}{$2$}", "x", None).await.unwrap();
        store.set("{$b$}{$1$}", "x", None).await.unwrap();
        let keys = store.keys("{$a$}{$*$}").await.unwrap();
        assert_eq!(keys, vec!["{$a$}{$1$}", "{$a$}{$2$}"]);
    }
}

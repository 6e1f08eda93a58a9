//! Remote config store contract plus a reference implementation over
//! the shared KV store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use micra_core::Result;

use crate::kv::KvStore;

pub const DEFAULT_CONFIG_GROUP: &str = "sys";

/// Remote/central config document store.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Fetch a document; `None` when the key does not exist.
    async fn get_config(
        &self,
        data_id: &str,
        group: Option<&str>,
        timeout: Duration,
    ) -> Result<Option<String>>;

    async fn set_config(
        &self,
        data_id: &str,
        content: &str,
        group: Option<&str>,
        content_type: &str,
        timeout: Duration,
    ) -> Result<()>;
}

/// Config store over the shared KV surface; documents live under
/// `{$group=config$}{$namespace$}{$group$}{$data_id$}`.
pub struct KvConfigStore {
    kv: Arc<dyn KvStore>,
    namespace: String,
}

impl KvConfigStore {
    pub fn new(kv: Arc<dyn KvStore>, namespace: impl Into<String>) -> Self {
        Self {
            kv,
            namespace: namespace.into(),
        }
    }

    fn key(&self, data_id: &str, group: Option<&str>) -> String {
        format!(
            "{{$group=config$}}{{${}$}}{{${}$}}{{${}$}}",
            self.namespace,
            group.unwrap_or(DEFAULT_CONFIG_GROUP),
            data_id
        )
    }
}

#[async_trait]
impl ConfigStore for KvConfigStore {
    async fn get_config(
        &self,
        data_id: &str,
        group: Option<&str>,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let key = self.key(data_id, group);
        tokio::time::timeout(timeout, self.kv.get(&key))
            .await
            .map_err(|_| micra_core::MicraError::Timeout(format!("get config [{}]", data_id)))?
    }

    async fn set_config(
        &self,
        data_id: &str,
        content: &str,
        group: Option<&str>,
        _content_type: &str,
        timeout: Duration,
    ) -> Result<()> {
        let key = self.key(data_id, group);
        tokio::time::timeout(timeout, self.kv.set(&key, content, None))
            .await
            .map_err(|_| micra_core::MicraError::Timeout(format!("set config [{}]", data_id)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKvStore;

    #[tokio::test]
    async fn roundtrip_with_namespaced_key() {
        let kv = Arc::new(MemoryKvStore::new());
        let store = KvConfigStore::new(kv.clone(), "ns-dev");
        store
            .set_config("application.yaml", "a: 1", None, "yaml", Duration::from_secs(1))
            .await
            .unwrap();

        let fetched = store
            .get_config("application.yaml", None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(fetched.as_deref(), Some("a: 1"));

        // Key carries namespace and group coordinates.
        assert!(
            kv.exists("{$group=config$}{$ns-dev$}{$sys$}{$application.yaml$}")
                .await
                .unwrap()
        );

        let missing = store
            .get_config("other.yaml", Some("app"), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(missing.is_none());
    }
}

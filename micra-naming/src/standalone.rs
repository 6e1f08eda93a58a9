//! Standalone naming registry over the shared KV store. Instances
//! live as TTL'd JSON documents; a dedicated heartbeat worker renews
//! every registered instance of this process in parallel each tick,
//! and subscription mirrors refresh in the background.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use micra_core::Result;
use micra_core::instance::Instance;
use micra_core::service::DEFAULT_GROUP;
use micra_store::KvStore;

use crate::NamingRegistry;
use crate::select::pick_instance;

/// Liveness parameters carried with every registration so the
/// registry side can enforce them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvNamingConfig {
    /// Seconds between heartbeat renewals.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: f64,
    /// Instance counts as unhealthy once no heartbeat arrived for
    /// this many seconds.
    #[serde(default = "default_unhealthy_after")]
    pub unhealthy_after: f64,
    /// Instance document is dropped after this many seconds without
    /// a heartbeat.
    #[serde(default = "default_delete_after")]
    pub delete_after: f64,
}

fn default_heartbeat_interval() -> f64 {
    3.0
}

fn default_unhealthy_after() -> f64 {
    6.0
}

fn default_delete_after() -> f64 {
    9.0
}

impl Default for KvNamingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            unhealthy_after: default_unhealthy_after(),
            delete_after: default_delete_after(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct InstanceDoc {
    #[serde(flatten)]
    instance: Instance,
    last_heartbeat_ms: i64,
    heartbeat_interval: f64,
    unhealthy_after: f64,
    delete_after: f64,
}

impl InstanceDoc {
    fn is_healthy(&self, now_ms: i64) -> bool {
        let age = (now_ms - self.last_heartbeat_ms) as f64 / 1000.0;
        self.instance.healthy && age <= self.unhealthy_after
    }
}

fn instance_key(namespace: &str, group: &str, service: &str, addr: &str) -> String {
    format!(
        "{{$group=naming$}}{{${}$}}{{${}$}}{{${}$}}{{${}$}}",
        namespace, group, service, addr
    )
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct Subscription {
    cache: Arc<ArcSwap<Vec<Instance>>>,
    task: JoinHandle<()>,
}

pub struct KvNamingRegistry {
    kv: Arc<dyn KvStore>,
    namespace: String,
    cluster_name: Option<String>,
    config: KvNamingConfig,
    /// KV key → document renewed by the heartbeat worker.
    registered: Arc<DashMap<String, InstanceDoc>>,
    subscriptions: DashMap<String, Subscription>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl KvNamingRegistry {
    /// Construct and start the heartbeat worker; requires a running
    /// runtime. `cluster_name` is the cluster this application
    /// instance belongs to; registered instances are stamped with it.
    pub fn new(
        kv: Arc<dyn KvStore>,
        namespace: impl Into<String>,
        cluster_name: Option<String>,
        config: KvNamingConfig,
    ) -> Self {
        let registered: Arc<DashMap<String, InstanceDoc>> = Arc::new(DashMap::new());
        let heartbeat = spawn_heartbeat(Arc::clone(&kv), Arc::clone(&registered), config.clone());
        Self {
            kv,
            namespace: namespace.into(),
            cluster_name,
            config,
            registered,
            subscriptions: DashMap::new(),
            heartbeat_task: Mutex::new(Some(heartbeat)),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn cluster_name(&self) -> Option<&str> {
        self.cluster_name.as_deref()
    }

    fn group_of(group_name: Option<&str>) -> &str {
        group_name.unwrap_or(DEFAULT_GROUP)
    }

    fn subscribe_key(service_name: &str, group: &str) -> String {
        format!("{}@@{}", group, service_name)
    }

    fn service_pattern(&self, group: &str, service: &str) -> String {
        instance_key(&self.namespace, group, service, "*")
    }

    async fn read_docs(&self, group: &str, service: &str) -> Result<Vec<InstanceDoc>> {
        let keys = self.kv.keys(&self.service_pattern(group, service)).await?;
        let mut docs = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(raw) = self.kv.get(&key).await?
                && let Ok(doc) = serde_json::from_str::<InstanceDoc>(&raw)
            {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    fn mirror(&self, service_name: &str, group: &str) -> Option<Arc<Vec<Instance>>> {
        self.subscriptions
            .get(&Self::subscribe_key(service_name, group))
            .map(|s| s.cache.load_full())
    }

    /// Stop the heartbeat worker and every subscription refresher.
    pub fn shutdown(&self) {
        if let Some(task) = self.heartbeat_task.lock().unwrap().take() {
            task.abort();
        }
        let keys: Vec<String> = self.subscriptions.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, sub)) = self.subscriptions.remove(&key) {
                sub.task.abort();
            }
        }
    }
}

impl Drop for KvNamingRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_heartbeat(
    kv: Arc<dyn KvStore>,
    registered: Arc<DashMap<String, InstanceDoc>>,
    config: KvNamingConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs_f64(config.heartbeat_interval));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;

            let now = now_ms();
            let renewals: Vec<(String, String, Duration)> = registered
                .iter_mut()
                .map(|mut entry| {
                    entry.last_heartbeat_ms = now;
                    (
                        entry.key().clone(),
                        serde_json::to_string(entry.value()).unwrap_or_default(),
                        Duration::from_secs_f64(entry.delete_after),
                    )
                })
                .collect();

            // All renewals of one tick go out together.
            let sends = renewals.into_iter().map(|(key, doc, ttl)| {
                let kv = Arc::clone(&kv);
                async move {
                    if let Err(e) = kv.set(&key, &doc, Some(ttl)).await {
                        error!(key = %key, error = %e, "naming heartbeat renewal failed");
                    }
                }
            });
            join_all(sends).await;
        }
    })
}

#[async_trait]
impl NamingRegistry for KvNamingRegistry {
    async fn add_instance(
        &self,
        service_name: &str,
        ip: &str,
        port: u16,
        group_name: Option<&str>,
        metadata: Option<HashMap<String, Value>>,
        extras: HashMap<String, Value>,
    ) -> bool {
        let group = Self::group_of(group_name);
        let mut instance = Instance::new(ip, port);
        if let Some(metadata) = metadata {
            instance.metadata = metadata;
        }
        if let Some(weight) = extras.get("weight").and_then(|v| v.as_f64()) {
            instance.weight = weight;
        }
        if let Some(cluster_name) = &self.cluster_name
            && !instance.metadata.contains_key("cluster_name")
        {
            instance
                .metadata
                .insert("cluster_name".to_string(), Value::String(cluster_name.clone()));
        }

        let doc = InstanceDoc {
            instance,
            last_heartbeat_ms: now_ms(),
            heartbeat_interval: extras
                .get("heartbeat_interval")
                .and_then(|v| v.as_f64())
                .unwrap_or(self.config.heartbeat_interval),
            unhealthy_after: extras
                .get("unhealthy_after")
                .and_then(|v| v.as_f64())
                .unwrap_or(self.config.unhealthy_after),
            delete_after: extras
                .get("delete_after")
                .and_then(|v| v.as_f64())
                .unwrap_or(self.config.delete_after),
        };

        let key = instance_key(
            &self.namespace,
            group,
            service_name,
            &doc.instance.addr(),
        );
        let serialized = match serde_json::to_string(&doc) {
            Ok(s) => s,
            Err(e) => {
                error!(service = %service_name, error = %e, "instance doc encode failed");
                return false;
            }
        };
        let ttl = Duration::from_secs_f64(doc.delete_after);
        match self.kv.set(&key, &serialized, Some(ttl)).await {
            Ok(()) => {
                info!(service = %service_name, group = %group, addr = %doc.instance.addr(), "instance registered");
                self.registered.insert(key, doc);
                true
            }
            Err(e) => {
                error!(service = %service_name, error = %e, "instance register failed");
                false
            }
        }
    }

    async fn remove_instance(
        &self,
        service_name: &str,
        group_name: Option<&str>,
        ip: Option<&str>,
        port: Option<u16>,
    ) -> bool {
        let group = Self::group_of(group_name);
        let keys = match (ip, port) {
            (Some(ip), Some(port)) => vec![instance_key(
                &self.namespace,
                group,
                service_name,
                &format!("{}:{}", ip, port),
            )],
            _ => match self.kv.keys(&self.service_pattern(group, service_name)).await {
                Ok(keys) => keys,
                Err(e) => {
                    error!(service = %service_name, error = %e, "instance listing for removal failed");
                    return false;
                }
            },
        };

        // Drop the heartbeat schedule before the registry entry so a
        // tick cannot resurrect a removed instance.
        for key in &keys {
            self.registered.remove(key);
        }
        match self.kv.delete(&keys).await {
            Ok(_) => {
                info!(service = %service_name, group = %group, removed = keys.len(), "instance deregistered");
                true
            }
            Err(e) => {
                error!(service = %service_name, error = %e, "instance deregister failed");
                false
            }
        }
    }

    async fn list_instance(
        &self,
        service_name: &str,
        group_name: Option<&str>,
        healthy_only: bool,
    ) -> Result<Vec<Instance>> {
        let group = Self::group_of(group_name);
        let now = now_ms();
        let mut instances = Vec::new();
        for doc in self.read_docs(group, service_name).await? {
            let healthy = doc.is_healthy(now);
            if healthy_only && !healthy {
                continue;
            }
            let mut instance = doc.instance;
            instance.healthy = healthy;
            instances.push(instance);
        }
        Ok(instances)
    }

    async fn get_instance(
        &self,
        service_name: &str,
        group_name: Option<&str>,
        healthy_only: bool,
    ) -> Result<Option<Instance>> {
        let group = Self::group_of(group_name);

        // Mirror first; an empty mirror falls through to the registry.
        if let Some(snapshot) = self.mirror(service_name, group)
            && !snapshot.is_empty()
        {
            if let Some(instance) = pick_instance(&snapshot, healthy_only) {
                return Ok(Some(instance));
            }
        }

        let instances = self.list_instance(service_name, Some(group), false).await?;
        Ok(pick_instance(&instances, healthy_only))
    }

    async fn add_subscribe(
        &self,
        service_name: &str,
        group_name: Option<&str>,
        interval: Duration,
    ) {
        let group = Self::group_of(group_name).to_string();
        let key = Self::subscribe_key(service_name, &group);
        if self.subscriptions.contains_key(&key) {
            return;
        }

        let cache: Arc<ArcSwap<Vec<Instance>>> = Arc::new(ArcSwap::from_pointee(Vec::new()));
        let kv = Arc::clone(&self.kv);
        let namespace = self.namespace.clone();
        let service = service_name.to_string();
        let cache_for_task = Arc::clone(&cache);

        debug!(service = %service, group = %group, "subscription added");
        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let pattern = instance_key(&namespace, &group, &service, "*");
                let keys = match kv.keys(&pattern).await {
                    Ok(keys) => keys,
                    Err(e) => {
                        warn!(service = %service, error = %e, "subscription refresh failed");
                        continue;
                    }
                };
                let now = now_ms();
                let mut snapshot = Vec::with_capacity(keys.len());
                for key in keys {
                    if let Ok(Some(raw)) = kv.get(&key).await
                        && let Ok(doc) = serde_json::from_str::<InstanceDoc>(&raw)
                    {
                        let healthy = doc.is_healthy(now);
                        let mut instance = doc.instance;
                        instance.healthy = healthy;
                        snapshot.push(instance);
                    }
                }
                cache_for_task.store(Arc::new(snapshot));
            }
        });

        self.subscriptions.insert(key, Subscription { cache, task });
    }

    async fn remove_subscribe(&self, service_name: &str, group_name: Option<&str>) {
        let group = Self::group_of(group_name);
        if let Some((_, sub)) = self
            .subscriptions
            .remove(&Self::subscribe_key(service_name, group))
        {
            sub.task.abort();
        }
    }
}

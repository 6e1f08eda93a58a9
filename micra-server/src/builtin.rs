//! Built-in plugin builders and extension factories the starter wires
//! from configuration: formatters, interface adapters, serial
//! numbers, KV stores, naming registries, tracers and cluster
//! coordinators.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use micra_caller::{
    HttpCallerFormatter, HttpFormatterConfig, MemorySerialNumbers, StandaloneSerialNumbers,
    StdEnvelopeCallerFormatter, StdEnvelopeConfig,
};
use micra_cluster::{ClusterConfig, ClusterCoordinator, ClusterHooks};
use micra_core::plugin::{AdapterEntry, AdapterKind, PluginDescriptor, PluginRegistry};
use micra_core::{MicraError, Result};
use micra_naming::{KvNamingConfig, KvNamingRegistry, NamingRegistry};
use micra_store::{KvStore, MemoryKvStore};
use micra_trace::{LogReporter, NoopReporter, SpanReporter, Tracer, TracerOptions};
use micra_web::{
    CommonInfLogging, CommonServerFormatter, RequiredHeadCheckConfig, RequiredHeadInfCheck,
    StdEnvelopeServerFormatter,
};

/// Register the built-in adapter builders. Applications add their own
/// handlers, tasks and adapters to the same registry before boot.
pub fn register_builtin_adapters(registry: &PluginRegistry) {
    registry.register("common_server_formater", |_, _, _| {
        Ok(AdapterEntry::ServerFormatter(Arc::new(CommonServerFormatter)))
    });

    registry.register("std_envelope_server_formater", |ctx, _, _| {
        Ok(AdapterEntry::ServerFormatter(Arc::new(
            StdEnvelopeServerFormatter::new(ctx.identity.clone()),
        )))
    });

    registry.register("http_common_caller_formater", |_, _, descriptor| {
        Ok(AdapterEntry::CallerFormatter(Arc::new(
            HttpCallerFormatter::new(HttpFormatterConfig::from_value(&descriptor.init)),
        )))
    });

    registry.register("std_envelope_caller_formater", |ctx, manager, descriptor| {
        let config = StdEnvelopeConfig::from_value(&descriptor.init);
        let serial_id = descriptor
            .init
            .get("serial_number_adapter_id")
            .and_then(|v| v.as_str())
            .unwrap_or("serial_number");
        let serial = manager
            .get(AdapterKind::SerialNumber, serial_id)
            .and_then(|e| e.as_serial_number())
            .ok_or_else(|| {
                MicraError::AdapterLoadFailure(format!(
                    "serial number adapter [{}] is not loaded",
                    serial_id
                ))
            })?;
        Ok(AdapterEntry::CallerFormatter(Arc::new(
            StdEnvelopeCallerFormatter::new(config, ctx.identity.clone(), serial),
        )))
    });

    registry.register("common_inf_logging", |ctx, _, descriptor| {
        Ok(AdapterEntry::InfLogging(Arc::new(CommonInfLogging::new(
            ctx.logger(descriptor),
        ))))
    });

    registry.register("required_head_inf_check", |_, _, descriptor| {
        Ok(AdapterEntry::InfCheck(Arc::new(RequiredHeadInfCheck::new(
            RequiredHeadCheckConfig::from_value(&descriptor.init),
        ))))
    });

    registry.register("memory_serial_number", |_, _, _| {
        Ok(AdapterEntry::SerialNumber(Arc::new(MemorySerialNumbers::new())))
    });

    registry.register("standalone_serial_number", |_, _, descriptor| {
        let data_path = descriptor
            .init
            .get("data_path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                MicraError::AdapterLoadFailure(
                    "standalone_serial_number needs [data_path]".to_string(),
                )
            })?;
        Ok(AdapterEntry::SerialNumber(Arc::new(
            StandaloneSerialNumbers::new(data_path)?,
        )))
    });
}

/// Shared KV store instances, keyed by the `id` in their config so
/// several adapters can coordinate through one store.
#[derive(Default)]
pub struct KvStores {
    stores: Mutex<HashMap<String, Arc<dyn KvStore>>>,
}

impl KvStores {
    pub fn new() -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Pre-seed a store under an id (tests share a memory store this
    /// way).
    pub fn insert(&self, id: &str, store: Arc<dyn KvStore>) {
        self.stores.lock().unwrap().insert(id.to_string(), store);
    }

    pub async fn get(&self, init: &Value) -> Result<Arc<dyn KvStore>> {
        let plugin = init
            .get("plugin")
            .and_then(|v| v.as_str())
            .unwrap_or("memory_kv");
        let id = init
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or(plugin)
            .to_string();

        if let Some(existing) = self.stores.lock().unwrap().get(&id) {
            return Ok(Arc::clone(existing));
        }

        let store: Arc<dyn KvStore> = match plugin {
            "memory_kv" => Arc::new(MemoryKvStore::new()),
            #[cfg(feature = "etcd")]
            "etcd_kv" => {
                let endpoints: Vec<String> = init
                    .get("endpoints")
                    .and_then(|v| {
                        serde_json::from_value::<Vec<String>>(v.clone()).ok()
                    })
                    .unwrap_or_else(|| vec!["http://127.0.0.1:2379".to_string()]);
                Arc::new(micra_store::etcd::EtcdKvStore::connect(&endpoints).await?)
            }
            other => return Err(MicraError::PluginNotFound(other.to_string())),
        };

        self.stores.lock().unwrap().insert(id, Arc::clone(&store));
        Ok(store)
    }
}

/// Build a naming registry from its descriptor. `namespace` and
/// `cluster_name` are the application-level defaults; the
/// descriptor's own values win.
pub async fn build_naming(
    kv_stores: &KvStores,
    descriptor: &PluginDescriptor,
    namespace: &str,
    cluster_name: Option<&str>,
) -> Result<Arc<dyn NamingRegistry>> {
    match descriptor.plugin.as_str() {
        "standalone_naming" => {
            let kv = kv_stores
                .get(descriptor.init.get("kv").unwrap_or(&Value::Null))
                .await?;
            let config: KvNamingConfig =
                serde_json::from_value(descriptor.init.clone()).unwrap_or_default();
            let namespace = descriptor
                .init
                .get("namespace")
                .and_then(|v| v.as_str())
                .unwrap_or(namespace);
            let cluster_name = descriptor
                .init
                .get("cluster_name")
                .and_then(|v| v.as_str())
                .or(cluster_name)
                .map(|s| s.to_string());
            Ok(Arc::new(KvNamingRegistry::new(
                kv,
                namespace,
                cluster_name,
                config,
            )))
        }
        other => Err(MicraError::PluginNotFound(other.to_string())),
    }
}

/// Build a tracer from its descriptor.
pub fn build_tracer(descriptor: &PluginDescriptor, app_name: &str) -> Result<Arc<Tracer>> {
    match descriptor.plugin.as_str() {
        "local_tracer" => {
            let reporter: Arc<dyn SpanReporter> = match descriptor
                .init
                .get("reporter")
                .and_then(|v| v.as_str())
                .unwrap_or("log")
            {
                "noop" => Arc::new(NoopReporter),
                _ => Arc::new(LogReporter),
            };
            let options: TracerOptions = descriptor
                .init
                .get("trace_options")
                .map(|v| serde_json::from_value(v.clone()).unwrap_or_default())
                .unwrap_or_default();
            Ok(Arc::new(Tracer::new(app_name, reporter, options)))
        }
        other => Err(MicraError::PluginNotFound(other.to_string())),
    }
}

/// Build a cluster coordinator from its descriptor; coordinates are
/// injected by the starter.
pub async fn build_cluster(
    kv_stores: &KvStores,
    descriptor: &PluginDescriptor,
    config: ClusterConfig,
    hooks: ClusterHooks,
) -> Result<Arc<ClusterCoordinator>> {
    match descriptor.plugin.as_str() {
        "kv_cluster" => {
            let kv = kv_stores
                .get(descriptor.init.get("kv").unwrap_or(&Value::Null))
                .await?;
            Ok(ClusterCoordinator::new(kv, config, hooks))
        }
        other => Err(MicraError::PluginNotFound(other.to_string())),
    }
}

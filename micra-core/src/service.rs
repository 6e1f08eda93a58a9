//! Service descriptors as configured in `services.yaml` and
//! `remoteServices.yaml`, plus the resolved-instance shape the caller
//! works with.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::message::{CallArgs, Headers, StdRequest, StdResponse};
use crate::plugin::PluginDescriptor;

pub const DEFAULT_GROUP: &str = "DEFAULT_GROUP";

/// Boxed future returned by service handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<StdResponse>> + Send>>;

/// A service handler: `(std_request, args/kwargs) -> std_response`.
pub type HandlerFn = Arc<dyn Fn(StdRequest, CallArgs) -> HandlerFuture + Send + Sync>;

/// Naming-related fragment of a hosted service config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceNamingConfig {
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Per-registry extras (heartbeat interval, liveness timeouts…)
    /// keyed by naming adapter id.
    #[serde(default)]
    pub naming_config: HashMap<String, Value>,
}

/// Per-web-server settings of a hosted service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceWebConfig {
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
}

fn default_methods() -> Vec<String> {
    vec!["GET".to_string()]
}

impl Default for ServiceWebConfig {
    fn default() -> Self {
        Self {
            methods: default_methods(),
        }
    }
}

/// A hosted service entry from `services.yaml`, after common-config
/// merging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Filled with the entry key by the loader.
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub uri: String,
    /// Handler reference resolved through the plugin registry.
    #[serde(default)]
    pub plugin: Option<PluginDescriptor>,
    #[serde(default = "default_true")]
    pub enable_service: bool,
    #[serde(default)]
    pub enable_tracer: bool,
    #[serde(default)]
    pub trace_options: Option<Value>,
    #[serde(default)]
    pub allow_local_call: bool,
    #[serde(default, rename = "formater")]
    pub formatter: Option<String>,
    #[serde(default)]
    pub inf_check: Option<String>,
    #[serde(default)]
    pub inf_logging: Option<String>,
    #[serde(default)]
    pub naming: Option<ServiceNamingConfig>,
    #[serde(default)]
    pub web_server: HashMap<String, ServiceWebConfig>,
    #[serde(default)]
    pub kv_type_trans_mapping: Option<HashMap<String, String>>,
    #[serde(default)]
    pub common_config: Option<Vec<String>>,
    #[serde(default)]
    pub sys_id: Option<String>,
    #[serde(default)]
    pub module_id: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for ServiceConfig {
    fn default() -> Self {
        serde_json::from_value(Value::Object(serde_json::Map::new())).expect("defaults")
    }
}

/// A remote callee entry from `remoteServices.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteServiceConfig {
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub network: Option<HashMap<String, Value>>,
    #[serde(default)]
    pub headers: Option<Headers>,
    #[serde(default = "default_true")]
    pub local_call_first: bool,
    #[serde(default)]
    pub is_fixed_config: bool,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub naming: Option<String>,
    #[serde(default = "default_subscribe_interval")]
    pub naming_subscribe_interval: f64,
    #[serde(default, rename = "formater")]
    pub formatter: Option<String>,
    #[serde(default)]
    pub enable_tracer: bool,
    #[serde(default = "default_inject_format")]
    pub tracer_inject_format: String,
    #[serde(default)]
    pub inf_logging: Option<String>,
    #[serde(default)]
    pub common_config: Option<Vec<String>>,
}

fn default_subscribe_interval() -> f64 {
    5.0
}

fn default_inject_format() -> String {
    "http_headers".to_string()
}

impl Default for RemoteServiceConfig {
    fn default() -> Self {
        Self {
            service_name: None,
            group_name: None,
            protocol: None,
            uri: None,
            network: None,
            headers: None,
            local_call_first: true,
            is_fixed_config: false,
            metadata: HashMap::new(),
            ip: None,
            port: None,
            naming: None,
            naming_subscribe_interval: default_subscribe_interval(),
            formatter: None,
            enable_tracer: false,
            tracer_inject_format: default_inject_format(),
            inf_logging: None,
            common_config: None,
        }
    }
}

impl RemoteServiceConfig {
    pub fn group(&self) -> &str {
        self.group_name.as_deref().unwrap_or(DEFAULT_GROUP)
    }
}

/// A locally registered handler plus its registration fragment.
#[derive(Clone)]
pub struct LocalService {
    pub service_name: Option<String>,
    pub group_name: Option<String>,
    pub protocol: Option<String>,
    pub uri: Option<String>,
    pub metadata: HashMap<String, Value>,
    pub handler: HandlerFn,
}

/// Fully resolved call target: either the local handler or a remote
/// address, with defaults filled from instance metadata.
#[derive(Clone)]
pub struct ResolvedInstance {
    pub is_local: bool,
    pub handler: Option<HandlerFn>,
    pub protocol: Option<String>,
    pub uri: Option<String>,
    pub network: Option<HashMap<String, Value>>,
    pub headers: Option<Headers>,
    pub metadata: HashMap<String, Value>,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub formatter: Option<String>,
    pub enable_tracer: bool,
    pub tracer_inject_format: String,
    pub inf_logging: Option<String>,
}

impl std::fmt::Debug for ResolvedInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedInstance")
            .field("is_local", &self.is_local)
            .field("protocol", &self.protocol)
            .field("uri", &self.uri)
            .field("ip", &self.ip)
            .field("port", &self.port)
            .field("formatter", &self.formatter)
            .finish()
    }
}

/// Deep-merge yaml/json-like values: maps merge recursively, later
/// values win everywhere else.
pub fn merge_values(mut base: Value, over: Value) -> Value {
    match (&mut base, over) {
        (Value::Object(base_map), Value::Object(over_map)) => {
            for (k, v) in over_map {
                match base_map.remove(&k) {
                    Some(existing) => {
                        base_map.insert(k, merge_values(existing, v));
                    }
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
            base
        }
        (_, over) => over,
    }
}

/// Compute the effective config of one entry: deep-merge the listed
/// `common_config` fragments in order, then the entry's own map on
/// top.
pub fn apply_common_config(entry: Value, common: &HashMap<String, Value>) -> Value {
    let ids: Vec<String> = entry
        .get("common_config")
        .and_then(|v| v.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let mut merged = Value::Object(serde_json::Map::new());
    for id in &ids {
        if let Some(fragment) = common.get(id) {
            merged = merge_values(merged, fragment.clone());
        }
    }
    merge_values(merged, entry)
}

/// Arc-wrap a plain async handler function.
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(StdRequest, CallArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StdResponse>> + Send + 'static,
{
    Arc::new(move |req, call| Box::pin(f(req, call)))
}

//! Configuration file schemas: `configCenter.yaml`,
//! `application.yaml`, `adapters.yaml`, `services.yaml` /
//! `remoteServices.yaml`.

use std::collections::HashMap;
use std::path::Path;

use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MicraError, Result};
use crate::logger::LoggerConfig;
use crate::plugin::PluginDescriptor;
use crate::service::apply_common_config;

/// Generic `{plugin: …}` wrapper used by most adapter listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginEntry {
    pub plugin: PluginDescriptor,
}

/// One `tasks` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEntry {
    pub plugin: PluginDescriptor,
    #[serde(default)]
    pub args: Value,
}

/// One `web_servers` entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebServerEntry {
    #[serde(default)]
    pub plugin: Option<PluginDescriptor>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub logger: Option<String>,
    #[serde(default, rename = "server_formaters")]
    pub server_formatters: Vec<String>,
    #[serde(default)]
    pub init: Value,
}

/// `base_config` of `application.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseConfig {
    #[serde(default)]
    pub sys_id: String,
    #[serde(default)]
    pub module_id: String,
    #[serde(default)]
    pub server_id: String,
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub naming: Option<String>,
    #[serde(default)]
    pub tracer: Option<String>,
    #[serde(default)]
    pub cluster_adapter: Option<String>,
    #[serde(default)]
    pub default_web_server: Option<String>,
    #[serde(default, rename = "caller_formaters")]
    pub caller_formatters: Vec<String>,
    #[serde(default)]
    pub sys_logger: Option<String>,
    #[serde(default)]
    pub service_logger: Option<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub cluster_name: Option<String>,
    #[serde(default = "default_logs_path")]
    pub logs_path: String,
    #[serde(default)]
    pub after_server_start: Option<String>,
    #[serde(default)]
    pub before_server_stop: Option<String>,
}

fn default_app_name() -> String {
    "micra-app".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_namespace() -> String {
    "MicraService".to_string()
}

fn default_logs_path() -> String {
    "logs".to_string()
}

impl Default for BaseConfig {
    fn default() -> Self {
        serde_json::from_value(Value::Object(Default::default())).expect("defaults")
    }
}

/// `application.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub base_config: BaseConfig,
    #[serde(default)]
    pub loggers: HashMap<String, LoggerConfig>,
    #[serde(default)]
    pub namings: HashMap<String, PluginEntry>,
    #[serde(default, rename = "opentracings")]
    pub tracers: HashMap<String, PluginEntry>,
    #[serde(default)]
    pub clusters: HashMap<String, PluginEntry>,
    #[serde(default)]
    pub web_servers: HashMap<String, WebServerEntry>,
    #[serde(default, rename = "server_formaters")]
    pub server_formatters: HashMap<String, PluginEntry>,
    #[serde(default, rename = "caller_formaters")]
    pub caller_formatters: HashMap<String, PluginEntry>,
    #[serde(default)]
    pub inf_loggings: HashMap<String, PluginEntry>,
    #[serde(default)]
    pub inf_checks: HashMap<String, PluginEntry>,
    #[serde(default)]
    pub tasks: HashMap<String, TaskEntry>,
}

impl AppConfig {
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(MicraError::from)
    }
}

/// `base_config` of `configCenter.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CenterBaseConfig {
    #[serde(default)]
    pub env: Option<String>,
    #[serde(default = "default_config_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub prefix: Option<String>,
    /// Which `configs` entry backs the remote store; local files when
    /// absent.
    #[serde(default)]
    pub center_type: Option<String>,
    /// Milliseconds.
    #[serde(default = "default_timeout")]
    pub default_timeout: u64,
    /// `create` pushes local content up when a key is missing.
    #[serde(default)]
    pub not_existed: Option<String>,
    #[serde(default)]
    pub ignore_env_when_file_not_existed: bool,
}

fn default_config_namespace() -> String {
    "MicraConfig".to_string()
}

fn default_timeout() -> u64 {
    3000
}

impl Default for CenterBaseConfig {
    fn default() -> Self {
        serde_json::from_value(Value::Object(Default::default())).expect("defaults")
    }
}

/// One `data_file_mapping` entry of `configCenter.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataFileMapping {
    pub local_file: String,
    #[serde(default, rename = "type")]
    pub content_type: Option<String>,
}

/// `configCenter.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigCenterFile {
    #[serde(default)]
    pub base_config: CenterBaseConfig,
    #[serde(default)]
    pub data_file_mapping: HashMap<String, DataFileMapping>,
    #[serde(default)]
    pub configs: HashMap<String, PluginEntry>,
}

impl ConfigCenterFile {
    /// Load from yaml file, environment overrides applied on top
    /// (`MICRA_BASE_CONFIG__ENV`, …).
    pub fn load(path: &Path) -> Result<Self> {
        let figment = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("MICRA_").split("__"));
        figment
            .extract()
            .map_err(|e| MicraError::ConfigMissing(format!("{}: {}", path.display(), e)))
    }
}

/// One `adapters.yaml` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterFileEntry {
    pub adapter_type: String,
    pub plugin: PluginDescriptor,
}

/// `adapters.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdaptersFile {
    #[serde(default)]
    pub adapters: HashMap<String, AdapterFileEntry>,
}

impl AdaptersFile {
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(MicraError::from)
    }
}

/// `services.yaml` / `remoteServices.yaml` — entries stay untyped
/// until common-config merging has run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicesFile {
    #[serde(default)]
    pub services: HashMap<String, Value>,
    #[serde(default)]
    pub common_config: HashMap<String, Value>,
}

impl ServicesFile {
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(MicraError::from)
    }

    /// Deep-merge each service with its listed common-config
    /// fragments in order, the service's own map last.
    pub fn merged_entries(&self) -> HashMap<String, Value> {
        self.services
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    apply_common_config(entry.clone(), &self.common_config),
                )
            })
            .collect()
    }
}

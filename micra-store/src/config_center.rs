//! Config center: named documents fetched from local files under
//! `config/` or a remote store adapter, with typed decoding and an
//! in-memory cache that hands out owned copies.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tracing::info;

use micra_core::config::{CenterBaseConfig, ConfigCenterFile, DataFileMapping};
use micra_core::{MicraError, Result};

use crate::store::ConfigStore;

/// A decoded config document.
#[derive(Debug, Clone)]
pub enum ConfigContent {
    Text(String),
    Structured(Value),
}

impl ConfigContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ConfigContent::Text(s) => Some(s),
            ConfigContent::Structured(_) => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            ConfigContent::Structured(v) => Some(v),
            ConfigContent::Text(_) => None,
        }
    }
}

pub struct ConfigCenter {
    config_path: PathBuf,
    base: CenterBaseConfig,
    env: String,
    namespace: String,
    data_file_mapping: HashMap<String, DataFileMapping>,
    store: Option<Arc<dyn ConfigStore>>,
    text_cache: DashMap<String, String>,
    value_cache: DashMap<String, Value>,
}

impl ConfigCenter {
    /// Build from a parsed `configCenter.yaml`. The remote store
    /// adapter, when the file configures one, is created by the
    /// starter and passed in here.
    pub fn new(
        config_path: impl Into<PathBuf>,
        file: ConfigCenterFile,
        store: Option<Arc<dyn ConfigStore>>,
    ) -> Self {
        let env = file.base_config.env.clone().unwrap_or_default();
        let namespace = if env.is_empty() {
            file.base_config.namespace.clone()
        } else {
            format!("{}-{}", file.base_config.namespace, env)
        };
        if store.is_some() {
            info!(namespace = %namespace, "Config center using remote store");
        }
        Self {
            config_path: config_path.into(),
            base: file.base_config,
            env,
            namespace,
            data_file_mapping: file.data_file_mapping,
            store,
            text_cache: DashMap::new(),
            value_cache: DashMap::new(),
        }
    }

    pub fn env(&self) -> &str {
        &self.env
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn prefix(&self) -> &str {
        self.base.prefix.as_deref().unwrap_or("")
    }

    fn timeout(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(Duration::from_millis(self.base.default_timeout))
    }

    /// Fetch the raw document text.
    pub async fn get_config(
        &self,
        data_id: &str,
        group: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let Some(store) = &self.store else {
            return self.read_file(data_id);
        };

        let timeout = self.timeout(timeout);
        let prefixed = self.prefixed_data_id(data_id);
        match store.get_config(&prefixed, group, timeout).await? {
            Some(content) => Ok(content),
            None => {
                if self.base.not_existed.as_deref() == Some("create") {
                    // Seed the remote store from the local file.
                    let content = self.read_file(data_id)?;
                    store
                        .set_config(
                            &prefixed,
                            &content,
                            group,
                            &self.config_type(data_id),
                            timeout,
                        )
                        .await?;
                    Ok(content)
                } else {
                    Err(MicraError::ConfigMissing(format!(
                        "[dataid: {}] [group: {}] not found in config center",
                        prefixed,
                        group.unwrap_or("")
                    )))
                }
            }
        }
    }

    pub async fn set_config(
        &self,
        data_id: &str,
        content: &str,
        group: Option<&str>,
        content_type: &str,
        timeout: Option<Duration>,
    ) -> Result<()> {
        match &self.store {
            None => self.write_file(data_id, content),
            Some(store) => {
                let timeout = self.timeout(timeout);
                store
                    .set_config(
                        &self.prefixed_data_id(data_id),
                        content,
                        group,
                        content_type,
                        timeout,
                    )
                    .await
            }
        }
    }

    /// Fetch through the cache, decoding per `content_type`
    /// (`text`, `json`, `yaml`, `xml`). Returns owned copies so
    /// caller mutation cannot poison the cache.
    pub async fn get_cached(
        &self,
        data_id: &str,
        group: Option<&str>,
        timeout: Option<Duration>,
        content_type: &str,
    ) -> Result<ConfigContent> {
        if content_type == "text" {
            if let Some(cached) = self.text_cache.get(data_id) {
                return Ok(ConfigContent::Text(cached.clone()));
            }
            let content = self.get_config(data_id, group, timeout).await?;
            self.text_cache.insert(data_id.to_string(), content.clone());
            return Ok(ConfigContent::Text(content));
        }

        if let Some(cached) = self.value_cache.get(data_id) {
            return Ok(ConfigContent::Structured(cached.clone()));
        }
        let content = self.get_config(data_id, group, timeout).await?;
        let value = match content_type {
            "yaml" => Self::yaml_to_value(&content)?,
            "json" => Self::json_to_value(&content)?,
            "xml" => Self::xml_to_value(&content)?,
            other => {
                return Err(MicraError::Internal(format!(
                    "unsupported config content type [{}]",
                    other
                )));
            }
        };
        self.value_cache.insert(data_id.to_string(), value.clone());
        Ok(ConfigContent::Structured(value))
    }

    /// Shortcut for the dominant case: a yaml document as a value.
    pub async fn get_cached_yaml(&self, data_id: &str, group: Option<&str>) -> Result<Value> {
        Ok(self
            .get_cached(data_id, group, None, "yaml")
            .await?
            .into_value()
            .expect("yaml decodes to a structured value"))
    }

    // ── format converters ──

    pub fn yaml_to_value(content: &str) -> Result<Value> {
        serde_yaml::from_str(content).map_err(MicraError::from)
    }

    pub fn value_to_yaml(value: &Value) -> Result<String> {
        serde_yaml::to_string(value).map_err(MicraError::from)
    }

    pub fn json_to_value(content: &str) -> Result<Value> {
        serde_json::from_str(content).map_err(MicraError::from)
    }

    pub fn value_to_json(value: &Value) -> Result<String> {
        serde_json::to_string_pretty(value).map_err(MicraError::from)
    }

    /// Decode xml into a value; the single document root is dropped.
    pub fn xml_to_value(content: &str) -> Result<Value> {
        quick_xml::de::from_str(content)
            .map_err(|e| MicraError::Internal(format!("xml decode: {}", e)))
    }

    /// Encode a value as xml under `root_name`.
    pub fn value_to_xml(value: &Value, root_name: &str) -> String {
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>");
        write_xml_element(&mut out, root_name, value);
        out
    }

    // ── local file handling ──

    fn config_type(&self, data_id: &str) -> String {
        self.data_file_mapping
            .get(data_id)
            .and_then(|m| m.content_type.clone())
            .unwrap_or_else(|| "text".to_string())
    }

    fn prefixed_data_id(&self, data_id: &str) -> String {
        let prefix = self.prefix();
        if prefix.is_empty() {
            data_id.to_string()
        } else {
            format!("{}-{}", prefix, data_id)
        }
    }

    /// Resolve the backing file: mapped name or the data id itself,
    /// preferring the env-tagged variant (`name-env.ext`).
    fn local_file(&self, data_id: &str) -> PathBuf {
        let file_name = self
            .data_file_mapping
            .get(data_id)
            .map(|m| m.local_file.clone())
            .unwrap_or_else(|| data_id.to_string());
        let path = self.config_path.join(file_name);

        if self.env.is_empty() {
            return path;
        }

        let env_path = env_tagged_path(&path, &self.env);
        if !self.base.ignore_env_when_file_not_existed || env_path.exists() {
            env_path
        } else {
            path
        }
    }

    fn read_file(&self, data_id: &str) -> Result<String> {
        let path = self.local_file(data_id);
        std::fs::read_to_string(&path).map_err(|e| {
            MicraError::ConfigMissing(format!("[dataid: {}] {}: {}", data_id, path.display(), e))
        })
    }

    fn write_file(&self, data_id: &str, content: &str) -> Result<()> {
        let path = self.local_file(data_id);
        std::fs::write(&path, content).map_err(MicraError::from)
    }
}

fn env_tagged_path(path: &Path, env: &str) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tagged = match file_name.rfind('.') {
        Some(dot) => format!("{}-{}{}", &file_name[..dot], env, &file_name[dot..]),
        None => format!("{}-{}", file_name, env),
    };
    path.with_file_name(tagged)
}

fn write_xml_element(out: &mut String, name: &str, value: &Value) {
    match value {
        Value::Object(map) => {
            out.push_str(&format!("<{}>", name));
            for (key, child) in map {
                write_xml_element(out, key, child);
            }
            out.push_str(&format!("</{}>", name));
        }
        Value::Array(items) => {
            for item in items {
                write_xml_element(out, name, item);
            }
        }
        Value::Null => out.push_str(&format!("<{}/>", name)),
        scalar => {
            let text = match scalar {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push_str(&format!("<{}>{}</{}>", name, text, name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn env_tagged_path_inserts_before_extension() {
        assert_eq!(
            env_tagged_path(Path::new("/cfg/application.yaml"), "dev"),
            PathBuf::from("/cfg/application-dev.yaml")
        );
        assert_eq!(
            env_tagged_path(Path::new("/cfg/noext"), "dev"),
            PathBuf::from("/cfg/noext-dev")
        );
    }

    #[test]
    fn xml_roundtrip_drops_root() {
        let value = json!({"host": "127.0.0.1", "port": "8080"});
        let xml = ConfigCenter::value_to_xml(&value, "root");
        assert!(xml.contains("<host>127.0.0.1</host>"));
        let decoded = ConfigCenter::xml_to_value(&xml).unwrap();
        assert_eq!(decoded["host"], json!("127.0.0.1"));
        assert_eq!(decoded["port"], json!("8080"));
    }

    #[test]
    fn yaml_and_json_converters() {
        let value = ConfigCenter::yaml_to_value("a:\n  b: 1\n").unwrap();
        assert_eq!(value["a"]["b"], json!(1));
        let json_text = ConfigCenter::value_to_json(&value).unwrap();
        let back = ConfigCenter::json_to_value(&json_text).unwrap();
        assert_eq!(back, value);
        let yaml_text = ConfigCenter::value_to_yaml(&value).unwrap();
        assert!(yaml_text.contains("b: 1"));
    }
}

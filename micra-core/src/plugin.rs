//! Plugin factory registry. Adapter descriptors name a registered
//! builder instead of a module/class path; builders receive their
//! init config as structured data and produce a typed adapter entry.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapter::AdapterManager;
use crate::error::{MicraError, Result};
use crate::formatter::{
    CallerFormatter, InfCheck, InfLogging, SerialNumberProvider, ServerFormatter,
};
use crate::logger::LoggerManager;
use crate::service::HandlerFn;

/// Boxed future returned by background tasks.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// A named background task; receives its configured arguments.
pub type TaskFn = Arc<dyn Fn(Value) -> TaskFuture + Send + Sync>;

/// Adapter descriptor as written in the yaml configs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Registered factory id.
    pub plugin: String,
    /// Adapter-specific init config.
    #[serde(default)]
    pub init: Value,
    /// Logger to bind, resolved through the logger manager.
    #[serde(default)]
    pub logger_id: Option<String>,
    /// Skip instance caching when true.
    #[serde(default)]
    pub stand_alone: bool,
    /// Slash paths into `init` whose string values are rewritten from
    /// app-relative to absolute before the builder runs.
    #[serde(default)]
    pub convert_relative_paths: Vec<String>,
}

impl PluginDescriptor {
    pub fn named(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            ..Default::default()
        }
    }

    pub fn with_init(plugin: impl Into<String>, init: Value) -> Self {
        Self {
            plugin: plugin.into(),
            init,
            ..Default::default()
        }
    }
}

/// Adapter categories managed by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    ServerFormatter,
    CallerFormatter,
    InfLogging,
    InfCheck,
    SerialNumber,
    Handler,
    Task,
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::ServerFormatter => "server_formater",
            AdapterKind::CallerFormatter => "caller_formater",
            AdapterKind::InfLogging => "inf_logging",
            AdapterKind::InfCheck => "inf_check",
            AdapterKind::SerialNumber => "serial_number",
            AdapterKind::Handler => "handler",
            AdapterKind::Task => "task",
        }
    }

    pub fn parse(s: &str) -> Option<AdapterKind> {
        match s {
            "server_formater" | "formater_server" | "ServerFormater" => {
                Some(AdapterKind::ServerFormatter)
            }
            "caller_formater" | "formater_caller" | "CallerFormater" => {
                Some(AdapterKind::CallerFormatter)
            }
            "inf_logging" | "InfLogging" => Some(AdapterKind::InfLogging),
            "inf_check" | "InfCheck" => Some(AdapterKind::InfCheck),
            "serial_number" | "SerialNumber" => Some(AdapterKind::SerialNumber),
            "handler" => Some(AdapterKind::Handler),
            "task" => Some(AdapterKind::Task),
            _ => None,
        }
    }
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An instantiated adapter.
#[derive(Clone)]
pub enum AdapterEntry {
    ServerFormatter(Arc<dyn ServerFormatter>),
    CallerFormatter(Arc<dyn CallerFormatter>),
    InfLogging(Arc<dyn InfLogging>),
    InfCheck(Arc<dyn InfCheck>),
    SerialNumber(Arc<dyn SerialNumberProvider>),
    Handler(HandlerFn),
    Task(TaskFn),
}

impl std::fmt::Debug for AdapterEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AdapterEntry").field(&self.kind()).finish()
    }
}

impl AdapterEntry {
    pub fn kind(&self) -> AdapterKind {
        match self {
            AdapterEntry::ServerFormatter(_) => AdapterKind::ServerFormatter,
            AdapterEntry::CallerFormatter(_) => AdapterKind::CallerFormatter,
            AdapterEntry::InfLogging(_) => AdapterKind::InfLogging,
            AdapterEntry::InfCheck(_) => AdapterKind::InfCheck,
            AdapterEntry::SerialNumber(_) => AdapterKind::SerialNumber,
            AdapterEntry::Handler(_) => AdapterKind::Handler,
            AdapterEntry::Task(_) => AdapterKind::Task,
        }
    }

    pub fn as_server_formatter(&self) -> Option<Arc<dyn ServerFormatter>> {
        match self {
            AdapterEntry::ServerFormatter(f) => Some(Arc::clone(f)),
            _ => None,
        }
    }

    pub fn as_caller_formatter(&self) -> Option<Arc<dyn CallerFormatter>> {
        match self {
            AdapterEntry::CallerFormatter(f) => Some(Arc::clone(f)),
            _ => None,
        }
    }

    pub fn as_inf_logging(&self) -> Option<Arc<dyn InfLogging>> {
        match self {
            AdapterEntry::InfLogging(l) => Some(Arc::clone(l)),
            _ => None,
        }
    }

    pub fn as_inf_check(&self) -> Option<Arc<dyn InfCheck>> {
        match self {
            AdapterEntry::InfCheck(c) => Some(Arc::clone(c)),
            _ => None,
        }
    }

    pub fn as_serial_number(&self) -> Option<Arc<dyn SerialNumberProvider>> {
        match self {
            AdapterEntry::SerialNumber(s) => Some(Arc::clone(s)),
            _ => None,
        }
    }

    pub fn as_handler(&self) -> Option<HandlerFn> {
        match self {
            AdapterEntry::Handler(h) => Some(Arc::clone(h)),
            _ => None,
        }
    }

    pub fn as_task(&self) -> Option<TaskFn> {
        match self {
            AdapterEntry::Task(t) => Some(Arc::clone(t)),
            _ => None,
        }
    }
}

/// Application identity shared with builders that stamp envelopes.
#[derive(Debug, Clone, Default)]
pub struct AppIdentity {
    pub sys_id: String,
    pub module_id: String,
    pub server_id: String,
    pub app_name: String,
}

/// Everything a builder may need besides its descriptor.
#[derive(Clone)]
pub struct BuildContext {
    pub base_path: PathBuf,
    pub logger_manager: Arc<LoggerManager>,
    pub identity: AppIdentity,
}

impl BuildContext {
    pub fn logger(&self, descriptor: &PluginDescriptor) -> Arc<crate::logger::Logger> {
        self.logger_manager
            .get_logger(descriptor.logger_id.as_deref(), true)
            .expect("default logger always available")
    }
}

/// Builder signature: `(context, manager, descriptor) -> entry`.
/// The manager is available for adapters that depend on other
/// adapters (the standard-envelope caller formatter pulls its serial
/// number provider through it).
pub type AdapterBuilder =
    Arc<dyn Fn(&BuildContext, &AdapterManager, &PluginDescriptor) -> Result<AdapterEntry> + Send + Sync>;

/// Name → builder table. Built-ins register at starter init;
/// applications add their own handlers, tasks and adapters before
/// boot.
#[derive(Default)]
pub struct PluginRegistry {
    builders: DashMap<String, AdapterBuilder>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            builders: DashMap::new(),
        }
    }

    pub fn register<F>(&self, name: impl Into<String>, builder: F)
    where
        F: Fn(&BuildContext, &AdapterManager, &PluginDescriptor) -> Result<AdapterEntry>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        tracing::debug!(plugin = %name, "Registered plugin builder");
        self.builders.insert(name, Arc::new(builder));
    }

    /// Register a service handler under a stable name.
    pub fn register_handler(&self, name: impl Into<String>, handler: HandlerFn) {
        self.register(name, move |_, _, _| {
            Ok(AdapterEntry::Handler(Arc::clone(&handler)))
        });
    }

    /// Register a background task under a stable name.
    pub fn register_task(&self, name: impl Into<String>, task: TaskFn) {
        self.register(name, move |_, _, _| Ok(AdapterEntry::Task(Arc::clone(&task))));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.builders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }

    pub fn build(
        &self,
        ctx: &BuildContext,
        manager: &AdapterManager,
        descriptor: &PluginDescriptor,
    ) -> Result<AdapterEntry> {
        let builder = self
            .builders
            .get(&descriptor.plugin)
            .ok_or_else(|| MicraError::PluginNotFound(descriptor.plugin.clone()))?;
        builder(ctx, manager, descriptor)
    }
}

/// Look up a value by slash path (`a/b[0]/c`) inside a json value.
pub fn get_value_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('/') {
        if segment.is_empty() {
            continue;
        }
        let (key, index) = split_indexed(segment);
        if !key.is_empty() {
            current = current.get(key)?;
        }
        if let Some(index) = index {
            current = current.get(index)?;
        }
    }
    Some(current)
}

/// Set a value by slash path; intermediate maps must exist.
pub fn set_value_path(value: &mut Value, path: &str, new_value: Value) -> bool {
    let mut current = value;
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    for (i, segment) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();
        let (key, index) = split_indexed(segment);

        if !key.is_empty() {
            let Some(next) = current.get_mut(key) else {
                return false;
            };
            current = next;
        }
        if let Some(index) = index {
            let Some(next) = current.get_mut(index) else {
                return false;
            };
            current = next;
        }
        if last {
            *current = new_value;
            return true;
        }
    }
    false
}

fn split_indexed(segment: &str) -> (&str, Option<usize>) {
    if let Some(open) = segment.find('[')
        && segment.ends_with(']')
    {
        let key = &segment[..open];
        let index = segment[open + 1..segment.len() - 1].parse::<usize>().ok();
        (key, index)
    } else {
        (segment, None)
    }
}

/// Rewrite the descriptor's `convert_relative_paths` entries from
/// app-relative to absolute.
pub fn relocate_paths(descriptor: &mut PluginDescriptor, base_path: &Path) {
    for path in descriptor.convert_relative_paths.clone() {
        let Some(Value::String(rel)) = get_value_path(&descriptor.init, &path).cloned() else {
            continue;
        };
        let abs = base_path.join(&rel);
        set_value_path(
            &mut descriptor.init,
            &path,
            Value::String(abs.to_string_lossy().into_owned()),
        );
    }
}

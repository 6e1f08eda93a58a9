//! Service naming: registry contract, weighted instance selection and
//! the standalone registry that keeps instance documents in the
//! shared KV store.

pub mod select;
pub mod standalone;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use micra_core::Result;
use micra_core::instance::Instance;

pub use standalone::{KvNamingConfig, KvNamingRegistry};

/// Registry interface: instance add/remove, lookup and local
/// subscription cache.
#[async_trait]
pub trait NamingRegistry: Send + Sync {
    /// Register an instance. Failures are logged, not raised.
    async fn add_instance(
        &self,
        service_name: &str,
        ip: &str,
        port: u16,
        group_name: Option<&str>,
        metadata: Option<HashMap<String, Value>>,
        extras: HashMap<String, Value>,
    ) -> bool;

    /// Deregister. Absent ip/port removes every instance of the
    /// service in the group.
    async fn remove_instance(
        &self,
        service_name: &str,
        group_name: Option<&str>,
        ip: Option<&str>,
        port: Option<u16>,
    ) -> bool;

    async fn list_instance(
        &self,
        service_name: &str,
        group_name: Option<&str>,
        healthy_only: bool,
    ) -> Result<Vec<Instance>>;

    /// Pick one instance: weighted random among healthy ones, falling
    /// back to the unhealthy pool when `healthy_only` is false and no
    /// healthy instance exists.
    async fn get_instance(
        &self,
        service_name: &str,
        group_name: Option<&str>,
        healthy_only: bool,
    ) -> Result<Option<Instance>>;

    /// Maintain a background-refreshed local mirror for the service;
    /// `get_instance` consults the mirror before the registry.
    async fn add_subscribe(&self, service_name: &str, group_name: Option<&str>, interval: Duration);

    async fn remove_subscribe(&self, service_name: &str, group_name: Option<&str>);
}

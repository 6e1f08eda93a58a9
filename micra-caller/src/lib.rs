//! Unified caller: routes service-id invocations to a local handler
//! or a remote instance picked from the naming registry, with
//! per-call codec, tracing context propagation and interface logging
//! applied uniformly.

pub mod http;
pub mod serial;
pub mod std_envelope;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use micra_core::adapter::AdapterManager;
use micra_core::formatter::{CallerFormatter, InfKind, InfPayload, LogSide};
use micra_core::message::{CallArgs, CallRequest, Headers, StdResponse};
use micra_core::plugin::AdapterKind;
use micra_core::service::{
    LocalService, RemoteServiceConfig, ResolvedInstance, merge_values,
};
use micra_core::{MicraError, Result};
use micra_naming::NamingRegistry;
use micra_trace::Tracer;

pub use http::{HttpCallerFormatter, HttpFormatterConfig};
pub use serial::{MemorySerialNumbers, StandaloneSerialNumbers, serial_fix_str};
pub use std_envelope::{StdEnvelopeCallerFormatter, StdEnvelopeConfig};

/// Creates custom naming adapters on demand, keyed by the id under
/// `namings` in the application config.
pub type NamingFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn NamingRegistry>> + Send + Sync>;

pub struct ServiceCaller {
    adapter_manager: Arc<AdapterManager>,
    tracer: Option<Arc<Tracer>>,
    default_naming: Option<Arc<dyn NamingRegistry>>,
    naming_factory: Option<NamingFactory>,
    namings: DashMap<String, Arc<dyn NamingRegistry>>,
    remote_services: DashMap<String, RemoteServiceConfig>,
    local_services: DashMap<String, LocalService>,
}

impl ServiceCaller {
    pub fn new(
        adapter_manager: Arc<AdapterManager>,
        tracer: Option<Arc<Tracer>>,
        default_naming: Option<Arc<dyn NamingRegistry>>,
        naming_factory: Option<NamingFactory>,
    ) -> Self {
        Self {
            adapter_manager,
            tracer,
            default_naming,
            naming_factory,
            namings: DashMap::new(),
            remote_services: DashMap::new(),
            local_services: DashMap::new(),
        }
    }

    // ── service registration ──

    /// Register a remote callee; sets up the naming subscription for
    /// its service name.
    pub async fn add_remote_service(
        &self,
        service_id: &str,
        config: RemoteServiceConfig,
    ) -> Result<()> {
        if self.remote_services.contains_key(service_id) {
            return Err(MicraError::ServiceExists(service_id.to_string()));
        }

        let naming = self.naming_adapter(config.naming.as_deref())?;
        if let Some(naming) = naming
            && let Some(service_name) = &config.service_name
        {
            naming
                .add_subscribe(
                    service_name,
                    Some(config.group()),
                    Duration::from_secs_f64(config.naming_subscribe_interval),
                )
                .await;
        }

        self.remote_services
            .insert(service_id.to_string(), config);
        Ok(())
    }

    pub async fn remove_remote_service(&self, service_id: &str) {
        let Some((_, config)) = self.remote_services.remove(service_id) else {
            return;
        };
        if let Ok(Some(naming)) = self.naming_adapter(config.naming.as_deref())
            && let Some(service_name) = &config.service_name
        {
            naming
                .remove_subscribe(service_name, Some(config.group()))
                .await;
        }
    }

    /// Register a handler for in-process dispatch under this id.
    pub fn add_local_service(&self, service_id: &str, service: LocalService) {
        self.local_services.insert(service_id.to_string(), service);
    }

    pub fn remove_local_service(&self, service_id: &str) {
        self.local_services.remove(service_id);
    }

    pub fn has_local_service(&self, service_id: &str) -> bool {
        self.local_services.contains_key(service_id)
    }

    // ── calls ──

    pub async fn async_call(
        &self,
        service_id: &str,
        request: CallRequest,
        call: CallArgs,
    ) -> Result<StdResponse> {
        self.async_call_with_settings(service_id, Value::Null, request, call)
            .await
    }

    pub async fn async_call_with_settings(
        &self,
        service_id: &str,
        self_settings: Value,
        mut request: CallRequest,
        call: CallArgs,
    ) -> Result<StdResponse> {
        let instance = self.resolve_instance(service_id, &self_settings).await?;

        let formatter = self
            .adapter_manager
            .get_opt(AdapterKind::CallerFormatter, instance.formatter.as_deref())
            .and_then(|e| e.as_caller_formatter())
            .ok_or_else(|| {
                MicraError::AdapterLoadFailure(format!(
                    "Caller formater [{}] is not found",
                    instance.formatter.as_deref().unwrap_or("")
                ))
            })?;
        let inf_logging = self
            .adapter_manager
            .get_opt(AdapterKind::InfLogging, instance.inf_logging.as_deref())
            .and_then(|e| e.as_inf_logging());

        // Service defaults sit under the request's own values.
        if let Some(default_headers) = &instance.headers {
            request.headers = default_headers.merged_under(&request.headers);
        }
        if let Some(default_network) = &instance.network {
            let mut merged = default_network.clone();
            merged.extend(request.network.clone());
            request.network = merged;
        }

        // Context propagation only; the caller opens no span of its
        // own.
        if instance.enable_tracer
            && let Some(tracer) = &self.tracer
        {
            tracer.inject_to_call(&instance.tracer_inject_format, &mut request.headers);
        }

        if instance.is_local {
            self.call_local(service_id, &formatter, inf_logging, &instance, request, call)
                .await
        } else {
            self.call_remote(service_id, &formatter, inf_logging, &instance, request, call)
                .await
        }
    }

    /// Blocking facade; re-enters the running runtime.
    pub fn call(
        &self,
        service_id: &str,
        request: CallRequest,
        call: CallArgs,
    ) -> Result<StdResponse> {
        self.call_with_settings(service_id, Value::Null, request, call)
    }

    pub fn call_with_settings(
        &self,
        service_id: &str,
        self_settings: Value,
        request: CallRequest,
        call: CallArgs,
    ) -> Result<StdResponse> {
        let handle = tokio::runtime::Handle::current();
        tokio::task::block_in_place(|| {
            handle.block_on(self.async_call_with_settings(service_id, self_settings, request, call))
        })
    }

    // ── internals ──

    async fn call_local(
        &self,
        service_id: &str,
        formatter: &Arc<dyn CallerFormatter>,
        inf_logging: Option<Arc<dyn micra_core::formatter::InfLogging>>,
        instance: &ResolvedInstance,
        request: CallRequest,
        call: CallArgs,
    ) -> Result<StdResponse> {
        let std_request = formatter
            .format_local_call_request(instance, request, &call)
            .await?;

        if let Some(logging) = &inf_logging {
            logging
                .log(
                    LogSide::Client,
                    InfKind::Request,
                    InfPayload::Request(&std_request),
                    service_id,
                )
                .await;
        }

        let handler = instance
            .handler
            .clone()
            .ok_or_else(|| MicraError::Internal("local instance without handler".to_string()))?;

        debug!(service_id = %service_id, "local call");
        let response = match handler(std_request.clone(), call).await {
            Ok(response) => {
                formatter
                    .format_local_call_response(response, &std_request, instance)
                    .await
            }
            Err(error) => {
                formatter
                    .format_local_call_exception(
                        micra_core::err_code::PRE_SEND,
                        None,
                        &error,
                        Some(&std_request),
                        instance,
                    )
                    .await
            }
        };

        if let Some(logging) = &inf_logging {
            logging
                .log(
                    LogSide::Client,
                    InfKind::Back,
                    InfPayload::Response(&response),
                    service_id,
                )
                .await;
        }
        Ok(response)
    }

    async fn call_remote(
        &self,
        service_id: &str,
        formatter: &Arc<dyn CallerFormatter>,
        inf_logging: Option<Arc<dyn micra_core::formatter::InfLogging>>,
        instance: &ResolvedInstance,
        request: CallRequest,
        call: CallArgs,
    ) -> Result<StdResponse> {
        let std_request = formatter
            .format_remote_call_request(instance, request, &call)
            .await?;

        if let Some(logging) = &inf_logging {
            logging
                .log(
                    LogSide::Client,
                    InfKind::Request,
                    InfPayload::Call(&std_request),
                    service_id,
                )
                .await;
        }

        debug!(service_id = %service_id, ip = ?instance.ip, port = ?instance.port, "remote call");
        let response = formatter.call(instance, &std_request, &call).await;

        if let Some(logging) = &inf_logging {
            logging
                .log(
                    LogSide::Client,
                    InfKind::Back,
                    InfPayload::Response(&response),
                    service_id,
                )
                .await;
        }
        Ok(response)
    }

    fn naming_adapter(&self, naming: Option<&str>) -> Result<Option<Arc<dyn NamingRegistry>>> {
        let Some(id) = naming.filter(|id| !id.is_empty()) else {
            return Ok(self.default_naming.clone());
        };
        if let Some(existing) = self.namings.get(id) {
            return Ok(Some(Arc::clone(&existing)));
        }
        let factory = self.naming_factory.as_ref().ok_or_else(|| {
            MicraError::AdapterLoadFailure(format!("Naming config of [{}] not found", id))
        })?;
        let adapter = factory(id)?;
        self.namings.insert(id.to_string(), Arc::clone(&adapter));
        Ok(Some(adapter))
    }

    async fn resolve_instance(
        &self,
        service_id: &str,
        self_settings: &Value,
    ) -> Result<ResolvedInstance> {
        let config = self
            .remote_services
            .get(service_id)
            .map(|c| c.clone())
            .ok_or_else(|| MicraError::ServiceNotFound(service_id.to_string()))?;

        let merged: RemoteServiceConfig = if self_settings.is_null() {
            config
        } else {
            let base = serde_json::to_value(&config)?;
            serde_json::from_value(merge_values(base, self_settings.clone()))?
        };

        let mut instance = ResolvedInstance {
            is_local: false,
            handler: None,
            protocol: merged.protocol.clone(),
            uri: merged.uri.clone(),
            network: merged.network.clone(),
            headers: merged.headers.clone(),
            metadata: merged.metadata.clone(),
            ip: None,
            port: None,
            formatter: merged.formatter.clone(),
            enable_tracer: merged.enable_tracer,
            tracer_inject_format: merged.tracer_inject_format.clone(),
            inf_logging: merged.inf_logging.clone(),
        };

        let mut resolved = false;
        if merged.local_call_first
            && let Some(local) = self.local_services.get(service_id)
        {
            instance.is_local = true;
            instance.handler = Some(local.handler.clone());
            instance.metadata = local.metadata.clone();
            if instance.uri.is_none() {
                instance.uri = local.uri.clone();
            }
            resolved = true;
        }

        if !resolved && merged.is_fixed_config {
            instance.ip = merged.ip.clone();
            instance.port = merged.port;
            resolved = true;
        }

        if !resolved {
            let naming = self.naming_adapter(merged.naming.as_deref())?.ok_or_else(|| {
                MicraError::AdapterLoadFailure(
                    "no naming adapter available for instance lookup".to_string(),
                )
            })?;
            let service_name = merged
                .service_name
                .clone()
                .unwrap_or_else(|| service_id.to_string());
            let found = naming
                .get_instance(&service_name, Some(merged.group()), true)
                .await?
                .ok_or_else(|| MicraError::NoEnableInstance {
                    service_id: service_id.to_string(),
                    service_name: service_name.clone(),
                })?;
            instance.metadata = found.metadata;
            instance.ip = Some(found.ip);
            instance.port = Some(found.port);
        }

        fill_from_metadata(&mut instance);
        Ok(instance)
    }
}

/// Fill missing protocol/uri/headers/network from instance metadata.
fn fill_from_metadata(instance: &mut ResolvedInstance) {
    if instance.protocol.is_none() {
        instance.protocol = instance
            .metadata
            .get("protocol")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
    }
    if instance.uri.is_none() {
        instance.uri = instance
            .metadata
            .get("uri")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
    }
    if instance.headers.is_none()
        && let Some(Value::Object(map)) = instance.metadata.get("headers")
    {
        let headers: Headers = map
            .iter()
            .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
            .collect();
        instance.headers = Some(headers);
    }
    if instance.network.is_none()
        && let Some(Value::Object(map)) = instance.metadata.get("network")
    {
        let network: HashMap<String, Value> =
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        instance.network = Some(network);
    }
}

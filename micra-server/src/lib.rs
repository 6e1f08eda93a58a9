//! Server starter: loads configuration, wires adapters into the
//! typed runtime context, registers services on the web server and
//! with the caller, and owns the start/stop lifecycle.

pub mod builtin;
pub mod lock;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::Notify;
use tracing::{error, info};

use micra_caller::ServiceCaller;
use micra_cluster::{ClusterConfig, ClusterCoordinator, ClusterHook, ClusterHooks};
use micra_core::adapter::AdapterManager;
use micra_core::config::{AppConfig, ConfigCenterFile, ServicesFile, TaskEntry};
use micra_core::logger::{Logger, LoggerManager};
use micra_core::plugin::{
    AdapterKind, AppIdentity, BuildContext, PluginRegistry, TaskFn,
};
use micra_core::service::{LocalService, RemoteServiceConfig, ServiceConfig};
use micra_core::{MicraError, Result};
use micra_naming::NamingRegistry;
use micra_store::{ConfigCenter, ConfigStore, KvConfigStore};
use micra_trace::Tracer;
use micra_web::axum_server::LifecycleFn;
use micra_web::{AxumWebServer, WebServer, wrap_service_handler};

use builtin::KvStores;
use lock::ProcessLock;

/// Boot parameters, usually from the CLI.
#[derive(Debug, Clone, Default)]
pub struct StartConfig {
    pub base_path: PathBuf,
    pub logs_path: Option<String>,
    /// `None` uses `base_config.default_web_server`; an empty string
    /// selects the no-listener background mode.
    pub web_server: Option<String>,
    pub visit_host: Option<String>,
    pub visit_port: Option<u16>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub server_id: Option<String>,
}

/// The process-wide singletons, read-mostly after boot.
pub struct RuntimeCore {
    pub base_path: PathBuf,
    pub config_path: PathBuf,
    pub running_data_path: PathBuf,
    pub logs_path: PathBuf,
    pub is_main_process: bool,
    pub env: String,
    pub config_namespace: String,
    pub service_namespace: Option<String>,
    pub app_config: AppConfig,
    pub identity: AppIdentity,
    pub registry: Arc<PluginRegistry>,
    pub logger_manager: Arc<LoggerManager>,
    pub sys_logger: Arc<Logger>,
    pub platform_logger: Arc<Logger>,
    pub config_center: Arc<ConfigCenter>,
    pub adapter_manager: Arc<AdapterManager>,
    pub naming: Option<Arc<dyn NamingRegistry>>,
    pub naming_id: Option<String>,
    pub tracer: Arc<Tracer>,
    pub caller: Arc<ServiceCaller>,
    pub cluster: Option<Arc<ClusterCoordinator>>,
    build_ctx: BuildContext,
    services: Mutex<HashMap<String, Arc<ServiceConfig>>>,
    started: AtomicBool,
    _lock: ProcessLock,
}

impl RuntimeCore {
    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn service_config(&self, name: &str) -> Option<Arc<ServiceConfig>> {
        self.services.lock().unwrap().get(name).cloned()
    }

    /// After-start callback: register services with naming (main
    /// process only), register the cluster (failure aborts), run the
    /// configured task.
    pub async fn after_server_start(&self, web_exists: bool) -> Result<()> {
        if web_exists {
            self.register_services().await?;
        }

        if let Some(cluster) = &self.cluster {
            cluster.register_cluster().await.map_err(|e| {
                self.sys_logger
                    .error(format!("Register cluster error: {}", e));
                e
            })?;
            let config = cluster.config();
            self.sys_logger.info(format!(
                "Register cluster success: [namespace:{}] [sys_id:{}] [module_id:{}] [server_id:{}] [master:{}]",
                config.namespace, config.sys_id, config.module_id, config.server_id,
                cluster.master()
            ));
        }

        self.started.store(true, Ordering::SeqCst);

        if let Some(task_id) = self.app_config.base_config.after_server_start.clone() {
            self.run_task("after_server_start", &task_id).await;
        }
        Ok(())
    }

    /// Before-stop callback: run the configured task, deregister the
    /// cluster and the services (best effort), release the tracer.
    pub async fn before_server_stop(&self, web_exists: bool) {
        if let Some(task_id) = self.app_config.base_config.before_server_stop.clone() {
            self.run_task("before_server_stop", &task_id).await;
        }

        self.started.store(false, Ordering::SeqCst);

        if let Some(cluster) = &self.cluster {
            match cluster.deregister_cluster().await {
                Ok(()) => self.sys_logger.info("Deregister cluster success".to_string()),
                Err(e) => self
                    .sys_logger
                    .error(format!("Deregister cluster error: {}", e)),
            }
            cluster.shutdown();
        }

        if web_exists {
            self.deregister_services().await;
        }

        self.tracer.close();
    }

    async fn register_services(&self) -> Result<()> {
        if !self.is_main_process {
            self.sys_logger.info(
                "Server process is not the main process, no register to naming server".to_string(),
            );
            return Ok(());
        }
        let Some(naming) = &self.naming else {
            self.sys_logger
                .info("There is no naming adapter, no register to naming server".to_string());
            return Ok(());
        };

        let services: Vec<(String, Arc<ServiceConfig>)> = self
            .services
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        for (name, config) in services {
            if !config.enable_service {
                self.sys_logger.info(format!(
                    "Service [{}] not enable, no register to naming server",
                    name
                ));
                continue;
            }
            let Some(naming_config) = &config.naming else {
                self.sys_logger.info(format!(
                    "Service [{}] with no naming config, no register to naming server",
                    name
                ));
                continue;
            };

            // Default the advertised uri from the route.
            let mut metadata = naming_config.metadata.clone();
            let uri_missing = metadata
                .get("uri")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .is_empty();
            if uri_missing {
                metadata.insert("uri".to_string(), Value::String(config.uri.clone()));
            }

            let extras: HashMap<String, Value> = self
                .naming_id
                .as_ref()
                .and_then(|id| naming_config.naming_config.get(id))
                .and_then(|v| v.as_object())
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default();

            let service_name = naming_config.service_name.clone().unwrap_or_else(|| name.clone());
            self.sys_logger
                .info(format!("Register [{}] to naming server ...", name));
            let registered = naming
                .add_instance(
                    &service_name,
                    &self.app_config.base_config.host,
                    self.app_config.base_config.port,
                    naming_config.group_name.as_deref(),
                    Some(metadata),
                    extras,
                )
                .await;
            if !registered {
                self.sys_logger
                    .error(format!("Register [{}] to naming server error", name));
                return Err(MicraError::Store(format!(
                    "register service [{}] to naming server failed",
                    name
                )));
            }
        }
        Ok(())
    }

    async fn deregister_services(&self) {
        if !self.is_main_process {
            return;
        }
        let Some(naming) = &self.naming else {
            return;
        };

        let services: Vec<(String, Arc<ServiceConfig>)> = self
            .services
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        for (name, config) in services {
            if !config.enable_service {
                continue;
            }
            let Some(naming_config) = &config.naming else {
                continue;
            };
            let service_name = naming_config.service_name.clone().unwrap_or_else(|| name.clone());
            self.sys_logger
                .info(format!("Deregister [{}] from naming server ...", name));
            let removed = naming
                .remove_instance(
                    &service_name,
                    naming_config.group_name.as_deref(),
                    Some(&self.app_config.base_config.host),
                    Some(self.app_config.base_config.port),
                )
                .await;
            if !removed {
                self.sys_logger
                    .error(format!("Deregister [{}] from naming server error", name));
            }
        }
    }

    async fn run_task(&self, task_type: &str, task_id: &str) {
        self.sys_logger
            .info(format!("Run [{}] task [{}] ...", task_type, task_id));
        match self.load_task(task_id) {
            Ok((task, args)) => {
                if let Err(e) = task(args).await {
                    self.sys_logger.error(format!(
                        "Run [{}] task [{}] error: [{}]",
                        task_type, task_id, e
                    ));
                }
            }
            Err(e) => self.sys_logger.error(format!(
                "Run [{}] task [{}] error: [{}]",
                task_type, task_id, e
            )),
        }
    }

    fn load_task(&self, task_id: &str) -> Result<(TaskFn, Value)> {
        let entry: &TaskEntry = self
            .app_config
            .tasks
            .get(task_id)
            .ok_or_else(|| MicraError::ConfigMissing(format!("task [{}]", task_id)))?;
        let task = self
            .adapter_manager
            .load(&self.build_ctx, AdapterKind::Task, task_id, &entry.plugin)?
            .as_task()
            .ok_or_else(|| {
                MicraError::AdapterLoadFailure(format!("task [{}] is not a task plugin", task_id))
            })?;
        Ok((task, entry.args.clone()))
    }
}

pub struct ServerStarter {
    core: Arc<RuntimeCore>,
    web_server: Option<Arc<AxumWebServer>>,
    shutdown: Arc<Notify>,
}

impl ServerStarter {
    /// Full boot sequence; any failure aborts startup.
    pub async fn boot(start_config: StartConfig, registry: Arc<PluginRegistry>) -> Result<Self> {
        info!("Server initialize ...");

        // Base paths and the single-process lock.
        let base_path = std::path::absolute(&start_config.base_path)
            .unwrap_or_else(|_| start_config.base_path.clone());
        let config_path = base_path.join("config");
        let running_data_path = base_path.join("running_data");
        let lock = ProcessLock::acquire(&running_data_path)?;
        let is_main_process = lock.is_main_process();

        // Config center.
        info!("import config center ...");
        let center_file = ConfigCenterFile::load(&config_path.join("configCenter.yaml"))?;
        let kv_stores = KvStores::new();
        let store = Self::build_config_store(&center_file, &kv_stores).await?;
        let config_center = Arc::new(ConfigCenter::new(&config_path, center_file, store));
        let env = config_center.env().to_string();
        let config_namespace = config_center.namespace().to_string();

        // Application config.
        info!("get application config ...");
        let app_value = config_center
            .get_cached_yaml("application.yaml", Some("sys"))
            .await?;
        let mut app_config: AppConfig = serde_json::from_value(app_value)?;

        // Start-parameter overrides.
        if let Some(visit_host) = &start_config.visit_host {
            app_config.base_config.host = visit_host.clone();
        }
        if let Some(visit_port) = start_config.visit_port {
            app_config.base_config.port = visit_port;
        }
        if let Some(host) = &start_config.host {
            app_config.base_config.host = host.clone();
        }
        if let Some(port) = start_config.port {
            app_config.base_config.port = port;
        }
        if let Some(server_id) = &start_config.server_id {
            app_config.base_config.server_id = server_id.clone();
        }

        // Loggers.
        info!("import loggers ...");
        let logs_path = base_path.join(
            start_config
                .logs_path
                .clone()
                .unwrap_or_else(|| app_config.base_config.logs_path.clone()),
        );
        let logger_manager = Arc::new(LoggerManager::new(&logs_path));
        for (logger_id, config) in &app_config.loggers {
            if config.enable {
                logger_manager.create_logger(logger_id, config);
            }
        }
        let sys_logger = logger_manager
            .get_logger(app_config.base_config.sys_logger.as_deref(), true)
            .expect("default logger");
        let platform_logger = logger_manager
            .get_logger(app_config.base_config.service_logger.as_deref(), true)
            .expect("default logger");

        sys_logger.info("Start logging server initialize ...");

        let identity = AppIdentity {
            sys_id: app_config.base_config.sys_id.clone(),
            module_id: app_config.base_config.module_id.clone(),
            server_id: app_config.base_config.server_id.clone(),
            app_name: app_config.base_config.app_name.clone(),
        };
        let build_ctx = BuildContext {
            base_path: base_path.clone(),
            logger_manager: Arc::clone(&logger_manager),
            identity: identity.clone(),
        };

        // Generic adapters from adapters.yaml.
        sys_logger.info("Get adapters config ...");
        let adapter_manager = Arc::new(AdapterManager::new(Arc::clone(&registry)));
        let adapters_value = config_center
            .get_cached_yaml("adapters.yaml", Some("sys"))
            .await?;
        let adapters_file: micra_core::config::AdaptersFile =
            serde_json::from_value(adapters_value)?;
        for (adapter_id, entry) in &adapters_file.adapters {
            let kind = AdapterKind::parse(&entry.adapter_type).ok_or_else(|| {
                MicraError::AdapterLoadFailure(format!(
                    "unknown adapter type [{}] for [{}]",
                    entry.adapter_type, adapter_id
                ))
            })?;
            sys_logger.info(format!("Initialize dynamic adapter [{}] ...", adapter_id));
            adapter_manager.load(&build_ctx, kind, adapter_id, &entry.plugin)?;
        }

        // Naming.
        let naming_id = app_config.base_config.naming.clone();
        let mut service_namespace = None;
        let naming: Option<Arc<dyn NamingRegistry>> = match &naming_id {
            Some(id) => {
                sys_logger.info(format!("Initialize naming adapter [{}] ...", id));
                let entry = app_config.namings.get(id).ok_or_else(|| {
                    MicraError::ConfigMissing(format!("namings entry [{}]", id))
                })?;
                let namespace = format!(
                    "{}{}",
                    app_config.base_config.namespace,
                    if env.is_empty() {
                        String::new()
                    } else {
                        format!("-{}", env)
                    }
                );
                service_namespace = Some(namespace.clone());
                Some(
                    builtin::build_naming(
                        &kv_stores,
                        &entry.plugin,
                        &namespace,
                        app_config.base_config.cluster_name.as_deref(),
                    )
                    .await?,
                )
            }
            None => None,
        };

        // Tracer (no-op default).
        let tracer = match &app_config.base_config.tracer {
            Some(id) => {
                sys_logger.info(format!("Initialize tracer adapter [{}] ...", id));
                let entry = app_config
                    .tracers
                    .get(id)
                    .ok_or_else(|| MicraError::ConfigMissing(format!("opentracings entry [{}]", id)))?;
                builtin::build_tracer(&entry.plugin, &app_config.base_config.app_name)?
            }
            None => {
                sys_logger.info("Initialize tracer adapter [default] ...");
                Arc::new(Tracer::noop())
            }
        };

        // Interface logging/check adapters.
        sys_logger.info("Initialize interface logging adapters ...");
        for (adapter_id, entry) in &app_config.inf_loggings {
            adapter_manager.load(&build_ctx, AdapterKind::InfLogging, adapter_id, &entry.plugin)?;
        }
        sys_logger.info("Initialize interface check adapters ...");
        for (adapter_id, entry) in &app_config.inf_checks {
            adapter_manager.load(&build_ctx, AdapterKind::InfCheck, adapter_id, &entry.plugin)?;
        }

        // Caller formatters referenced by the base config.
        sys_logger.info("Initialize caller formaters ...");
        for formatter_id in &app_config.base_config.caller_formatters {
            let entry = app_config.caller_formatters.get(formatter_id).ok_or_else(|| {
                MicraError::ConfigMissing(format!("caller_formaters entry [{}]", formatter_id))
            })?;
            adapter_manager.load(
                &build_ctx,
                AdapterKind::CallerFormatter,
                formatter_id,
                &entry.plugin,
            )?;
        }

        // Remote caller with every configured naming adapter built up
        // front for the by-id lookup.
        sys_logger.info("Initialize remote caller ...");
        let mut custom_namings: HashMap<String, Arc<dyn NamingRegistry>> = HashMap::new();
        for (id, entry) in &app_config.namings {
            if Some(id) == naming_id.as_ref() {
                continue;
            }
            let namespace = service_namespace
                .clone()
                .unwrap_or_else(|| config_namespace.clone());
            custom_namings.insert(
                id.clone(),
                builtin::build_naming(
                    &kv_stores,
                    &entry.plugin,
                    &namespace,
                    app_config.base_config.cluster_name.as_deref(),
                )
                .await?,
            );
        }
        let naming_factory: micra_caller::NamingFactory = {
            let custom_namings = custom_namings;
            Arc::new(move |id: &str| {
                custom_namings.get(id).cloned().ok_or_else(|| {
                    MicraError::AdapterLoadFailure(format!("Naming config of [{}] not found", id))
                })
            })
        };
        let caller = Arc::new(ServiceCaller::new(
            Arc::clone(&adapter_manager),
            Some(Arc::clone(&tracer)),
            naming.clone(),
            Some(naming_factory),
        ));

        // Remote callee registrations.
        sys_logger.info("Get remote services config ...");
        let remote_value = config_center
            .get_cached_yaml("remoteServices.yaml", Some("sys"))
            .await?;
        let remote_file: ServicesFile = serde_json::from_value(remote_value)?;
        for (name, merged) in remote_file.merged_entries() {
            let config: RemoteServiceConfig = serde_json::from_value(merged)?;
            caller.add_remote_service(&name, config).await?;
        }

        // Cluster.
        let cluster = match &app_config.base_config.cluster_adapter {
            Some(id) => {
                sys_logger.info("Initialize cluster adapter ...");
                let entry = app_config
                    .clusters
                    .get(id)
                    .ok_or_else(|| MicraError::ConfigMissing(format!("clusters entry [{}]", id)))?;
                let mut cluster_config: ClusterConfig = serde_json::from_value(
                    micra_core::service::merge_values(
                        serde_json::json!({
                            "namespace": config_namespace,
                            "sys_id": identity.sys_id,
                            "module_id": identity.module_id,
                            "server_id": identity.server_id,
                            "app_name": identity.app_name,
                        }),
                        entry.plugin.init.clone(),
                    ),
                )?;
                // Coordinates always come from the base config.
                cluster_config.namespace = config_namespace.clone();
                cluster_config.sys_id = identity.sys_id.clone();
                cluster_config.module_id = identity.module_id.clone();
                cluster_config.server_id = identity.server_id.clone();
                cluster_config.app_name = identity.app_name.clone();

                let hooks = Self::cluster_hooks(
                    &entry.plugin.init,
                    &app_config,
                    &adapter_manager,
                    &build_ctx,
                )?;
                Some(builtin::build_cluster(&kv_stores, &entry.plugin, cluster_config, hooks).await?)
            }
            None => None,
        };

        let core = Arc::new(RuntimeCore {
            base_path,
            config_path,
            running_data_path,
            logs_path,
            is_main_process,
            env,
            config_namespace,
            service_namespace,
            app_config,
            identity,
            registry,
            logger_manager,
            sys_logger,
            platform_logger,
            config_center,
            adapter_manager,
            naming,
            naming_id,
            tracer,
            caller,
            cluster,
            build_ctx,
            services: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            _lock: lock,
        });

        // Web server (or background mode).
        let web_server = Self::init_web(&core, &start_config).await?;

        // Services: pipeline wrap, web exposure, local-call
        // registration.
        Self::init_services(&core, web_server.as_ref()).await?;

        Ok(Self {
            core,
            web_server,
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn core(&self) -> &Arc<RuntimeCore> {
        &self.core
    }

    pub fn web_server(&self) -> Option<&Arc<AxumWebServer>> {
        self.web_server.as_ref()
    }

    /// Run until shutdown. With a web server this serves requests;
    /// without one it runs the lifecycle callbacks around an idle
    /// wait.
    pub async fn serve(&self) -> Result<()> {
        match &self.web_server {
            Some(web) => web.start().await,
            None => {
                self.core.after_server_start(false).await?;
                let shutdown = Arc::clone(&self.shutdown);
                tokio::select! {
                    _ = shutdown.notified() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
                self.core.before_server_stop(false).await;
                Ok(())
            }
        }
    }

    pub fn stop(&self) {
        if let Some(web) = &self.web_server {
            web.stop();
        }
        self.shutdown.notify_one();
    }

    async fn build_config_store(
        center_file: &ConfigCenterFile,
        kv_stores: &KvStores,
    ) -> Result<Option<Arc<dyn ConfigStore>>> {
        let Some(center_type) = &center_file.base_config.center_type else {
            return Ok(None);
        };
        let entry = center_file.configs.get(center_type).ok_or_else(|| {
            MicraError::ConfigMissing(format!("configCenter configs entry [{}]", center_type))
        })?;
        match entry.plugin.plugin.as_str() {
            "kv_config_store" => {
                let kv = kv_stores
                    .get(entry.plugin.init.get("kv").unwrap_or(&Value::Null))
                    .await?;
                let namespace = entry
                    .plugin
                    .init
                    .get("namespace")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| {
                        let base = &center_file.base_config;
                        match &base.env {
                            Some(env) if !env.is_empty() => {
                                format!("{}-{}", base.namespace, env)
                            }
                            _ => base.namespace.clone(),
                        }
                    });
                Ok(Some(Arc::new(KvConfigStore::new(kv, namespace))))
            }
            other => Err(MicraError::PluginNotFound(other.to_string())),
        }
    }

    fn cluster_hooks(
        init: &Value,
        app_config: &AppConfig,
        adapter_manager: &Arc<AdapterManager>,
        build_ctx: &BuildContext,
    ) -> Result<ClusterHooks> {
        let mut hooks = ClusterHooks::default();
        for hook_name in [
            "after_register",
            "after_deregister",
            "after_own_master",
            "after_lost_master",
        ] {
            let Some(task_id) = init.get(hook_name).and_then(|v| v.as_str()) else {
                continue;
            };
            let entry = app_config
                .tasks
                .get(task_id)
                .ok_or_else(|| MicraError::ConfigMissing(format!("task [{}]", task_id)))?;
            let task = adapter_manager
                .load(build_ctx, AdapterKind::Task, task_id, &entry.plugin)?
                .as_task()
                .ok_or_else(|| {
                    MicraError::AdapterLoadFailure(format!(
                        "task [{}] is not a task plugin",
                        task_id
                    ))
                })?;
            let args = entry.args.clone();
            let hook: ClusterHook = Arc::new(move |_snapshot| {
                let task = Arc::clone(&task);
                let args = args.clone();
                Box::pin(async move {
                    if let Err(e) = task(args).await {
                        error!(error = %e, "cluster lifecycle task failed");
                    }
                })
            });
            match hook_name {
                "after_register" => hooks.after_register = Some(hook),
                "after_deregister" => hooks.after_deregister = Some(hook),
                "after_own_master" => hooks.after_own_master = Some(hook),
                _ => hooks.after_lost_master = Some(hook),
            }
        }
        Ok(hooks)
    }

    async fn init_web(
        core: &Arc<RuntimeCore>,
        start_config: &StartConfig,
    ) -> Result<Option<Arc<AxumWebServer>>> {
        let web_server_id = match &start_config.web_server {
            Some(id) if id.is_empty() => None,
            Some(id) => Some(id.clone()),
            None => core.app_config.base_config.default_web_server.clone(),
        };
        let Some(web_server_id) = web_server_id else {
            core.sys_logger.info("Initialize with no web server ...");
            return Ok(None);
        };

        let entry = core
            .app_config
            .web_servers
            .get(&web_server_id)
            .ok_or_else(|| {
                MicraError::ConfigMissing(format!("web_servers entry [{}]", web_server_id))
            })?;

        // Listener address: start params, then the entry, then the
        // base config.
        let host = start_config
            .host
            .clone()
            .or_else(|| entry.host.clone())
            .unwrap_or_else(|| core.app_config.base_config.host.clone());
        let port = start_config
            .port
            .or(entry.port)
            .unwrap_or(core.app_config.base_config.port);

        core.sys_logger.info("Initialize server formaters ...");
        for formatter_id in &entry.server_formatters {
            let formatter_entry = core
                .app_config
                .server_formatters
                .get(formatter_id)
                .ok_or_else(|| {
                    MicraError::ConfigMissing(format!("server_formaters entry [{}]", formatter_id))
                })?;
            core.adapter_manager.load(
                &core.build_ctx,
                AdapterKind::ServerFormatter,
                formatter_id,
                &formatter_entry.plugin,
            )?;
        }

        core.sys_logger
            .info(format!("Initialize web server [{}] ...", web_server_id));
        let after_start: LifecycleFn = {
            let core = Arc::clone(core);
            Arc::new(move || {
                let core = Arc::clone(&core);
                Box::pin(async move { core.after_server_start(true).await })
            })
        };
        let before_stop: LifecycleFn = {
            let core = Arc::clone(core);
            Arc::new(move || {
                let core = Arc::clone(&core);
                Box::pin(async move {
                    core.before_server_stop(true).await;
                    Ok(())
                })
            })
        };

        Ok(Some(Arc::new(AxumWebServer::new(
            web_server_id,
            core.app_config.base_config.app_name.clone(),
            host,
            port,
            Arc::clone(&core.adapter_manager),
            Some(Arc::clone(&core.tracer)),
            Some(after_start),
            Some(before_stop),
        ))))
    }

    async fn init_services(
        core: &Arc<RuntimeCore>,
        web_server: Option<&Arc<AxumWebServer>>,
    ) -> Result<()> {
        core.sys_logger.info("Get services config ...");
        let services_value = core
            .config_center
            .get_cached_yaml("services.yaml", Some("sys"))
            .await?;
        let services_file: ServicesFile = serde_json::from_value(services_value)?;

        for (name, mut merged) in services_file.merged_entries() {
            core.sys_logger
                .info(format!("Initialize service [{}] ...", name));
            if let Some(obj) = merged.as_object_mut() {
                obj.insert("service_name".to_string(), Value::String(name.clone()));
            }
            let config: Arc<ServiceConfig> = Arc::new(serde_json::from_value(merged)?);

            let descriptor = config.plugin.clone().ok_or_else(|| {
                MicraError::ConfigMissing(format!("service [{}] has no plugin", name))
            })?;
            let handler = core
                .adapter_manager
                .load(&core.build_ctx, AdapterKind::Handler, &name, &descriptor)?
                .as_handler()
                .ok_or_else(|| {
                    MicraError::AdapterLoadFailure(format!(
                        "service [{}] plugin is not a handler",
                        name
                    ))
                })?;

            if config.enable_service
                && let Some(web) = web_server
            {
                web.add_service(handler.clone(), &config.uri, Arc::clone(&config))
                    .await?;
            }

            // Local-call registration is independent of web exposure.
            if config.allow_local_call {
                let wrapped = wrap_service_handler(
                    &name,
                    Arc::clone(&config),
                    &core.adapter_manager,
                    Some(Arc::clone(&core.tracer)),
                    handler,
                );
                let naming_config = config.naming.clone().unwrap_or_default();
                core.caller.add_local_service(
                    &name,
                    LocalService {
                        service_name: naming_config
                            .service_name
                            .clone()
                            .or_else(|| Some(name.clone())),
                        group_name: naming_config.group_name.clone(),
                        protocol: naming_config.protocol.clone(),
                        uri: naming_config.uri.clone().or_else(|| Some(config.uri.clone())),
                        metadata: naming_config.metadata.clone(),
                        handler: wrapped,
                    },
                );
            }

            core.services.lock().unwrap().insert(name, config);
        }
        Ok(())
    }
}

//! Cluster coordinator: within one `(namespace, sys_id, module_id)`
//! group several `server_id` nodes coexist, elect exactly one master
//! and exchange events, all over the shared KV store.
//!
//! Liveness is lease-based: a heartbeat timer renews this node's keys
//! every `heart_beat` seconds with a `expire`-second TTL; when the
//! keys vanish they are recreated and the mastership race re-runs.
//! Registration and mastership transitions each run under their own
//! mutex so lifecycle hooks fire exactly once per transition.

pub mod keys;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use micra_core::{MicraError, Result};
use micra_store::KvStore;

/// Coordinates and timings of one cluster node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub namespace: String,
    pub sys_id: String,
    pub module_id: String,
    pub server_id: String,
    pub app_name: String,
    /// Lease seconds.
    #[serde(default = "default_expire")]
    pub expire: f64,
    /// Heartbeat period seconds.
    #[serde(default = "default_heart_beat")]
    pub heart_beat: f64,
    #[serde(default)]
    pub enable_event: bool,
    /// Event poll period seconds.
    #[serde(default = "default_event_interval")]
    pub event_interval: f64,
    /// Events drained per poll.
    #[serde(default = "default_event_each_get")]
    pub event_each_get: usize,
}

fn default_expire() -> f64 {
    10.0
}

fn default_heart_beat() -> f64 {
    4.0
}

fn default_event_interval() -> f64 {
    2.0
}

fn default_event_each_get() -> usize {
    10
}

/// Node coordinates carried in event contexts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCoords {
    pub namespace: String,
    pub sys_id: String,
    pub module_id: String,
    pub server_id: String,
}

/// Context delivered with every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventContext {
    /// `emit` or `broadcast`.
    #[serde(rename = "type")]
    pub event_type: String,
    pub from: NodeCoords,
}

/// One cluster member as returned by the queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMemberInfo {
    pub namespace: String,
    pub sys_id: String,
    pub module_id: String,
    pub server_id: String,
    pub app_name: Option<String>,
    pub master: bool,
}

/// State snapshot handed to lifecycle hooks.
#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    pub coords: NodeCoords,
    pub app_name: String,
    pub registered: bool,
    pub master: bool,
}

/// Lifecycle hook: receives a state snapshot, never the coordinator
/// lock.
pub type ClusterHook = Arc<dyn Fn(ClusterSnapshot) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone, Default)]
pub struct ClusterHooks {
    pub after_register: Option<ClusterHook>,
    pub after_deregister: Option<ClusterHook>,
    pub after_own_master: Option<ClusterHook>,
    pub after_lost_master: Option<ClusterHook>,
}

/// Event handler: `(context, event, payload)`.
pub type EventHandler = Arc<dyn Fn(EventContext, String, Value) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct ClusterCoordinator {
    kv: Arc<dyn KvStore>,
    config: ClusterConfig,
    hooks: ClusterHooks,
    /// Heartbeat only acts while this is set (armed by
    /// `register_cluster`, cleared by `deregister_cluster`).
    start_heart_beat: AtomicBool,
    registered: AtomicBool,
    master: AtomicBool,
    registered_lock: Mutex<()>,
    master_lock: Mutex<()>,
    event_handlers: DashMap<String, EventHandler>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterCoordinator {
    /// Build the coordinator and start its timers. Registration is a
    /// separate step (`register_cluster`).
    pub fn new(kv: Arc<dyn KvStore>, config: ClusterConfig, hooks: ClusterHooks) -> Arc<Self> {
        let coordinator = Arc::new(Self {
            kv,
            config,
            hooks,
            start_heart_beat: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            master: AtomicBool::new(false),
            registered_lock: Mutex::new(()),
            master_lock: Mutex::new(()),
            event_handlers: DashMap::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let heartbeat = spawn_timer(
            Arc::downgrade(&coordinator),
            Duration::from_secs_f64(coordinator.config.heart_beat),
            |this| async move { this.heartbeat_tick().await },
        );
        coordinator.tasks.lock().unwrap().push(heartbeat);

        if coordinator.config.enable_event {
            let events = spawn_timer(
                Arc::downgrade(&coordinator),
                Duration::from_secs_f64(coordinator.config.event_interval),
                |this| async move { this.event_tick().await },
            );
            coordinator.tasks.lock().unwrap().push(events);
        }

        coordinator
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn master(&self) -> bool {
        self.master.load(Ordering::SeqCst)
    }

    fn coords(&self) -> NodeCoords {
        NodeCoords {
            namespace: self.config.namespace.clone(),
            sys_id: self.config.sys_id.clone(),
            module_id: self.config.module_id.clone(),
            server_id: self.config.server_id.clone(),
        }
    }

    fn snapshot(&self) -> ClusterSnapshot {
        ClusterSnapshot {
            coords: self.coords(),
            app_name: self.config.app_name.clone(),
            registered: self.registered(),
            master: self.master(),
        }
    }

    fn lease(&self) -> Duration {
        Duration::from_secs_f64(self.config.expire)
    }

    fn info_key(&self) -> String {
        keys::info_key(
            &self.config.namespace,
            &self.config.sys_id,
            &self.config.module_id,
            &self.config.server_id,
        )
    }

    fn master_key(&self) -> String {
        keys::master_key(
            &self.config.namespace,
            &self.config.sys_id,
            &self.config.module_id,
        )
    }

    fn event_exists_key(&self) -> String {
        keys::event_exists_key(
            &self.config.namespace,
            &self.config.sys_id,
            &self.config.module_id,
            &self.config.server_id,
        )
    }

    fn event_key(&self) -> String {
        keys::event_key(
            &self.config.namespace,
            &self.config.sys_id,
            &self.config.module_id,
            &self.config.server_id,
        )
    }

    /// Stop the background timers.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    // ── public lifecycle ──

    pub async fn register_cluster(&self) -> Result<()> {
        if self.start_heart_beat.load(Ordering::SeqCst) {
            return Err(MicraError::Internal("server is registered".to_string()));
        }
        if !self.register_internal().await {
            return Err(MicraError::Store("server register error".to_string()));
        }
        self.start_heart_beat.store(true, Ordering::SeqCst);
        self.try_own_master().await;
        Ok(())
    }

    pub async fn deregister_cluster(&self) -> Result<()> {
        if !self.start_heart_beat.load(Ordering::SeqCst) {
            return Err(MicraError::Internal("server is not registered".to_string()));
        }
        self.start_heart_beat.store(false, Ordering::SeqCst);
        self.try_lost_master().await;
        if !self.deregister_internal().await {
            return Err(MicraError::Store("deregistered server failure".to_string()));
        }
        Ok(())
    }

    pub fn register_event(&self, event: &str, handler: EventHandler) -> Result<()> {
        if self.event_handlers.contains_key(event) {
            return Err(MicraError::Internal(format!(
                "event [{}] already exists",
                event
            )));
        }
        self.event_handlers.insert(event.to_string(), handler);
        Ok(())
    }

    pub fn deregister_event(&self, event: &str) {
        self.event_handlers.remove(event);
    }

    // ── queries ──

    pub async fn get_cluster_master(
        &self,
        namespace: &str,
        sys_id: &str,
        module_id: &str,
    ) -> Result<Option<ClusterMemberInfo>> {
        let master_key = keys::master_key(namespace, sys_id, module_id);
        let Some(server_id) = self.kv.get(&master_key).await? else {
            return Ok(None);
        };
        let info_key = keys::info_key(namespace, sys_id, module_id, &server_id);
        let app_name = self.kv.get(&info_key).await?;
        Ok(Some(ClusterMemberInfo {
            namespace: namespace.to_string(),
            sys_id: sys_id.to_string(),
            module_id: module_id.to_string(),
            server_id,
            app_name,
            master: true,
        }))
    }

    pub async fn get_cluster_list(
        &self,
        namespace: &str,
        sys_id: Option<&str>,
        module_id: Option<&str>,
    ) -> Result<Vec<ClusterMemberInfo>> {
        let info_keys = self
            .kv
            .keys(&keys::node_pattern(
                keys::GROUP_INFO,
                namespace,
                sys_id,
                module_id,
            ))
            .await?;

        let mut members = Vec::with_capacity(info_keys.len());
        for key in info_keys {
            let Some((ns, sys, module, server)) = keys::parse_node_key(&key) else {
                continue;
            };
            let app_name = self.kv.get(&key).await?;
            let master_holder = self.kv.get(&keys::master_key(&ns, &sys, &module)).await?;
            members.push(ClusterMemberInfo {
                master: master_holder.as_deref() == Some(server.as_str()),
                namespace: ns,
                sys_id: sys,
                module_id: module,
                server_id: server,
                app_name,
            });
        }
        Ok(members)
    }

    // ── events ──

    /// Point-to-point event: push onto the target's queue, but only
    /// when its inbox marker exists.
    pub async fn emit(
        &self,
        event: &str,
        paras: Value,
        namespace: &str,
        sys_id: &str,
        module_id: &str,
        server_id: &str,
    ) -> Result<()> {
        let exists_key = keys::event_exists_key(namespace, sys_id, module_id, server_id);
        if !self.kv.exists(&exists_key).await? {
            return Err(MicraError::EventEmitUnreachable(format!(
                "[namespace:{}] [sys_id:{}] [module_id:{}] [server_id:{}]",
                namespace, sys_id, module_id, server_id
            )));
        }

        let context = EventContext {
            event_type: "emit".to_string(),
            from: self.coords(),
        };
        let entry = serde_json::to_string(&serde_json::json!([context, event, paras]))?;
        let event_key = keys::event_key(namespace, sys_id, module_id, server_id);
        let length = self.kv.rpush(&event_key, &entry).await?;
        if length == 1 {
            // Queue was recreated; restart its lease.
            self.kv.expire(&event_key, self.lease()).await?;
        }
        Ok(())
    }

    /// Broadcast below `(namespace[, sys][, module])`: one push per
    /// listening inbox.
    pub async fn broadcast(
        &self,
        event: &str,
        paras: Value,
        namespace: &str,
        sys_id: Option<&str>,
        module_id: Option<&str>,
    ) -> Result<()> {
        let context = EventContext {
            event_type: "broadcast".to_string(),
            from: self.coords(),
        };
        let entry = serde_json::to_string(&serde_json::json!([context, event, paras]))?;

        let exists_keys = self
            .kv
            .keys(&keys::node_pattern(
                keys::GROUP_EVENT_EXISTS,
                namespace,
                sys_id,
                module_id,
            ))
            .await?;
        for exists_key in exists_keys {
            let event_key = keys::exists_to_event_key(&exists_key);
            let length = self.kv.rpush(&event_key, &entry).await?;
            if length == 1 {
                self.kv.expire(&event_key, self.lease()).await?;
            }
        }
        Ok(())
    }

    // ── internals ──

    /// Register or renew this node's keys; fires the registration
    /// hooks exactly on transitions.
    async fn register_internal(&self) -> bool {
        let _guard = self.registered_lock.lock().await;

        let ok = match self.register_storage().await {
            Ok(ok) => ok,
            Err(e) => {
                error!(error = %e, "cluster register error");
                false
            }
        };

        if ok {
            if !self.registered.swap(true, Ordering::SeqCst) {
                info!(node = ?self.coords(), "cluster registered");
                self.fire(&self.hooks.after_register.clone()).await;
            }
        } else if self.registered.swap(false, Ordering::SeqCst) {
            warn!(node = ?self.coords(), "cluster registration lost");
            self.fire(&self.hooks.after_deregister.clone()).await;
        }
        ok
    }

    /// Renew the lease; recreate the keys when they are gone.
    async fn register_storage(&self) -> Result<bool> {
        if self.kv.expire(&self.info_key(), self.lease()).await? {
            if self.config.enable_event {
                self.kv.expire(&self.event_exists_key(), self.lease()).await?;
                self.kv.expire(&self.event_key(), self.lease()).await?;
            }
            return Ok(true);
        }

        if self.config.enable_event {
            // The queue cannot be created empty, so an exists marker
            // stands in for it.
            self.kv.delete(&[self.event_key()]).await?;
            self.kv
                .set(&self.event_exists_key(), "1", Some(self.lease()))
                .await?;
        }
        self.kv
            .set(&self.info_key(), &self.config.app_name, Some(self.lease()))
            .await?;
        Ok(true)
    }

    async fn deregister_internal(&self) -> bool {
        let _guard = self.registered_lock.lock().await;
        if !self.registered.load(Ordering::SeqCst) {
            return true;
        }

        let ok = match self
            .kv
            .delete(&[self.info_key(), self.event_exists_key(), self.event_key()])
            .await
        {
            Ok(removed) => removed > 0,
            Err(e) => {
                error!(error = %e, "cluster deregister error");
                false
            }
        };

        self.registered.store(false, Ordering::SeqCst);
        info!(node = ?self.coords(), "cluster deregistered");
        self.fire(&self.hooks.after_deregister.clone()).await;
        ok
    }

    /// Race for mastership; fires the master hooks exactly on
    /// transitions.
    async fn try_own_master(&self) {
        let _guard = self.master_lock.lock().await;

        let owned = match self.try_own_master_storage().await {
            Ok(owned) => owned,
            Err(e) => {
                error!(error = %e, "try to own cluster master error");
                false
            }
        };

        if owned {
            if !self.master.swap(true, Ordering::SeqCst) {
                info!(node = ?self.coords(), "cluster master owned");
                self.fire(&self.hooks.after_own_master.clone()).await;
            }
        } else if self.master.swap(false, Ordering::SeqCst) {
            warn!(node = ?self.coords(), "cluster master lost");
            self.fire(&self.hooks.after_lost_master.clone()).await;
        }
    }

    async fn try_own_master_storage(&self) -> Result<bool> {
        let master_key = self.master_key();
        if self
            .kv
            .set_nx(&master_key, &self.config.server_id, Some(self.lease()))
            .await?
        {
            return Ok(true);
        }
        // NX failed: extend the lease when the holder is us.
        if self.kv.get(&master_key).await?.as_deref() == Some(self.config.server_id.as_str()) {
            self.kv.expire(&master_key, self.lease()).await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn try_lost_master(&self) {
        let _guard = self.master_lock.lock().await;
        if !self.master.load(Ordering::SeqCst) {
            return;
        }

        let master_key = self.master_key();
        match self.kv.get(&master_key).await {
            Ok(holder) if holder.as_deref() == Some(self.config.server_id.as_str()) => {
                if let Err(e) = self.kv.delete(&[master_key]).await {
                    error!(error = %e, "try to lost cluster master error");
                }
            }
            Err(e) => error!(error = %e, "try to lost cluster master error"),
            _ => {}
        }

        self.master.store(false, Ordering::SeqCst);
        self.fire(&self.hooks.after_lost_master.clone()).await;
    }

    async fn fire(&self, hook: &Option<ClusterHook>) {
        if let Some(hook) = hook {
            hook(self.snapshot()).await;
        }
    }

    /// One heartbeat period: renew registration, then race for
    /// mastership. Never propagates errors.
    async fn heartbeat_tick(self: Arc<Self>) {
        if !self.start_heart_beat.load(Ordering::SeqCst) {
            return;
        }
        // Re-check after renewal: a concurrent deregister must not be
        // followed by a mastership grab.
        if self.register_internal().await && self.start_heart_beat.load(Ordering::SeqCst) {
            self.try_own_master().await;
        }
    }

    /// One event-poll period: drain our queue and dispatch.
    async fn event_tick(self: Arc<Self>) {
        loop {
            let entries = match self.kv.lpop(&self.event_key(), self.config.event_each_get).await {
                Ok(entries) => entries,
                Err(e) => {
                    error!(error = %e, "cluster event poll error");
                    return;
                }
            };
            if entries.is_empty() {
                return;
            }
            for entry in entries {
                self.dispatch_event(&entry).await;
            }
        }
    }

    async fn dispatch_event(&self, raw: &str) {
        let parsed: std::result::Result<(EventContext, String, Value), _> =
            serde_json::from_str(raw);
        let (context, event, paras) = match parsed {
            Ok(parts) => parts,
            Err(e) => {
                error!(error = %e, "cluster event decode error");
                return;
            }
        };

        let Some(handler) = self.event_handlers.get(&event).map(|h| h.clone()) else {
            warn!(event = %event, "get event but not register deal func");
            return;
        };
        debug!(event = %event, from = ?context.from, "cluster event dispatched");
        handler(context, event, paras).await;
    }
}

fn spawn_timer<F, Fut>(
    coordinator: std::sync::Weak<ClusterCoordinator>,
    period: Duration,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(Arc<ClusterCoordinator>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of tokio's interval fires immediately; the
        // timer semantics want a full period first.
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(this) = coordinator.upgrade() else {
                return;
            };
            tick(this).await;
        }
    })
}

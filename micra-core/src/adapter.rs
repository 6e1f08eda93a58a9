//! Typed-id adapter instance cache. Instances are created lazily from
//! descriptors through the plugin registry and cached by
//! `(kind, id)`; `stand_alone` descriptors bypass the cache.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::Result;
use crate::plugin::{
    AdapterEntry, AdapterKind, BuildContext, PluginDescriptor, PluginRegistry, relocate_paths,
};

pub struct AdapterManager {
    registry: Arc<PluginRegistry>,
    adapters: DashMap<(AdapterKind, String), AdapterEntry>,
}

impl AdapterManager {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self {
            registry,
            adapters: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Create (or fetch the cached) adapter for `(kind, id)`.
    pub fn load(
        &self,
        ctx: &BuildContext,
        kind: AdapterKind,
        id: &str,
        descriptor: &PluginDescriptor,
    ) -> Result<AdapterEntry> {
        if let Some(existing) = self.get(kind, id) {
            return Ok(existing);
        }

        let mut descriptor = descriptor.clone();
        relocate_paths(&mut descriptor, &ctx.base_path);

        let entry = self.registry.build(ctx, self, &descriptor)?;
        if !descriptor.stand_alone {
            self.adapters.insert((kind, id.to_string()), entry.clone());
        }
        Ok(entry)
    }

    pub fn get(&self, kind: AdapterKind, id: &str) -> Option<AdapterEntry> {
        self.adapters.get(&(kind, id.to_string())).map(|e| e.clone())
    }

    /// Convenience lookup for optional adapter ids in service configs.
    pub fn get_opt(&self, kind: AdapterKind, id: Option<&str>) -> Option<AdapterEntry> {
        id.and_then(|id| self.get(kind, id))
    }

    pub fn remove(&self, kind: AdapterKind, id: &str) {
        self.adapters.remove(&(kind, id.to_string()));
    }

    pub fn remove_all(&self) {
        self.adapters.clear();
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::LoggerManager;
    use crate::plugin::{AppIdentity, TaskFn};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_ctx() -> BuildContext {
        BuildContext {
            base_path: PathBuf::from("."),
            logger_manager: Arc::new(LoggerManager::new("logs")),
            identity: AppIdentity::default(),
        }
    }

    fn counting_registry(counter: Arc<AtomicUsize>) -> Arc<PluginRegistry> {
        let registry = PluginRegistry::new();
        registry.register("counted", move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            let task: TaskFn = Arc::new(|_| Box::pin(async { Ok(()) }));
            Ok(AdapterEntry::Task(task))
        });
        Arc::new(registry)
    }

    #[test]
    fn load_caches_by_kind_and_id() {
        let counter = Arc::new(AtomicUsize::new(0));
        let manager = AdapterManager::new(counting_registry(Arc::clone(&counter)));
        let ctx = test_ctx();
        let descriptor = PluginDescriptor::named("counted");

        manager
            .load(&ctx, AdapterKind::Task, "t1", &descriptor)
            .unwrap();
        manager
            .load(&ctx, AdapterKind::Task, "t1", &descriptor)
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Different id builds again.
        manager
            .load(&ctx, AdapterKind::Task, "t2", &descriptor)
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn stand_alone_bypasses_cache() {
        let counter = Arc::new(AtomicUsize::new(0));
        let manager = AdapterManager::new(counting_registry(Arc::clone(&counter)));
        let ctx = test_ctx();
        let descriptor = PluginDescriptor {
            stand_alone: true,
            ..PluginDescriptor::named("counted")
        };

        manager
            .load(&ctx, AdapterKind::Task, "t1", &descriptor)
            .unwrap();
        manager
            .load(&ctx, AdapterKind::Task, "t1", &descriptor)
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(manager.is_empty());
    }

    #[test]
    fn remove_and_remove_all() {
        let counter = Arc::new(AtomicUsize::new(0));
        let manager = AdapterManager::new(counting_registry(counter));
        let ctx = test_ctx();
        let descriptor = PluginDescriptor::named("counted");

        manager
            .load(&ctx, AdapterKind::Task, "t1", &descriptor)
            .unwrap();
        assert!(manager.get(AdapterKind::Task, "t1").is_some());
        manager.remove(AdapterKind::Task, "t1");
        assert!(manager.get(AdapterKind::Task, "t1").is_none());

        manager
            .load(&ctx, AdapterKind::Task, "t2", &descriptor)
            .unwrap();
        manager.remove_all();
        assert!(manager.is_empty());
    }
}

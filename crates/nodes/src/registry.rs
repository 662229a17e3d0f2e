//! The node registry — maps type names to node factories.
//!
//! Registration is expected at startup (or via [`discovery`](crate::discovery));
//! the registry is read-mostly afterwards. Hot re-registration of a new
//! version is refused; re-registering the identical `(id, version)` pair is
//! a no-op so idempotent init code stays cheap.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info};

use crate::error::RegistryError;
use crate::traits::{InstanceFactory, Node, NodeFactory, NodeMetadata};

/// Options for [`NodeRegistry::register`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterOptions {
    /// Cache the first created instance and reuse it for every invocation.
    pub singleton: bool,
}

struct Registration {
    factory: Arc<dyn NodeFactory>,
    singleton: bool,
    /// Cached instance, populated on first use when `singleton` is set.
    instance: Mutex<Option<Arc<dyn Node>>>,
}

/// Type-name → factory store shared by the engine and discovery.
#[derive(Default)]
pub struct NodeRegistry {
    inner: RwLock<HashMap<String, Registration>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under its metadata id.
    ///
    /// # Errors
    /// - [`RegistryError::InvalidMetadata`] when `id`/`name`/`version` are empty.
    /// - [`RegistryError::VersionConflict`] when the id is already registered
    ///   with a different version.
    pub fn register(
        &self,
        factory: Arc<dyn NodeFactory>,
        options: RegisterOptions,
    ) -> Result<(), RegistryError> {
        let metadata = factory.metadata().clone();
        metadata.validate()?;

        let mut inner = self.inner.write().unwrap();
        if let Some(existing) = inner.get(&metadata.id) {
            let existing_version = existing.factory.metadata().version.clone();
            if existing_version == metadata.version {
                debug!(
                    node_id = %metadata.id,
                    version = %metadata.version,
                    "node already registered, skipping"
                );
                return Ok(());
            }
            return Err(RegistryError::VersionConflict {
                id: metadata.id,
                existing: existing_version,
                attempted: metadata.version,
            });
        }

        inner.insert(
            metadata.id.clone(),
            Registration {
                factory,
                singleton: options.singleton,
                instance: Mutex::new(None),
            },
        );
        info!(node_id = %metadata.id, version = %metadata.version, "registered node");
        Ok(())
    }

    /// Register an already-built instance as a singleton.
    pub fn register_singleton(&self, instance: Arc<dyn Node>) -> Result<(), RegistryError> {
        self.register(
            InstanceFactory::new(instance),
            RegisterOptions { singleton: true },
        )
    }

    /// The factory registered under `id`, if any.
    pub fn get(&self, id: &str) -> Option<Arc<dyn NodeFactory>> {
        let inner = self.inner.read().unwrap();
        inner.get(id).map(|reg| Arc::clone(&reg.factory))
    }

    /// An executable instance for `id` — fresh per call, or the cached one
    /// for singleton registrations.
    ///
    /// # Errors
    /// [`RegistryError::NotFound`] for unknown ids; factory failures are
    /// forwarded as [`RegistryError::Node`].
    pub fn get_instance(&self, id: &str) -> Result<Arc<dyn Node>, RegistryError> {
        let inner = self.inner.read().unwrap();
        let registration = inner
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        if registration.singleton {
            let mut cached = registration.instance.lock().unwrap();
            if let Some(instance) = cached.as_ref() {
                return Ok(Arc::clone(instance));
            }
            let instance = registration.factory.create()?;
            *cached = Some(Arc::clone(&instance));
            Ok(instance)
        } else {
            registration.factory.create().map_err(RegistryError::Node)
        }
    }

    pub fn get_metadata(&self, id: &str) -> Option<NodeMetadata> {
        let inner = self.inner.read().unwrap();
        inner.get(id).map(|reg| reg.factory.metadata().clone())
    }

    /// Metadata for every registered node, in no particular order.
    pub fn list_all(&self) -> Vec<NodeMetadata> {
        let inner = self.inner.read().unwrap();
        inner
            .values()
            .map(|reg| reg.factory.metadata().clone())
            .collect()
    }

    pub fn has_node(&self, id: &str) -> bool {
        let inner = self.inner.read().unwrap();
        inner.contains_key(id)
    }

    /// Remove a registration. Returns whether anything was removed.
    pub fn unregister(&self, id: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        inner.remove(id).is_some()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.clear();
    }

    pub fn size(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

/// Build an `Arc<dyn NodeFactory>` from a closure, for call sites that do not
/// want to name [`FnNodeFactory`](crate::traits::FnNodeFactory) directly.
pub fn factory_fn(
    metadata: NodeMetadata,
    build: impl Fn() -> Arc<dyn Node> + Send + Sync + 'static,
) -> Arc<dyn NodeFactory> {
    crate::traits::FnNodeFactory::new(metadata, build)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::EdgeMap;
    use crate::error::NodeError;
    use crate::traits::NodeContext;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingNode {
        metadata: NodeMetadata,
    }

    #[async_trait]
    impl Node for CountingNode {
        fn metadata(&self) -> &NodeMetadata {
            &self.metadata
        }

        async fn execute(
            &self,
            _ctx: &mut NodeContext,
            _config: &Value,
        ) -> Result<EdgeMap, NodeError> {
            Ok(EdgeMap::single("success", json!(null)))
        }
    }

    fn counting_factory(id: &str, created: Arc<AtomicUsize>) -> Arc<dyn NodeFactory> {
        let metadata = NodeMetadata::new(id, "Counting", "1.0.0");
        factory_fn(metadata.clone(), move || {
            created.fetch_add(1, Ordering::SeqCst);
            Arc::new(CountingNode {
                metadata: metadata.clone(),
            })
        })
    }

    #[test]
    fn register_and_lookup() {
        let registry = NodeRegistry::new();
        let created = Arc::new(AtomicUsize::new(0));
        registry
            .register(counting_factory("math", created), RegisterOptions::default())
            .expect("register");

        assert!(registry.has_node("math"));
        assert_eq!(registry.size(), 1);
        assert_eq!(registry.get_metadata("math").unwrap().version, "1.0.0");
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn empty_metadata_is_rejected() {
        let registry = NodeRegistry::new();
        let created = Arc::new(AtomicUsize::new(0));
        let metadata = NodeMetadata::new("", "Broken", "1.0.0");
        let factory = factory_fn(metadata.clone(), move || {
            created.fetch_add(1, Ordering::SeqCst);
            Arc::new(CountingNode { metadata: metadata.clone() })
        });

        assert!(matches!(
            registry.register(factory, RegisterOptions::default()),
            Err(RegistryError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn same_id_and_version_is_a_noop() {
        let registry = NodeRegistry::new();
        let created = Arc::new(AtomicUsize::new(0));
        registry
            .register(
                counting_factory("math", Arc::clone(&created)),
                RegisterOptions::default(),
            )
            .expect("first register");
        registry
            .register(counting_factory("math", created), RegisterOptions::default())
            .expect("re-register should be a no-op");
        assert_eq!(registry.size(), 1);
    }

    #[test]
    fn version_conflict_is_a_fault() {
        let registry = NodeRegistry::new();
        let created = Arc::new(AtomicUsize::new(0));
        registry
            .register(
                counting_factory("math", Arc::clone(&created)),
                RegisterOptions::default(),
            )
            .expect("register v1");

        let metadata = NodeMetadata::new("math", "Math", "2.0.0");
        let factory = factory_fn(metadata.clone(), move || {
            created.fetch_add(1, Ordering::SeqCst);
            Arc::new(CountingNode { metadata: metadata.clone() })
        });

        assert!(matches!(
            registry.register(factory, RegisterOptions::default()),
            Err(RegistryError::VersionConflict { .. })
        ));
    }

    #[test]
    fn singleton_instances_are_cached() {
        let registry = NodeRegistry::new();
        let created = Arc::new(AtomicUsize::new(0));
        registry
            .register(
                counting_factory("single", Arc::clone(&created)),
                RegisterOptions { singleton: true },
            )
            .expect("register");

        registry.get_instance("single").expect("first");
        registry.get_instance("single").expect("second");
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn per_call_instances_are_fresh() {
        let registry = NodeRegistry::new();
        let created = Arc::new(AtomicUsize::new(0));
        registry
            .register(
                counting_factory("fresh", Arc::clone(&created)),
                RegisterOptions::default(),
            )
            .expect("register");

        registry.get_instance("fresh").expect("first");
        registry.get_instance("fresh").expect("second");
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unregister_and_clear() {
        let registry = NodeRegistry::new();
        let created = Arc::new(AtomicUsize::new(0));
        registry
            .register(counting_factory("a", created), RegisterOptions::default())
            .expect("register");

        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert!(registry.is_empty());

        registry.clear();
        assert_eq!(registry.size(), 0);
    }
}

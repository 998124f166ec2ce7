//! Process-wide adapter directory
//!
//! Factories self-register at process start; the reconciler dispatches
//! through [`global`]. Tests construct their own [`Registry`] to avoid
//! cross-test contamination.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::error::{Error, Result};
use crate::translation::Backend;

use super::{AdapterDeps, AdapterFactory, ReplicationAdapter};

pub struct Registry {
    factories: RwLock<HashMap<Backend, Arc<dyn AdapterFactory>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Register a factory. A second registration for the same backend is an
    /// error, not a silent replacement.
    pub fn register(&self, factory: Arc<dyn AdapterFactory>) -> Result<()> {
        let backend = factory.backend();
        let mut factories = self.factories.write().expect("registry lock poisoned");
        if factories.contains_key(&backend) {
            return Err(Error::ConfigError(format!(
                "adapter factory for backend '{}' is already registered",
                backend
            )));
        }
        factories.insert(backend, factory);
        Ok(())
    }

    pub fn unregister(&self, backend: Backend) {
        self.factories
            .write()
            .expect("registry lock poisoned")
            .remove(&backend);
    }

    pub fn get(&self, backend: Backend) -> Option<Arc<dyn AdapterFactory>> {
        self.factories
            .read()
            .expect("registry lock poisoned")
            .get(&backend)
            .cloned()
    }

    pub fn list(&self) -> Vec<Backend> {
        let mut backends: Vec<_> = self
            .factories
            .read()
            .expect("registry lock poisoned")
            .keys()
            .copied()
            .collect();
        backends.sort_by_key(|b| b.as_str());
        backends
    }

    /// Instantiate an adapter for `backend`, or error when none is
    /// registered.
    pub fn create(
        &self,
        backend: Backend,
        deps: AdapterDeps,
    ) -> Result<Arc<dyn ReplicationAdapter>> {
        let factory = self.get(backend).ok_or_else(|| {
            Error::ConfigError(format!(
                "no adapter registered for backend '{}'",
                backend
            ))
        })?;
        factory.create(deps)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: Lazy<Registry> = Lazy::new(Registry::new);

/// The process-wide registry.
pub fn global() -> &'static Registry {
    &GLOBAL
}

/// Register the three built-in adapter factories with the global registry.
/// Called once from `main`; tolerant of repeat calls in tests.
pub fn register_builtin() -> Result<()> {
    for factory in [
        super::ceph::factory(),
        super::trident::factory(),
        super::dell::factory(),
    ] {
        match global().register(factory) {
            Ok(()) => {}
            Err(Error::ConfigError(msg)) if msg.contains("already registered") => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{AdapterFeature, ReplicationClassView, ReplicationIntent};
    use crate::adapters::{CompositeStatus, ReconcileOutcome};
    use async_trait::async_trait;

    struct MockAdapter(Backend);

    #[async_trait]
    impl ReplicationAdapter for MockAdapter {
        fn backend(&self) -> Backend {
            self.0
        }
        fn features(&self) -> &'static [AdapterFeature] {
            &[]
        }
        async fn reconcile(
            &self,
            _intent: &ReplicationIntent,
            _class: Option<&ReplicationClassView>,
        ) -> crate::error::Result<ReconcileOutcome> {
            Ok(ReconcileOutcome::converged())
        }
        async fn delete(&self, _intent: &ReplicationIntent) -> crate::error::Result<()> {
            Ok(())
        }
        async fn status(
            &self,
            _intent: &ReplicationIntent,
        ) -> crate::error::Result<CompositeStatus> {
            Ok(CompositeStatus::default())
        }
    }

    struct MockFactory(Backend);

    impl AdapterFactory for MockFactory {
        fn backend(&self) -> Backend {
            self.0
        }
        fn create(&self, _deps: AdapterDeps) -> Result<Arc<dyn ReplicationAdapter>> {
            Ok(Arc::new(MockAdapter(self.0)))
        }
    }

    #[test]
    fn register_get_list_unregister() {
        let registry = Registry::new();
        registry
            .register(Arc::new(MockFactory(Backend::Ceph)))
            .unwrap();
        registry
            .register(Arc::new(MockFactory(Backend::Dell)))
            .unwrap();

        assert!(registry.get(Backend::Ceph).is_some());
        assert!(registry.get(Backend::Trident).is_none());
        assert_eq!(registry.list(), vec![Backend::Ceph, Backend::Dell]);

        registry.unregister(Backend::Ceph);
        assert!(registry.get(Backend::Ceph).is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = Registry::new();
        registry
            .register(Arc::new(MockFactory(Backend::Trident)))
            .unwrap();
        let err = registry
            .register(Arc::new(MockFactory(Backend::Trident)))
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn fresh_registries_do_not_share_state() {
        let a = Registry::new();
        let b = Registry::new();
        a.register(Arc::new(MockFactory(Backend::Ceph))).unwrap();
        assert!(b.get(Backend::Ceph).is_none());
    }
}

//! Capability registry: contract id to prototype.
//!
//! The registry stores one *prototype* per contract id. Prototypes are never
//! configured or started; callers ask the prototype for a fresh instance via
//! [`Capability::new_instance`] (or [`CapabilityRegistry::new_instance`]).
//!
//! A process-wide registry is available through [`CapabilityRegistry::global`],
//! but nothing registers itself implicitly: hosts call
//! [`register_builtin`](crate::register_builtin) or [`add_capability`] at
//! startup.
//!
//! [`add_capability`]: CapabilityRegistry::add_capability

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use thiserror::Error;

use super::capability::Capability;

static GLOBAL_REGISTRY: Lazy<CapabilityRegistry> = Lazy::new(CapabilityRegistry::new);

/// Errors returned by registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A prototype is already registered under this contract id. The first
    /// registration stays authoritative.
    #[error("capability already registered: {0}")]
    DuplicateContract(String),

    /// No prototype is registered under this contract id.
    #[error("capability not registered: {0}")]
    NotFound(String),
}

/// Contract id → prototype table.
#[derive(Default)]
pub struct CapabilityRegistry {
    prototypes: RwLock<HashMap<String, Arc<dyn Capability>>>,
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("contract_ids", &self.contract_ids())
            .finish()
    }
}

impl CapabilityRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static CapabilityRegistry {
        &GLOBAL_REGISTRY
    }

    /// Register `capability` as the prototype for its contract id.
    ///
    /// Duplicate ids are rejected with [`RegistryError::DuplicateContract`].
    pub fn add_capability<C: Capability>(&self, capability: C) -> Result<(), RegistryError> {
        self.add_prototype(Arc::new(capability))
    }

    /// Register an already type-erased prototype.
    pub fn add_prototype(&self, capability: Arc<dyn Capability>) -> Result<(), RegistryError> {
        let id = capability.contract_id().to_string();
        let mut prototypes = self.prototypes.write();
        if prototypes.contains_key(&id) {
            log::warn!("rejecting duplicate capability registration: {}", id);
            return Err(RegistryError::DuplicateContract(id));
        }
        log::debug!(
            "registered capability {} ({} {})",
            id,
            capability.name(),
            capability.version()
        );
        prototypes.insert(id, capability);
        Ok(())
    }

    /// The prototype registered under `contract_id`.
    ///
    /// Call `new_instance()` on the result before configuring anything; the
    /// prototype itself is shared by every caller.
    pub fn get_capability(&self, contract_id: &str) -> Option<Arc<dyn Capability>> {
        self.prototypes.read().get(contract_id).cloned()
    }

    /// Fresh instance of the capability registered under `contract_id`.
    pub fn new_instance(&self, contract_id: &str) -> Result<Box<dyn Capability>, RegistryError> {
        self.get_capability(contract_id)
            .map(|prototype| prototype.new_instance())
            .ok_or_else(|| RegistryError::NotFound(contract_id.to_string()))
    }

    /// Whether `contract_id` is registered.
    pub fn contains(&self, contract_id: &str) -> bool {
        self.prototypes.read().contains_key(contract_id)
    }

    /// Registered contract ids, sorted.
    pub fn contract_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.prototypes.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of registered prototypes.
    pub fn len(&self) -> usize {
        self.prototypes.read().len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.prototypes.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::capability::{CapabilityError, LifecycleState};
    use crate::config::ConfigMap;
    use crate::context::Context;
    use crate::events::{Event, EventTransmitter};
    use async_trait::async_trait;
    use std::any::Any;

    #[derive(Default)]
    struct Dummy {
        id: &'static str,
        cm: ConfigMap,
        state: Option<LifecycleState>,
    }

    #[async_trait]
    impl Capability for Dummy {
        fn name(&self) -> &str {
            "dummy"
        }
        fn version(&self) -> &str {
            "1.0.0"
        }
        fn category(&self) -> &str {
            "test"
        }
        fn contract_id(&self) -> &str {
            self.id
        }
        fn new_instance(&self) -> Box<dyn Capability> {
            Box::new(Dummy {
                id: self.id,
                ..Default::default()
            })
        }
        fn state(&self) -> LifecycleState {
            self.state.unwrap_or(LifecycleState::Unconfigured)
        }
        fn set_config_map(&mut self, cm: ConfigMap) -> Result<(), CapabilityError> {
            self.cm = cm;
            self.state = Some(LifecycleState::Configured);
            Ok(())
        }
        fn config_map(&self) -> &ConfigMap {
            &self.cm
        }
        async fn setup(&mut self) -> Result<(), CapabilityError> {
            Ok(())
        }
        async fn start(&mut self, _: &Context) -> Result<(), CapabilityError> {
            Ok(())
        }
        async fn stop(&mut self, _: &Context) -> Result<(), CapabilityError> {
            Ok(())
        }
        fn set_event_transmitter(
            &mut self,
            _: Option<Arc<dyn EventTransmitter>>,
        ) -> Result<(), CapabilityError> {
            Ok(())
        }
        fn event_transmitter(&self) -> Option<Arc<dyn EventTransmitter>> {
            None
        }
        fn transmit_input_event(&self, _: &str, _: Event) -> Result<(), CapabilityError> {
            Ok(())
        }
        fn transmit_output_event(&self, _: &str, _: Event) -> Result<(), CapabilityError> {
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn dummy(id: &'static str) -> Dummy {
        Dummy {
            id,
            ..Default::default()
        }
    }

    #[test]
    fn test_register_and_get() {
        let registry = CapabilityRegistry::new();
        registry.add_capability(dummy("test:a")).unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.contains("test:a"));
        let proto = registry.get_capability("test:a").unwrap();
        assert_eq!(proto.contract_id(), "test:a");
        assert!(registry.get_capability("test:b").is_none());
    }

    #[test]
    fn test_duplicate_is_rejected_and_first_wins() {
        let registry = CapabilityRegistry::new();
        registry.add_capability(dummy("test:a")).unwrap();
        let err = registry.add_capability(dummy("test:a")).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateContract("test:a".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_new_instance_is_independent_of_prototype() {
        let registry = CapabilityRegistry::new();
        registry.add_capability(dummy("test:a")).unwrap();

        let mut first = registry.new_instance("test:a").unwrap();
        let second = registry.new_instance("test:a").unwrap();
        first
            .set_config_map(ConfigMap::from_pairs([("k", "v")]))
            .unwrap();

        assert_eq!(first.state(), LifecycleState::Configured);
        assert_eq!(second.state(), LifecycleState::Unconfigured);
        assert!(second.config_map().is_empty());

        let proto = registry.get_capability("test:a").unwrap();
        assert_eq!(proto.state(), LifecycleState::Unconfigured);
        assert!(proto.config_map().is_empty());
    }

    #[test]
    fn test_new_instance_unknown_id() {
        let registry = CapabilityRegistry::new();
        let err = registry.new_instance("nope").unwrap_err();
        assert_eq!(err, RegistryError::NotFound("nope".to_string()));
    }

    #[test]
    fn test_contract_ids_sorted() {
        let registry = CapabilityRegistry::new();
        registry.add_capability(dummy("z:last")).unwrap();
        registry.add_capability(dummy("a:first")).unwrap();
        assert_eq!(registry.contract_ids(), vec!["a:first", "z:last"]);
    }
}

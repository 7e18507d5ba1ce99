//! Manifest-driven capability host.
//!
//! [`Host::from_manifest`] resolves every manifest entry against a
//! [`CapabilityRegistry`], configures and sets up each instance in manifest
//! order. [`Host::start_all`] starts them in that order and
//! [`Host::stop_all`] stops them in reverse.

use std::sync::Arc;

use thiserror::Error;

use crate::capabilities::{Capability, CapabilityError, CapabilityRegistry, RegistryError};
use crate::context::Context;
use crate::events::EventTransmitter;
use crate::manifest::Manifest;

/// Errors raised while assembling or driving a host.
#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{contract_id}: {source}")]
    Capability {
        contract_id: String,
        #[source]
        source: CapabilityError,
    },
}

impl HostError {
    fn capability(contract_id: &str, source: CapabilityError) -> Self {
        Self::Capability {
            contract_id: contract_id.to_string(),
            source,
        }
    }

    /// Contract id of the capability that failed, if any.
    pub fn contract_id(&self) -> Option<&str> {
        match self {
            HostError::Registry(RegistryError::NotFound(id))
            | HostError::Registry(RegistryError::DuplicateContract(id)) => Some(id.as_str()),
            HostError::Capability { contract_id, .. } => Some(contract_id.as_str()),
        }
    }
}

/// Owns the capability instances named by one manifest.
pub struct Host {
    name: String,
    instances: Vec<Box<dyn Capability>>,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.name)
            .field("instances", &self.instances)
            .finish()
    }
}

impl Host {
    /// Instantiate, configure and set up every capability in `manifest`.
    ///
    /// Stops at the first failure. Nothing has been started at that point so
    /// the partially built instances are simply dropped.
    pub async fn from_manifest(
        registry: &CapabilityRegistry,
        manifest: &Manifest,
    ) -> Result<Self, HostError> {
        let mut instances = Vec::with_capacity(manifest.capabilities.len());
        for entry in &manifest.capabilities {
            let id = entry.contract_id.as_str();
            let mut instance = registry.new_instance(id)?;
            instance
                .set_config_map(entry.values.clone())
                .map_err(|e| HostError::capability(id, e))?;
            instance
                .setup()
                .await
                .map_err(|e| HostError::capability(id, e))?;
            log::debug!(
                "{} set up ({} {})",
                id,
                instance.name(),
                instance.version()
            );
            instances.push(instance);
        }
        log::info!(
            "host {} assembled {} capabilities",
            manifest.name,
            instances.len()
        );
        Ok(Self {
            name: manifest.name.clone(),
            instances,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Contract ids in manifest order.
    pub fn contract_ids(&self) -> Vec<&str> {
        self.instances.iter().map(|c| c.contract_id()).collect()
    }

    /// Install `transmitter` on every instance.
    pub fn set_event_transmitter(
        &mut self,
        transmitter: Option<Arc<dyn EventTransmitter>>,
    ) -> Result<(), HostError> {
        for instance in &mut self.instances {
            let id = instance.contract_id().to_string();
            instance
                .set_event_transmitter(transmitter.clone())
                .map_err(|e| HostError::capability(&id, e))?;
        }
        Ok(())
    }

    /// Start every instance in manifest order. If one fails, the ones
    /// already started are stopped again before the error is returned.
    pub async fn start_all(&mut self, ctx: &Context) -> Result<(), HostError> {
        for i in 0..self.instances.len() {
            let result = self.instances[i].start(ctx).await;
            let id = self.instances[i].contract_id().to_string();
            match result {
                Ok(()) => log::info!("{} started", id),
                Err(e) => {
                    log::error!("{} failed to start: {}", id, e);
                    for started in self.instances[..i].iter_mut().rev() {
                        if let Err(stop_err) = started.stop(ctx).await {
                            log::warn!("{} failed to stop: {}", started.contract_id(), stop_err);
                        }
                    }
                    // the failed instance may hold a half-acquired resource
                    if let Err(stop_err) = self.instances[i].stop(ctx).await {
                        log::warn!("{} failed to stop: {}", id, stop_err);
                    }
                    return Err(HostError::capability(&id, e));
                }
            }
        }
        Ok(())
    }

    /// Stop every instance in reverse manifest order. Every instance is
    /// stopped even when an earlier one fails; the first error is returned.
    pub async fn stop_all(&mut self, ctx: &Context) -> Result<(), HostError> {
        let mut first_error = None;
        for instance in self.instances.iter_mut().rev() {
            let id = instance.contract_id().to_string();
            match instance.stop(ctx).await {
                Ok(()) => log::info!("{} stopped", id),
                Err(e) => {
                    log::error!("{} failed to stop: {}", id, e);
                    first_error.get_or_insert(HostError::capability(&id, e));
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The instance for `contract_id`.
    pub fn capability(&self, contract_id: &str) -> Option<&dyn Capability> {
        self.instances
            .iter()
            .find(|c| c.contract_id() == contract_id)
            .map(|c| &**c)
    }

    /// The instance for `contract_id` as its concrete type.
    pub fn get<T: Capability>(&self, contract_id: &str) -> Option<&T> {
        self.capability(contract_id)?.as_any().downcast_ref::<T>()
    }

    pub fn get_mut<T: Capability>(&mut self, contract_id: &str) -> Option<&mut T> {
        self.instances
            .iter_mut()
            .find(|c| c.contract_id() == contract_id)?
            .as_any_mut()
            .downcast_mut::<T>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::LifecycleState;
    use crate::events::ChannelTransmitter;
    use crate::kv::{KvCapability, MemoryBackend};
    use crate::metric::MetricCapability;
    use crate::nats::NatsCapability;
    use crate::process::testing::RecordingLauncher;
    use std::time::Duration;

    const MANIFEST: &str = r#"
name: orders
capabilities:
  - contract_id: capkit:nats-server
    values:
      port: 4333
      jetstream: true
  - contract_id: capkit:nats-metric
    values:
      url: http://localhost:8222
      get_jsz_filter: all
  - contract_id: capkit:kv
    values:
      kv_bucket: orders
"#;

    fn registry(launcher: &Arc<RecordingLauncher>, dir: &std::path::Path) -> CapabilityRegistry {
        let registry = CapabilityRegistry::new();
        registry
            .add_capability(NatsCapability::with_launcher(launcher.clone()).with_runtime_dir(dir))
            .unwrap();
        registry
            .add_capability(MetricCapability::with_launcher(launcher.clone()))
            .unwrap();
        registry
            .add_capability(KvCapability::with_connector(Arc::new(MemoryBackend::new())))
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_host_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = RecordingLauncher::new();
        let registry = registry(&launcher, dir.path());
        let manifest = Manifest::from_yaml_str(MANIFEST).unwrap();
        let ctx = Context::background();

        let mut host = Host::from_manifest(&registry, &manifest).await.unwrap();
        assert_eq!(host.name(), "orders");
        assert_eq!(
            host.contract_ids(),
            vec!["capkit:nats-server", "capkit:nats-metric", "capkit:kv"]
        );
        assert!(host
            .capability("capkit:kv")
            .map(|c| c.state() == LifecycleState::SetUp)
            .unwrap_or(false));

        host.start_all(&ctx).await.unwrap();
        let launches = launcher.launches();
        assert_eq!(launches.len(), 2);
        assert_eq!(launches[0].program, "nats-server");
        assert_eq!(launches[1].program, "prometheus-nats-exporter");

        let kv = host.get::<KvCapability>("capkit:kv").unwrap();
        kv.set(&ctx, "order-1", &"pending", Duration::ZERO)
            .await
            .unwrap();
        let got: String = kv.get(&ctx, "order-1").await.unwrap();
        assert_eq!(got, "pending");
        assert!(host.get::<NatsCapability>("capkit:kv").is_none());

        host.stop_all(&ctx).await.unwrap();
        assert_eq!(launcher.stop_count(), 2);
        for id in host.contract_ids() {
            assert_eq!(
                host.capability(id).unwrap().state(),
                LifecycleState::Stopped
            );
        }
        assert!(!host.get::<KvCapability>("capkit:kv").unwrap().is_resolved());
    }

    #[tokio::test]
    async fn test_unknown_contract_fails() {
        let registry = CapabilityRegistry::new();
        let manifest =
            Manifest::from_yaml_str("name: x\ncapabilities:\n  - contract_id: capkit:kv\n")
                .unwrap();
        let err = Host::from_manifest(&registry, &manifest).await.unwrap_err();
        assert!(matches!(err, HostError::Registry(RegistryError::NotFound(_))));
        assert_eq!(err.contract_id(), Some("capkit:kv"));
    }

    #[tokio::test]
    async fn test_missing_encoding_fails_setup() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&RecordingLauncher::new(), dir.path());
        let manifest = Manifest::from_yaml_str(
            "name: x\ncapabilities:\n  - contract_id: capkit:kv\n    values:\n      encoding: protobuf\n",
        )
        .unwrap();
        let err = Host::from_manifest(&registry, &manifest).await.unwrap_err();
        assert!(matches!(
            err,
            HostError::Capability {
                source: CapabilityError::EncodingNotFound(ref name),
                ..
            } if name == "protobuf"
        ));
    }

    #[tokio::test]
    async fn test_failed_start_stops_started_instances() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = RecordingLauncher::new();
        let registry = CapabilityRegistry::new();
        registry
            .add_capability(
                NatsCapability::with_launcher(launcher.clone()).with_runtime_dir(dir.path()),
            )
            .unwrap();
        registry
            .add_capability(MetricCapability::with_launcher(RecordingLauncher::failing()))
            .unwrap();
        let manifest = Manifest::from_yaml_str(
            "name: x\ncapabilities:\n  - contract_id: capkit:nats-server\n  - contract_id: capkit:nats-metric\n    values:\n      url: http://localhost:8222\n",
        )
        .unwrap();

        let mut host = Host::from_manifest(&registry, &manifest).await.unwrap();
        let err = host.start_all(&Context::background()).await.unwrap_err();
        assert_eq!(err.contract_id(), Some("capkit:nats-metric"));
        assert_eq!(launcher.launches().len(), 1);
        assert_eq!(launcher.stop_count(), 1);
        assert!(!host
            .get::<NatsCapability>("capkit:nats-server")
            .unwrap()
            .is_running());
    }

    #[tokio::test]
    async fn test_transmitter_installed_on_all() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&RecordingLauncher::new(), dir.path());
        let manifest = Manifest::from_yaml_str(MANIFEST).unwrap();
        let mut host = Host::from_manifest(&registry, &manifest).await.unwrap();

        let (transmitter, mut rx) = ChannelTransmitter::new(8);
        host.set_event_transmitter(Some(Arc::new(transmitter)))
            .unwrap();
        for id in host.contract_ids() {
            assert!(host.capability(id).unwrap().event_transmitter().is_some());
        }

        let ctx = Context::background();
        let kv = host.get::<KvCapability>("capkit:kv").unwrap();
        kv.set(&ctx, "k", &1, Duration::ZERO).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.event.kind, "kv.set");
    }
}

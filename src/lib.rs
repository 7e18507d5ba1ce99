//! # capkit
//!
//! Pluggable capabilities behind one lifecycle contract: a `nats-server`
//! process, a Prometheus exporter for it, and a config-driven key-value store
//! over a bucket-oriented backend.
//!
//! A host registers capability prototypes, builds fresh instances from a
//! manifest, and drives each through
//! `set_config_map` → `setup` → `start` → `stop`.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use capkit::{Capability, CapabilityRegistry, ConfigMap, Context, KvCapability};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = CapabilityRegistry::new();
//! capkit::register_builtin(&registry);
//!
//! let mut kv = KvCapability::new();
//! kv.set_config_map(ConfigMap::from_pairs([("kv_bucket", "orders")]))?;
//! kv.setup().await?;
//!
//! let ctx = Context::with_timeout(Duration::from_secs(5));
//! kv.set(&ctx, "order-1", &"pending", Duration::ZERO).await?;
//! let status: String = kv.get(&ctx, "order-1").await?;
//! # Ok(())
//! # }
//! ```

pub mod capabilities;
pub mod config;
pub mod context;
pub mod encoding;
pub mod events;
pub mod host;
pub mod kv;
pub mod manifest;
pub mod metric;
pub mod nats;
pub mod policy;
pub mod process;

pub use capabilities::{Capability, CapabilityError, CapabilityRegistry, LifecycleState, RegistryError};
pub use config::{ConfigError, ConfigMap};
pub use context::{Context, ContextError};
pub use encoding::{Encoding, EncodingError, EncodingRegistry};
pub use events::{ChannelTransmitter, Direction, Event, EventTransmitter, TransmitError};
pub use host::{Host, HostError};
pub use kv::{KvCapability, KvError};
pub use manifest::{Manifest, ManifestEntry, ManifestError};
pub use metric::MetricCapability;
pub use nats::NatsCapability;
pub use policy::{AllowAll, Authorizer};

/// Version reported by every built-in capability.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Register the built-in capabilities with `registry`.
///
/// Contract ids that are already registered keep their existing prototype.
pub fn register_builtin(registry: &CapabilityRegistry) {
    let builtins: [std::sync::Arc<dyn Capability>; 3] = [
        std::sync::Arc::new(NatsCapability::new()),
        std::sync::Arc::new(MetricCapability::new()),
        std::sync::Arc::new(KvCapability::new()),
    ];
    for prototype in builtins {
        if registry.contains(prototype.contract_id()) {
            log::debug!("{} already registered, keeping it", prototype.contract_id());
            continue;
        }
        if let Err(e) = registry.add_prototype(prototype) {
            log::debug!("skipping built-in: {}", e);
        }
    }
}

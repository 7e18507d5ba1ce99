//! # Capabilities
//!
//! The lifecycle contract shared by every pluggable unit and the registry
//! hosts resolve them from.
//!
//! ## Resolution flow
//!
//! 1. At startup the host registers prototypes (`register_builtin`).
//! 2. For each manifest entry, `CapabilityRegistry::new_instance(contract_id)`
//!    yields a fresh, unconfigured instance.
//! 3. The host applies `set_config_map`, then `setup`, then `start`.
//! 4. On shutdown the host calls `stop` on every instance.

pub mod capability;
pub mod registry;

pub use capability::{Capability, CapabilityError, LifecycleState};
pub use registry::{CapabilityRegistry, RegistryError};

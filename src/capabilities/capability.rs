//! The capability contract.
//!
//! A capability is a pluggable unit (a key-value store, a server process, a
//! metrics exporter) that a host drives through one lifecycle:
//!
//! ```text
//! new_instance() -> Unconfigured
//!   set_config_map() -> Configured     (repeatable until setup)
//!   setup()          -> SetUp          (collaborators resolved)
//!   start()          -> Running
//!   stop()           -> Stopped        (start() may follow again)
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{ConfigError, ConfigMap};
use crate::context::{Context, ContextError};
use crate::events::{Event, EventTransmitter, TransmitError};
use crate::policy::Authorizer;
use crate::process::ProcessError;

/// Implicit lifecycle position of a capability instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Unconfigured,
    Configured,
    SetUp,
    Running,
    Stopped,
}

impl LifecycleState {
    /// Whether configuration may still be (re)applied.
    pub fn accepts_config(self) -> bool {
        matches!(self, LifecycleState::Unconfigured | LifecycleState::Configured)
    }

    /// Whether `setup` has completed at some point.
    pub fn is_set_up(self) -> bool {
        matches!(
            self,
            LifecycleState::SetUp | LifecycleState::Running | LifecycleState::Stopped
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Unconfigured => "unconfigured",
            LifecycleState::Configured => "configured",
            LifecycleState::SetUp => "set_up",
            LifecycleState::Running => "running",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by lifecycle methods.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// A configuration value was malformed.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The requested lifecycle step is not valid from the current state.
    #[error("invalid lifecycle transition: {from} -> {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    /// The configured encoding is not registered.
    #[error("encoding not found: {0}")]
    EncodingNotFound(String),

    /// A collaborator required by setup is unavailable.
    #[error("setup failed: {0}")]
    Setup(String),

    /// A managed process could not be launched or stopped.
    #[error("process error: {0}")]
    Process(#[from] ProcessError),

    /// The call context expired.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// Event transmission failed synchronously.
    #[error("event transmission error: {0}")]
    Transmit(#[from] TransmitError),

    /// An authorizer was attached to a method the capability does not expose.
    #[error("unknown method for authorization: {0}")]
    UnknownMethod(String),
}

/// The polymorphic contract every pluggable unit implements.
#[async_trait]
pub trait Capability: Send + Sync + 'static {
    /// Human-readable name.
    fn name(&self) -> &str;

    /// Build version of the capability.
    fn version(&self) -> &str;

    /// Category, e.g. `"kv"` or `"server"`.
    fn category(&self) -> &str;

    /// Globally unique registry key.
    fn contract_id(&self) -> &str;

    /// A fresh, unconfigured instance sharing no mutable state with `self`.
    fn new_instance(&self) -> Box<dyn Capability>;

    /// Current lifecycle state.
    fn state(&self) -> LifecycleState;

    /// Copy recognised keys from `cm`, applying defaults for absent ones.
    fn set_config_map(&mut self, cm: ConfigMap) -> Result<(), CapabilityError>;

    /// The configuration last applied.
    fn config_map(&self) -> &ConfigMap;

    /// One-time preparation from the applied configuration.
    async fn setup(&mut self) -> Result<(), CapabilityError>;

    /// Begin active operation.
    async fn start(&mut self, ctx: &Context) -> Result<(), CapabilityError>;

    /// End active operation and release everything acquired so far. Safe
    /// to call when `start` never ran.
    async fn stop(&mut self, ctx: &Context) -> Result<(), CapabilityError>;

    /// Install or clear the event transmitter.
    fn set_event_transmitter(
        &mut self,
        transmitter: Option<Arc<dyn EventTransmitter>>,
    ) -> Result<(), CapabilityError>;

    /// The installed event transmitter, if any.
    fn event_transmitter(&self) -> Option<Arc<dyn EventTransmitter>>;

    /// Forward an input event without waiting for delivery.
    fn transmit_input_event(&self, contract_id: &str, event: Event) -> Result<(), CapabilityError>;

    /// Forward an output event without waiting for delivery.
    fn transmit_output_event(&self, contract_id: &str, event: Event) -> Result<(), CapabilityError>;

    /// Attach an authorizer to `method`. The default accepts and ignores it.
    fn add_authorizer(
        &mut self,
        _authorizer: Arc<dyn Authorizer>,
        _expression: &str,
        _method: &str,
    ) -> Result<(), CapabilityError> {
        Ok(())
    }

    /// Downcasting support for hosts that need the concrete type.
    fn as_any(&self) -> &dyn Any;

    /// Mutable downcasting support.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl fmt::Debug for dyn Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.name())
            .field("version", &self.version())
            .field("contract_id", &self.contract_id())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(LifecycleState::Unconfigured.accepts_config());
        assert!(LifecycleState::Configured.accepts_config());
        assert!(!LifecycleState::SetUp.accepts_config());
        assert!(!LifecycleState::Configured.is_set_up());
        assert!(LifecycleState::Stopped.is_set_up());
    }

    #[test]
    fn test_transition_error_message() {
        let err = CapabilityError::InvalidTransition {
            from: LifecycleState::Unconfigured,
            to: LifecycleState::SetUp,
        };
        assert_eq!(
            err.to_string(),
            "invalid lifecycle transition: unconfigured -> set_up"
        );
    }
}

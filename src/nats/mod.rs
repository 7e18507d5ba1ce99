//! # Message-bus server capability
//!
//! Starts and stops a `nats-server` process and forwards its configuration.
//! Routing, persistence and the wire protocol belong to the server binary.

pub mod capability;
pub mod options;

pub use capability::NatsCapability;
pub use options::ServerOptions;

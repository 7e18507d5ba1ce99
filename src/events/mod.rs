//! Event transmission fabric.
//!
//! Capabilities report business events (a key written, a server started) as
//! [`Event`]s. Delivery goes through an injected [`EventTransmitter`]; each
//! capability reaches it through an [`EventRelay`], which hands the event to
//! a detached task so the originating call never waits on, or fails because
//! of, delivery.

pub mod event;
pub mod transmitter;

pub use event::{Direction, Event};
pub use transmitter::{
    ChannelTransmitter, EventRelay, EventTransmitter, RelayIdentity, TransmitError,
    TransmittedEvent,
};

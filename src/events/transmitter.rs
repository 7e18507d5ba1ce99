//! Event transmission: the injected fabric and the fire-and-forget relay
//! capabilities use to reach it.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use super::event::{Direction, Event};

/// Errors reported by an [`EventTransmitter`].
#[derive(Debug, Clone, Error)]
pub enum TransmitError {
    /// The fabric cannot accept events right now.
    #[error("transmitter unavailable: {0}")]
    Unavailable(String),

    /// The fabric refused this event.
    #[error("event rejected: {0}")]
    Rejected(String),

    /// Delivery failed after the event was accepted.
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// The collaborator that forwards capability events elsewhere.
#[async_trait]
pub trait EventTransmitter: Send + Sync {
    /// Forward an event received by the capability identified by `contract_id`.
    async fn transmit_input_event(&self, contract_id: &str, event: Event) -> Result<(), TransmitError>;

    /// Forward an event produced by the capability identified by `contract_id`.
    async fn transmit_output_event(&self, contract_id: &str, event: Event) -> Result<(), TransmitError>;
}

/// Identity attached to transmission failure logs.
#[derive(Debug, Clone, Copy)]
pub struct RelayIdentity<'a> {
    pub name: &'a str,
    pub version: &'a str,
    pub contract_id: &'a str,
}

/// Per-instance holder for an optional transmitter.
///
/// Sends never block the caller and never fail: the event is handed to a
/// detached task and any delivery error ends up in the log.
#[derive(Clone, Default)]
pub struct EventRelay {
    transmitter: Option<Arc<dyn EventTransmitter>>,
}

impl std::fmt::Debug for EventRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRelay")
            .field("configured", &self.transmitter.is_some())
            .finish()
    }
}

impl EventRelay {
    /// Install or clear the transmitter.
    pub fn set(&mut self, transmitter: Option<Arc<dyn EventTransmitter>>) {
        self.transmitter = transmitter;
    }

    /// Current transmitter, if any.
    pub fn get(&self) -> Option<Arc<dyn EventTransmitter>> {
        self.transmitter.clone()
    }

    /// Hand `event` off for delivery and return immediately.
    pub fn transmit(
        &self,
        identity: RelayIdentity<'_>,
        direction: Direction,
        contract_id: &str,
        event: Event,
    ) {
        let Some(transmitter) = self.transmitter.clone() else {
            return;
        };

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                log::warn!(
                    "dropping {} event {}: no async runtime (name={}, version={}, contract_id={})",
                    direction,
                    event.id,
                    identity.name,
                    identity.version,
                    identity.contract_id
                );
                return;
            }
        };

        let name = identity.name.to_string();
        let version = identity.version.to_string();
        let source = identity.contract_id.to_string();
        let target = contract_id.to_string();

        handle.spawn(async move {
            let event_id = event.id.clone();
            let result = match direction {
                Direction::Input => transmitter.transmit_input_event(&target, event).await,
                Direction::Output => transmitter.transmit_output_event(&target, event).await,
            };
            if let Err(e) = result {
                log::error!(
                    "{} event {} not delivered: {} (name={}, version={}, contract_id={})",
                    direction,
                    event_id,
                    e,
                    name,
                    version,
                    source
                );
            }
        });
    }
}

/// An event accepted by a [`ChannelTransmitter`].
#[derive(Debug, Clone)]
pub struct TransmittedEvent {
    pub direction: Direction,
    pub contract_id: String,
    pub event: Event,
}

/// Transmitter backed by a bounded queue; a separate worker drains the
/// receiving end.
#[derive(Debug, Clone)]
pub struct ChannelTransmitter {
    sender: mpsc::Sender<TransmittedEvent>,
}

impl ChannelTransmitter {
    /// Create a transmitter and the receiver its events arrive on.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TransmittedEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    fn enqueue(&self, direction: Direction, contract_id: &str, event: Event) -> Result<(), TransmitError> {
        self.sender
            .try_send(TransmittedEvent {
                direction,
                contract_id: contract_id.to_string(),
                event,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    TransmitError::Unavailable("event queue full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    TransmitError::Unavailable("event queue closed".to_string())
                }
            })
    }
}

#[async_trait]
impl EventTransmitter for ChannelTransmitter {
    async fn transmit_input_event(&self, contract_id: &str, event: Event) -> Result<(), TransmitError> {
        self.enqueue(Direction::Input, contract_id, event)
    }

    async fn transmit_output_event(&self, contract_id: &str, event: Event) -> Result<(), TransmitError> {
        self.enqueue(Direction::Output, contract_id, event)
    }
}

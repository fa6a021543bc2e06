//! Broker Channel Abstraction
//!
//! The consumer core only needs a narrow slice of a broker client: a
//! non-blocking "fetch one message now" primitive plus acknowledgement
//! calls. This module defines that contract and ships an in-memory
//! implementation used by the binary and the tests.

pub mod memory;

use thiserror::Error;

pub use memory::InMemoryBroker;

/// Opaque identifier of one fetched message, used for acknowledgement
pub type DeliveryTag = u64;

/// Errors reported by a channel
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The channel or its connection has been shut down
    #[error("Channel has been shut down")]
    Shutdown,

    /// Any other transport failure
    #[error("Channel operation failed: {message}")]
    Failed { message: String },
}

impl TransportError {
    /// Create a generic transport failure
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Whether this error is the expected signal of a closing channel
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

/// Delivery metadata attached by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub delivery_tag: DeliveryTag,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

/// A message handed out by `basic_get`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub envelope: Envelope,
    pub reply_to: Option<String>,
    pub body: Vec<u8>,
}

/// Broker operations the consumer core relies on
pub trait Channel: Send + Sync {
    /// Fetch one message from `queue` if one is available. Must not block.
    ///
    /// With `auto_ack` the broker considers the message acknowledged as soon
    /// as it is handed out.
    fn basic_get(&self, queue: &str, auto_ack: bool) -> Result<Option<Delivery>, TransportError>;

    /// Acknowledge a delivery (and all earlier ones when `multiple` is set)
    fn basic_ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<(), TransportError>;

    /// Reject a delivery, optionally putting it back on its queue
    fn basic_nack(&self, delivery_tag: DeliveryTag, multiple: bool, requeue: bool) -> Result<(), TransportError>;
}

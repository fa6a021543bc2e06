//! Destinations and Received Messages

use serde::{Deserialize, Serialize};
use crate::broker::{Delivery, DeliveryTag};

/// Reserved queue name for direct replies; never requeueable
pub const DIRECT_REPLY_TO: &str = "amq.rabbitmq.reply-to";

/// Queue-style or topic-style addressing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    Queue,
    Topic,
}

/// Where a consumer reads from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    name: String,
    kind: DestinationKind,
    /// Maps straight onto a broker queue, bypassing messaging-level naming
    amqp: bool,
    amqp_queue_name: String,
}

impl Destination {
    /// A queue destination backed by a broker queue of the same name
    pub fn queue(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            amqp_queue_name: name.clone(),
            name,
            kind: DestinationKind::Queue,
            amqp: false,
        }
    }

    /// A topic destination; each consumer reads its own broker queue
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Topic,
            amqp: false,
            amqp_queue_name: String::new(),
        }
    }

    /// A destination addressing a broker queue directly
    pub fn amqp_queue(queue_name: impl Into<String>) -> Self {
        let queue_name = queue_name.into();
        Self {
            name: queue_name.clone(),
            kind: DestinationKind::Queue,
            amqp: true,
            amqp_queue_name: queue_name,
        }
    }

    /// The direct reply-to pseudo queue
    pub fn direct_reply_to() -> Self {
        Self::amqp_queue(DIRECT_REPLY_TO)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DestinationKind {
        self.kind
    }

    pub fn is_queue(&self) -> bool {
        self.kind == DestinationKind::Queue
    }

    pub fn is_amqp(&self) -> bool {
        self.amqp
    }

    pub fn amqp_queue_name(&self) -> &str {
        &self.amqp_queue_name
    }

    pub fn is_direct_reply_to(&self) -> bool {
        self.amqp && self.name == DIRECT_REPLY_TO
    }
}

/// A message handed to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub delivery_tag: DeliveryTag,
    pub destination: Destination,
    pub redelivered: bool,
    pub reply_to: Option<String>,
    pub body: Vec<u8>,
}

impl Message {
    pub fn from_delivery(destination: &Destination, delivery: Delivery) -> Self {
        Self {
            delivery_tag: delivery.envelope.delivery_tag,
            destination: destination.clone(),
            redelivered: delivery.envelope.redelivered,
            reply_to: delivery.reply_to,
            body: delivery.body,
        }
    }

    /// The body as UTF-8 text, if it is valid UTF-8
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

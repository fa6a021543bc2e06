//! Message Consumer Core
//!
//! Blocking receive, push delivery and lifecycle control for message
//! consumers that sit on top of a non-blocking fetch primitive
//! ([`Channel::basic_get`](crate::broker::Channel::basic_get)).
//!
//! # Architecture
//!
//! - **Deadline**: time budget for blocking calls, with "forever" and "now"
//! - **AdmissionGate**: open/closed admission plus an in-flight count that
//!   pause drains and close ejects
//! - **PollingReceiver**: turns a fetch-one-now source into an abortable
//!   blocking get with a bounded polling interval
//! - **AbortableRegistry**: bulk start/stop/abort over background activities
//! - **ConsumerEngine**: ties them together and enforces that a session uses
//!   either synchronous receives or message listeners, never both
//!
//! # Usage
//!
//! ```rust
//! use consumer_gate::broker::InMemoryBroker;
//! use consumer_gate::consumer::Destination;
//! use consumer_gate::session::{AckMode, Session};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let broker = Arc::new(InMemoryBroker::new());
//! let session = Session::standalone(broker.clone(), AckMode::Auto);
//! let consumer = session.create_consumer(Destination::queue("orders")).unwrap();
//!
//! broker.publish("orders", "order #1").unwrap();
//! let message = consumer.receive_timeout(Duration::from_millis(500)).unwrap();
//! assert_eq!(message.unwrap().text(), Some("order #1"));
//!
//! consumer.close().unwrap();
//! ```

pub mod abortable;
pub mod config;
pub mod deadline;
pub mod engine;
pub mod error;
pub mod gate;
pub mod listener;
pub mod message;
pub mod polling;
pub mod statistics;

// Re-export main types for convenience
pub use abortable::{Abortable, AbortableRegistry};
pub use config::ConsumerConfig;
pub use deadline::Deadline;
pub use engine::{ConsumerEngine, ConsumerOptions, ConsumerState};
pub use error::{ConsumerError, ConsumerResult};
pub use gate::{AdmissionGate, EntryRefused, GatePass};
pub use listener::{ListenerConsumer, ListenerResult, MessageListener};
pub use message::{Destination, DestinationKind, Message, DIRECT_REPLY_TO};
pub use polling::{Polled, PollingReceiver};
pub use statistics::{ConsumerStatistics, StatisticsSnapshot};

#[cfg(test)]
mod tests;

//! In-Memory Broker
//!
//! Lock-free per-queue storage with an unacknowledged-delivery table,
//! implementing [`Channel`] for demos and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use crossbeam_queue::SegQueue;
use parking_lot::{Mutex, RwLock};
use log::{debug, trace};
use crate::broker::{Channel, Delivery, DeliveryTag, Envelope, TransportError};

/// Broker keeping named queues in memory
#[derive(Default)]
pub struct InMemoryBroker {
    queues: RwLock<HashMap<String, Arc<SegQueue<Delivery>>>>,
    /// Handed-out deliveries awaiting ack/nack, with their source queue
    unacked: Mutex<BTreeMap<DeliveryTag, (String, Delivery)>>,
    next_tag: AtomicU64,
    shut_down: AtomicBool,
    fetch_attempts: AtomicU64,
    acked: AtomicU64,
}

impl InMemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a message body onto `queue`, creating the queue if needed
    pub fn publish(&self, queue: &str, body: impl Into<Vec<u8>>) -> Result<(), TransportError> {
        self.publish_with_reply_to(queue, body, None)
    }

    /// Publish a message carrying a reply-to address
    pub fn publish_with_reply_to(
        &self,
        queue: &str,
        body: impl Into<Vec<u8>>,
        reply_to: Option<String>,
    ) -> Result<(), TransportError> {
        self.ensure_running()?;
        let delivery = Delivery {
            envelope: Envelope {
                delivery_tag: 0,
                redelivered: false,
                exchange: String::new(),
                routing_key: queue.to_string(),
            },
            reply_to,
            body: body.into(),
        };
        self.queue(queue).push(delivery);
        Ok(())
    }

    /// Number of messages ready for delivery on `queue`
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.queues
            .read()
            .get(queue)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Number of deliveries handed out and not yet acked or nacked
    pub fn unacked_count(&self) -> usize {
        self.unacked.lock().len()
    }

    /// Number of deliveries acknowledged so far
    pub fn acked_count(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    /// Number of `basic_get` calls served, successful or not
    pub fn fetch_attempts(&self) -> u64 {
        self.fetch_attempts.load(Ordering::Relaxed)
    }

    /// Shut the broker down; every further operation fails with `Shutdown`
    pub fn shutdown(&self) {
        debug!("in-memory broker shutting down");
        self.shut_down.store(true, Ordering::SeqCst);
    }

    /// Whether `shutdown` has been called
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), TransportError> {
        if self.is_shut_down() {
            Err(TransportError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn queue(&self, name: &str) -> Arc<SegQueue<Delivery>> {
        if let Some(queue) = self.queues.read().get(name) {
            return Arc::clone(queue);
        }
        let mut queues = self.queues.write();
        Arc::clone(queues.entry(name.to_string()).or_default())
    }

    /// Remove the settled tags (just `tag`, or every tag up to it)
    fn settle(&self, tag: DeliveryTag, multiple: bool) -> Result<Vec<(String, Delivery)>, TransportError> {
        let mut unacked = self.unacked.lock();
        if multiple {
            let remaining = unacked.split_off(&(tag + 1));
            let settled = std::mem::replace(&mut *unacked, remaining);
            Ok(settled.into_values().collect())
        } else {
            unacked
                .remove(&tag)
                .map(|entry| vec![entry])
                .ok_or_else(|| TransportError::failed(format!("unknown delivery tag {}", tag)))
        }
    }
}

impl Channel for InMemoryBroker {
    fn basic_get(&self, queue: &str, auto_ack: bool) -> Result<Option<Delivery>, TransportError> {
        self.fetch_attempts.fetch_add(1, Ordering::Relaxed);
        self.ensure_running()?;

        let Some(mut delivery) = self.queue(queue).pop() else {
            return Ok(None);
        };
        delivery.envelope.delivery_tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        trace!("basic_get '{}' -> tag {}", queue, delivery.envelope.delivery_tag);

        if auto_ack {
            self.acked.fetch_add(1, Ordering::Relaxed);
        } else {
            self.unacked
                .lock()
                .insert(delivery.envelope.delivery_tag, (queue.to_string(), delivery.clone()));
        }
        Ok(Some(delivery))
    }

    fn basic_ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<(), TransportError> {
        self.ensure_running()?;
        let settled = self.settle(delivery_tag, multiple)?;
        self.acked.fetch_add(settled.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn basic_nack(&self, delivery_tag: DeliveryTag, multiple: bool, requeue: bool) -> Result<(), TransportError> {
        self.ensure_running()?;
        for (queue, mut delivery) in self.settle(delivery_tag, multiple)? {
            if requeue {
                delivery.envelope.redelivered = true;
                self.queue(&queue).push(delivery);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_from_empty_queue() {
        let broker = InMemoryBroker::new();
        assert_eq!(broker.basic_get("missing", false).unwrap(), None);
        assert_eq!(broker.fetch_attempts(), 1);
    }

    #[test]
    fn test_get_assigns_increasing_tags() {
        let broker = InMemoryBroker::new();
        broker.publish("q", "one").unwrap();
        broker.publish("q", "two").unwrap();

        let first = broker.basic_get("q", false).unwrap().unwrap();
        let second = broker.basic_get("q", false).unwrap().unwrap();
        assert!(second.envelope.delivery_tag > first.envelope.delivery_tag);
        assert_eq!(first.body, b"one");
        assert_eq!(broker.unacked_count(), 2);
        assert_eq!(broker.queue_depth("q"), 0);
    }

    #[test]
    fn test_auto_ack_skips_unacked_table() {
        let broker = InMemoryBroker::new();
        broker.publish("q", "body").unwrap();
        broker.basic_get("q", true).unwrap().unwrap();
        assert_eq!(broker.unacked_count(), 0);
        assert_eq!(broker.acked_count(), 1);
    }

    #[test]
    fn test_ack_multiple() {
        let broker = InMemoryBroker::new();
        for i in 0..3 {
            broker.publish("q", format!("m{}", i)).unwrap();
        }
        let _ = broker.basic_get("q", false).unwrap().unwrap();
        let second = broker.basic_get("q", false).unwrap().unwrap();
        let _ = broker.basic_get("q", false).unwrap().unwrap();

        broker.basic_ack(second.envelope.delivery_tag, true).unwrap();
        assert_eq!(broker.acked_count(), 2);
        assert_eq!(broker.unacked_count(), 1);
    }

    #[test]
    fn test_nack_requeues_as_redelivered() {
        let broker = InMemoryBroker::new();
        broker.publish("q", "body").unwrap();
        let delivery = broker.basic_get("q", false).unwrap().unwrap();
        assert!(!delivery.envelope.redelivered);

        broker.basic_nack(delivery.envelope.delivery_tag, false, true).unwrap();
        assert_eq!(broker.queue_depth("q"), 1);

        let again = broker.basic_get("q", false).unwrap().unwrap();
        assert!(again.envelope.redelivered);
        assert_ne!(again.envelope.delivery_tag, delivery.envelope.delivery_tag);
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let broker = InMemoryBroker::new();
        assert!(broker.basic_ack(42, false).is_err());
    }

    #[test]
    fn test_shutdown_fails_operations() {
        let broker = InMemoryBroker::new();
        broker.publish("q", "body").unwrap();
        broker.shutdown();
        assert_eq!(broker.basic_get("q", false), Err(TransportError::Shutdown));
        assert_eq!(broker.publish("q", "late"), Err(TransportError::Shutdown));
    }
}

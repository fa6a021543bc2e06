//! Sessions
//!
//! A session owns the channel its consumers fetch on, decides whether
//! synchronous or asynchronous delivery is currently allowed, and keeps
//! the acknowledgement bookkeeping for the messages its consumers hand out.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use log::{debug, error, trace, warn};
use crate::broker::{Channel, DeliveryTag};
use crate::connection::ConnectionState;
use crate::consumer::abortable::Abortable;
use crate::consumer::config::ConsumerConfig;
use crate::consumer::engine::{ConsumerEngine, ConsumerOptions};
use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::message::Destination;
use crate::consumer::statistics::StatisticsSnapshot;

/// How messages handed out by a session are acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckMode {
    /// Acknowledged as soon as they are delivered
    #[default]
    Auto,
    /// Lazily acknowledged; duplicates are tolerated
    DupsOk,
    /// Acknowledged by the application through [`Session::acknowledge`]
    Client,
    /// Acknowledged on [`Session::commit`], requeued on rollback
    Transacted,
}

impl AckMode {
    /// Whether delivery alone settles the message
    pub fn is_auto_ack(self) -> bool {
        matches!(self, AckMode::Auto | AckMode::DupsOk)
    }
}

impl FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(AckMode::Auto),
            "dups-ok" | "dups_ok" | "dupsok" => Ok(AckMode::DupsOk),
            "client" => Ok(AckMode::Client),
            "transacted" => Ok(AckMode::Transacted),
            _ => Err(format!(
                "Invalid acknowledgement mode: {}. Valid modes: auto, dups-ok, client, transacted",
                s
            )),
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AckMode::Auto => "auto",
            AckMode::DupsOk => "dups-ok",
            AckMode::Client => "client",
            AckMode::Transacted => "transacted",
        };
        f.write_str(name)
    }
}

/// What a consumer needs from its owning session
pub trait SessionContext: Send + Sync {
    fn ack_mode(&self) -> AckMode;

    /// No consumer of this session has a message listener
    fn sync_allowed(&self) -> bool;

    /// No consumer of this session has a receive outstanding
    fn async_allowed(&self) -> bool;

    /// Acknowledge a delivery right away
    fn explicit_ack(&self, delivery_tag: DeliveryTag);

    /// Remember a delivery awaiting application acknowledgement
    fn unacked_message_received(&self, delivery_tag: DeliveryTag);

    /// Remember a delivery for the current transaction
    fn add_uncommitted_tag(&self, delivery_tag: DeliveryTag);

    fn is_connection_stopped(&self) -> bool;

    /// Start `activity` unless the connection is stopped; returns whether it
    /// was started.
    fn start_if_connection_started(&self, activity: &dyn Abortable) -> ConsumerResult<bool> {
        if self.is_connection_stopped() {
            return Ok(false);
        }
        activity.start().map(|()| true)
    }

    fn channel(&self) -> Arc<dyn Channel>;
}

/// Settle a freshly delivered message according to the session's ack mode
pub(crate) fn record_delivery(session: &dyn SessionContext, auto_ack: bool, delivery_tag: DeliveryTag) {
    if auto_ack {
        session.explicit_ack(delivery_tag);
    } else {
        session.unacked_message_received(delivery_tag);
    }
    session.add_uncommitted_tag(delivery_tag);
}

/// A single-threaded context for producing and consuming messages.
///
/// Consumers are owned by the handles returned from `create_consumer`; the
/// session only tracks the live ones. Dropping the last handle closes a
/// consumer, and dropping the session closes whatever is left.
pub struct Session {
    ack_mode: AckMode,
    channel: Arc<dyn Channel>,
    connection: Arc<ConnectionState>,
    config: ConsumerConfig,
    consumers: Mutex<Vec<Weak<ConsumerEngine>>>,
    unacked_tags: Mutex<BTreeSet<DeliveryTag>>,
    uncommitted_tags: Mutex<BTreeSet<DeliveryTag>>,
    closed: AtomicBool,
}

impl Session {
    pub fn new(
        ack_mode: AckMode,
        channel: Arc<dyn Channel>,
        connection: Arc<ConnectionState>,
        config: ConsumerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            ack_mode,
            channel,
            connection,
            config,
            consumers: Mutex::new(Vec::new()),
            unacked_tags: Mutex::new(BTreeSet::new()),
            uncommitted_tags: Mutex::new(BTreeSet::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// A session on its own, already-started connection
    pub fn standalone(channel: Arc<dyn Channel>, ack_mode: AckMode) -> Arc<Self> {
        Self::new(ack_mode, channel, Arc::new(ConnectionState::new(false)), ConsumerConfig::default())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> ConsumerResult<()> {
        if self.is_closed() {
            return Err(ConsumerError::illegal_state("Session is closed"));
        }
        Ok(())
    }

    pub fn create_consumer(self: &Arc<Self>, destination: Destination) -> ConsumerResult<Arc<ConsumerEngine>> {
        self.create_consumer_with(destination, ConsumerOptions::default())
    }

    /// A durable subscriber on a topic
    pub fn create_durable_subscriber(
        self: &Arc<Self>,
        topic: Destination,
        selector: Option<String>,
    ) -> ConsumerResult<Arc<ConsumerEngine>> {
        if topic.is_queue() {
            return Err(ConsumerError::illegal_state("Durable subscribers require a topic"));
        }
        self.create_consumer_with(
            topic,
            ConsumerOptions {
                message_selector: selector,
                durable: true,
                ..ConsumerOptions::default()
            },
        )
    }

    pub fn create_consumer_with(
        self: &Arc<Self>,
        destination: Destination,
        options: ConsumerOptions,
    ) -> ConsumerResult<Arc<ConsumerEngine>> {
        self.ensure_open()?;

        // Registered before the connection can change state, so a stop or
        // start running concurrently either sees this consumer or is seen by it.
        self.connection.with_stopped(|paused| -> ConsumerResult<Arc<ConsumerEngine>> {
            let context: Arc<dyn SessionContext> = self.clone();
            let consumer = Arc::new(ConsumerEngine::new(context, destination, paused, options, self.config.clone())?);

            let session = Arc::downgrade(self);
            consumer.add_closed_listener(move |closed: &ConsumerEngine| {
                if let Some(session) = Weak::upgrade(&session) {
                    session.remove_consumer(closed);
                }
                Ok(())
            });

            debug!("session created consumer {} on '{}'", consumer.consumer_tag(), consumer.destination().name());
            let mut consumers = self.consumers.lock();
            consumers.retain(|c| c.strong_count() > 0);
            consumers.push(Arc::downgrade(&consumer));
            Ok(consumer)
        })
    }

    fn remove_consumer(&self, consumer: &ConsumerEngine) {
        self.consumers
            .lock()
            .retain(|c| c.strong_count() > 0 && !std::ptr::eq(c.as_ptr(), consumer));
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().iter().filter(|c| c.strong_count() > 0).count()
    }

    fn snapshot(&self) -> Vec<Arc<ConsumerEngine>> {
        let consumers: Vec<Weak<ConsumerEngine>> = self.consumers.lock().clone();
        consumers.iter().filter_map(Weak::upgrade).collect()
    }

    /// Acknowledge every message delivered so far (client mode)
    pub fn acknowledge(&self) -> ConsumerResult<()> {
        self.ensure_open()?;
        if self.ack_mode != AckMode::Client {
            trace!("acknowledge ignored in {} mode", self.ack_mode);
            return Ok(());
        }
        let tags = std::mem::take(&mut *self.unacked_tags.lock());
        for tag in tags {
            self.channel.basic_ack(tag, false)?;
        }
        Ok(())
    }

    pub fn commit(&self) -> ConsumerResult<()> {
        self.ensure_open()?;
        self.ensure_transacted("commit")?;
        let tags = std::mem::take(&mut *self.uncommitted_tags.lock());
        for tag in tags {
            self.channel.basic_ack(tag, false)?;
        }
        Ok(())
    }

    pub fn rollback(&self) -> ConsumerResult<()> {
        self.ensure_open()?;
        self.ensure_transacted("rollback")?;
        self.requeue_uncommitted()
    }

    fn ensure_transacted(&self, operation: &str) -> ConsumerResult<()> {
        if self.ack_mode != AckMode::Transacted {
            return Err(ConsumerError::illegal_state(format!(
                "Cannot {} a session in {} mode",
                operation, self.ack_mode
            )));
        }
        Ok(())
    }

    fn requeue_uncommitted(&self) -> ConsumerResult<()> {
        let tags = std::mem::take(&mut *self.uncommitted_tags.lock());
        for tag in tags {
            self.channel.basic_nack(tag, false, true)?;
        }
        Ok(())
    }

    /// Pause every consumer; failures are collected, not short-circuited
    pub fn pause(&self) -> ConsumerResult<()> {
        self.for_each_consumer("pause", |c| c.pause())
    }

    pub fn resume(&self) -> ConsumerResult<()> {
        self.for_each_consumer("resume", |c| c.resume())
    }

    fn for_each_consumer<F>(&self, operation: &str, op: F) -> ConsumerResult<()>
    where
        F: Fn(&ConsumerEngine) -> ConsumerResult<()>,
    {
        let failures: Vec<ConsumerError> = self
            .snapshot()
            .iter()
            .filter_map(|c| op(c).err())
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ConsumerError::ActivitiesFailed {
                operation: format!("session {}", operation),
                failures,
            })
        }
    }

    /// Close every consumer, then return undelivered work to the broker
    pub fn close(&self) -> ConsumerResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("closing session");

        let consumers: Vec<Arc<ConsumerEngine>> = std::mem::take(&mut *self.consumers.lock())
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        let mut failures: Vec<ConsumerError> = consumers.iter().filter_map(|c| c.close().err()).collect();

        if self.ack_mode == AckMode::Transacted {
            if let Err(e) = self.requeue_uncommitted() {
                failures.push(e);
            }
        }
        if self.ack_mode == AckMode::Client {
            let tags = std::mem::take(&mut *self.unacked_tags.lock());
            for tag in tags {
                if let Err(e) = self.channel.basic_nack(tag, false, true) {
                    if !e.is_shutdown() {
                        failures.push(e.into());
                    }
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ConsumerError::ActivitiesFailed {
                operation: "session close".to_string(),
                failures,
            })
        }
    }

    /// Combined statistics of the session's live consumers
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.snapshot()
            .iter()
            .fold(StatisticsSnapshot::default(), |acc, c| acc.merge(&c.statistics()))
    }

    pub fn pending_acknowledgements(&self) -> usize {
        self.unacked_tags.lock().len()
    }

    pub fn uncommitted_count(&self) -> usize {
        self.uncommitted_tags.lock().len()
    }
}

impl SessionContext for Session {
    fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    fn sync_allowed(&self) -> bool {
        !self.snapshot().iter().any(|c| c.has_message_listener())
    }

    fn async_allowed(&self) -> bool {
        self.snapshot().iter().all(|c| c.number_of_receives() == 0)
    }

    fn explicit_ack(&self, delivery_tag: DeliveryTag) {
        if let Err(e) = self.channel.basic_ack(delivery_tag, false) {
            if e.is_shutdown() {
                warn!("Could not acknowledge delivery {}: {}", delivery_tag, e);
            } else {
                error!("Could not acknowledge delivery {}: {}", delivery_tag, e);
            }
        }
    }

    fn unacked_message_received(&self, delivery_tag: DeliveryTag) {
        if self.ack_mode == AckMode::Client {
            self.unacked_tags.lock().insert(delivery_tag);
        }
    }

    fn add_uncommitted_tag(&self, delivery_tag: DeliveryTag) {
        if self.ack_mode == AckMode::Transacted {
            self.uncommitted_tags.lock().insert(delivery_tag);
        }
    }

    fn is_connection_stopped(&self) -> bool {
        self.connection.is_stopped()
    }

    fn start_if_connection_started(&self, activity: &dyn Abortable) -> ConsumerResult<bool> {
        self.connection.with_stopped(|stopped| -> ConsumerResult<bool> {
            if stopped {
                return Ok(false);
            }
            activity.start().map(|()| true)
        })
    }

    fn channel(&self) -> Arc<dyn Channel> {
        Arc::clone(&self.channel)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("error closing session on drop: {}", e);
        }
    }
}

//! Consumer Engine
//!
//! Coordinates the two delivery modes of a consumer. Synchronous receives
//! pass the receive gate and then poll the channel; asynchronous delivery
//! runs as a [`ListenerConsumer`] registered with the abortable registry.
//! The two modes are mutually exclusive per session, pause/resume toggles
//! both, and close tears everything down exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use parking_lot::Mutex;
use log::{debug, error, info, trace, warn};
use crate::broker::{Channel, Delivery};
use crate::consumer::abortable::{Abortable, AbortableRegistry};
use crate::consumer::config::ConsumerConfig;
use crate::consumer::deadline::Deadline;
use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::gate::{AdmissionGate, EntryRefused};
use crate::consumer::listener::{DeliverySettings, ListenerConsumer, MessageListener};
use crate::consumer::message::{Destination, Message};
use crate::consumer::polling::{PollingReceiver, Polled};
use crate::consumer::statistics::{ConsumerStatistics, StatisticsSnapshot};
use crate::session::{record_delivery, SessionContext};

/// Callback run once the consumer has closed
pub type ClosedListener = Box<dyn Fn(&ConsumerEngine) -> ConsumerResult<()> + Send + Sync>;

/// Creation-time consumer options
#[derive(Debug, Clone, Default)]
pub struct ConsumerOptions {
    /// Stored and reported; not evaluated
    pub message_selector: Option<String>,
    pub no_local: bool,
    pub durable: bool,
}

/// Lifecycle state as observed from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Active,
    Paused,
    Closing,
    Closed,
}

/// Counts receives in flight for as long as it lives
struct ReceiveUsage<'a>(&'a AtomicUsize);

impl<'a> ReceiveUsage<'a> {
    fn begin(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ReceiveUsage<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A message consumer bound to one destination
pub struct ConsumerEngine {
    /// Names the consumer in logs; for topics also its private queue
    uuid_tag: String,
    destination: Destination,
    session: Arc<dyn SessionContext>,
    channel: Arc<dyn Channel>,
    config: ConsumerConfig,
    message_selector: Option<String>,
    durable: AtomicBool,
    no_local: AtomicBool,
    /// Ack mode at creation time settles deliveries immediately
    auto_ack: bool,

    receive_gate: AdmissionGate,
    receiver: PollingReceiver,
    abortables: AbortableRegistry,
    receives_in_flight: AtomicUsize,

    listener: Mutex<Option<Arc<dyn MessageListener>>>,
    /// Mirrors `listener.is_some()` for lock-free checks on the receive path
    async_mode: AtomicBool,
    listener_consumer: Mutex<Option<Arc<ListenerConsumer>>>,

    closing: AtomicBool,
    closed: AtomicBool,
    closed_listeners: Mutex<Vec<ClosedListener>>,
    stats: Arc<ConsumerStatistics>,
}

impl ConsumerEngine {
    /// Create a consumer; `paused` starts it with the receive gate closed
    pub fn new(
        session: Arc<dyn SessionContext>,
        destination: Destination,
        paused: bool,
        options: ConsumerOptions,
        config: ConsumerConfig,
    ) -> ConsumerResult<Self> {
        config.validate()?;
        let channel = session.channel();
        let auto_ack = session.ack_mode().is_auto_ack();
        let receiver = PollingReceiver::with_polling_interval(Some(config.polling_interval()));

        let engine = Self {
            uuid_tag: format!("jms-cons-{}", uuid::Uuid::new_v4()),
            destination,
            session,
            channel,
            config,
            message_selector: options.message_selector,
            durable: AtomicBool::new(options.durable),
            no_local: AtomicBool::new(options.no_local),
            auto_ack,
            receive_gate: AdmissionGate::new(!paused),
            receiver,
            abortables: AbortableRegistry::new(),
            receives_in_flight: AtomicUsize::new(0),
            listener: Mutex::new(None),
            async_mode: AtomicBool::new(false),
            listener_consumer: Mutex::new(None),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            closed_listeners: Mutex::new(Vec::new()),
            stats: Arc::new(ConsumerStatistics::new()),
        };
        debug!("created consumer {} on '{}' (paused: {})", engine.uuid_tag, engine.destination.name(), paused);
        Ok(engine)
    }

    pub fn consumer_tag(&self) -> &str {
        &self.uuid_tag
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// The destination, for queue consumers
    pub fn queue(&self) -> &Destination {
        &self.destination
    }

    /// The destination, if this consumer subscribes to a topic
    pub fn topic(&self) -> ConsumerResult<&Destination> {
        if self.destination.is_queue() {
            return Err(ConsumerError::illegal_state("Consumer is not a topic subscriber"));
        }
        Ok(&self.destination)
    }

    /// Broker queue this consumer fetches from
    pub fn queue_name(&self) -> &str {
        if self.destination.is_queue() {
            self.destination.amqp_queue_name()
        } else {
            &self.uuid_tag
        }
    }

    pub fn message_selector(&self) -> Option<&str> {
        self.message_selector.as_deref()
    }

    pub fn is_durable(&self) -> bool {
        self.durable.load(Ordering::Relaxed)
    }

    pub fn set_durable(&self, durable: bool) {
        self.durable.store(durable, Ordering::Relaxed);
    }

    pub fn no_local(&self) -> bool {
        self.no_local.load(Ordering::Relaxed)
    }

    pub fn set_no_local(&self, no_local: bool) {
        self.no_local.store(no_local, Ordering::Relaxed);
    }

    pub fn polling_interval(&self) -> Duration {
        self.receiver.polling_interval()
    }

    /// Change the receive polling interval; invalid values are ignored
    pub fn set_polling_interval(&self, interval: Option<Duration>) -> bool {
        self.receiver.set_polling_interval(interval)
    }

    /// Direct-reply-to deliveries are settled by the broker on fetch
    fn amqp_auto_ack(&self) -> bool {
        self.destination.is_direct_reply_to()
    }

    /// Number of receives currently in flight
    pub fn number_of_receives(&self) -> usize {
        self.receives_in_flight.load(Ordering::SeqCst)
    }

    pub fn message_listener(&self) -> Option<Arc<dyn MessageListener>> {
        self.listener.lock().clone()
    }

    pub fn has_message_listener(&self) -> bool {
        self.async_mode.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConsumerState {
        if self.is_closed() {
            ConsumerState::Closed
        } else if self.closing.load(Ordering::SeqCst) {
            ConsumerState::Closing
        } else if self.receive_gate.is_open() {
            ConsumerState::Active
        } else {
            ConsumerState::Paused
        }
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    fn ensure_open(&self) -> ConsumerResult<()> {
        if self.closed.load(Ordering::SeqCst) || self.closing.load(Ordering::SeqCst) {
            return Err(ConsumerError::illegal_state("Consumer is closed or closing."));
        }
        Ok(())
    }

    /// Block until a message arrives or the consumer is paused or closed
    pub fn receive(&self) -> ConsumerResult<Option<Message>> {
        self.receive_within(Deadline::forever())
    }

    /// Receive with a timeout; a zero timeout waits forever
    pub fn receive_timeout(&self, timeout: Duration) -> ConsumerResult<Option<Message>> {
        self.receive_within(Deadline::from_timeout(timeout))
    }

    /// Fetch once without waiting
    pub fn receive_no_wait(&self) -> ConsumerResult<Option<Message>> {
        self.receive_within(Deadline::zero())
    }

    /// Receive against an explicit deadline.
    ///
    /// Returns `Ok(None)` when the deadline expires, when the consumer is
    /// paused for longer than the deadline, or when it is closed while the
    /// call is in flight. Fails with `IllegalState` if the consumer is
    /// closed, or a message listener is active on this session.
    pub fn receive_within(&self, deadline: Deadline) -> ConsumerResult<Option<Message>> {
        self.ensure_open()?;
        let _usage = ReceiveUsage::begin(&self.receives_in_flight);
        if self.async_mode.load(Ordering::SeqCst) || !self.session.sync_allowed() {
            return Err(ConsumerError::illegal_state(
                "A MessageListener has been set on this session; receive() is not permitted",
            ));
        }
        self.stats.record_receive_call();

        let _pass = match self.receive_gate.enter(&deadline) {
            Ok(pass) => pass,
            Err(refused) => {
                trace!("receive on {} not admitted: {:?}", self.uuid_tag, refused);
                self.record_refusal(refused);
                return Ok(None);
            }
        };

        match self.receiver.poll(&deadline, || self.fetch_one()) {
            Polled::Message(delivery) => Ok(Some(self.deliver(delivery))),
            Polled::TimedOut => {
                self.stats.record_timeout();
                Ok(None)
            }
            Polled::Aborted => {
                self.stats.record_abort();
                Ok(None)
            }
        }
    }

    fn record_refusal(&self, refused: EntryRefused) {
        match refused {
            EntryRefused::TimedOut => self.stats.record_timeout(),
            EntryRefused::Aborted => self.stats.record_abort(),
        }
    }

    fn fetch_one(&self) -> Option<Delivery> {
        let queue = self.queue_name();
        match self.channel.basic_get(queue, self.amqp_auto_ack()) {
            Ok(delivery) => {
                self.stats.record_fetch(false);
                delivery
            }
            Err(e) => {
                self.stats.record_fetch(true);
                if !e.is_shutdown() {
                    error!("basic_get for queue '{}' failed unexpectedly: {}", queue, e);
                }
                None
            }
        }
    }

    fn deliver(&self, delivery: Delivery) -> Message {
        if !self.amqp_auto_ack() {
            record_delivery(self.session.as_ref(), self.auto_ack, delivery.envelope.delivery_tag);
        }
        self.stats.record_message();
        Message::from_delivery(&self.destination, delivery)
    }

    /// Install, replace or remove (`None`) the message listener.
    ///
    /// Setting the listener that is already installed does nothing. Fails
    /// with `IllegalState` while receives are outstanding on the session.
    pub fn set_message_listener(&self, listener: Option<Arc<dyn MessageListener>>) -> ConsumerResult<()> {
        self.ensure_open()?;
        let mut current = self.listener.lock();
        if same_listener(current.as_ref(), listener.as_ref()) {
            info!("MessageListener({}) already set", if listener.is_some() { "non-null" } else { "null" });
            return Ok(());
        }

        // Announce async mode before checking for receives; a receive that
        // raced past its own check is then visible in the counter.
        if listener.is_some() {
            self.async_mode.store(true, Ordering::SeqCst);
        }
        if self.receives_in_flight.load(Ordering::SeqCst) > 0 || !self.session.async_allowed() {
            self.async_mode.store(current.is_some(), Ordering::SeqCst);
            return Err(ConsumerError::illegal_state(
                "A MessageListener cannot be set while receive() is outstanding on the session",
            ));
        }

        trace!("setting MessageListener on {}", self.uuid_tag);
        let removed = self.remove_listener_consumer();
        *current = listener.clone();
        self.async_mode.store(listener.is_some(), Ordering::SeqCst);
        removed?;

        if let Some(listener) = listener {
            self.install_listener_consumer(listener)?;
        }
        Ok(())
    }

    fn install_listener_consumer(&self, listener: Arc<dyn MessageListener>) -> ConsumerResult<()> {
        let settings = DeliverySettings {
            queue: self.queue_name().to_string(),
            amqp_auto_ack: self.amqp_auto_ack(),
            auto_ack: self.auto_ack,
            requeue_on_listener_exception: self.config.requeue_on_listener_exception,
            requeue_on_timeout: self.config.requeue_on_timeout,
            termination_timeout: self.config.listener_termination_timeout(),
            idle_wait: self.polling_interval(),
        };
        let consumer = Arc::new(ListenerConsumer::new(
            Arc::clone(&self.session),
            self.destination.clone(),
            listener,
            settings,
            Arc::clone(&self.stats),
        ));

        // Held until the consumer is registered and started; close takes the
        // slot after marking itself closing, so it either sees this consumer
        // or this install sees the close.
        let mut slot = self.listener_consumer.lock();
        let refusal = if slot.is_some() {
            Some(ConsumerError::illegal_state(format!(
                "MessageListener concurrently set on Consumer {}",
                self.uuid_tag
            )))
        } else if self.ensure_open().is_err() {
            Some(ConsumerError::illegal_state("Consumer closed while setting its MessageListener"))
        } else {
            None
        };
        if let Some(refusal) = refusal {
            drop(slot);
            consumer.abort()?;
            return Err(refusal);
        }
        *slot = Some(Arc::clone(&consumer));

        self.abortables.add(consumer.clone());
        if !self.session.start_if_connection_started(&*consumer)? {
            debug!("connection stopped; listener on {} waits for start", self.uuid_tag);
        }
        Ok(())
    }

    /// Unregister and gracefully stop the listener's delivery thread
    fn remove_listener_consumer(&self) -> ConsumerResult<()> {
        let Some(consumer) = self.listener_consumer.lock().take() else {
            return Ok(());
        };
        self.abortables.remove(&consumer.activity_id());
        consumer.stop()
    }

    /// Stop admitting receives, drain the ones in flight and stop the
    /// listener's delivery.
    pub fn pause(&self) -> ConsumerResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        debug!("pausing consumer {}", self.uuid_tag);
        self.receive_gate.close();

        let stop_timeout = self.config.stop_timeout();
        if !self.receive_gate.wait_to_clear(&Deadline::after(stop_timeout)) {
            warn!(
                "consumer {}: {} receive(s) still in flight after {:?}",
                self.uuid_tag,
                self.receive_gate.inside_count(),
                stop_timeout
            );
        }
        self.abortables.stop()
    }

    /// Restart listener delivery and reopen the receive gate
    pub fn resume(&self) -> ConsumerResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        debug!("resuming consumer {}", self.uuid_tag);
        let started = self.abortables.start();
        self.receive_gate.open();
        started
    }

    /// Close the consumer. Waiting receives return `None`, the listener is
    /// stopped and closed listeners run once. Repeated calls are no-ops.
    pub fn close(&self) -> ConsumerResult<()> {
        if self.is_closed()
            || self
                .closing
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            return Ok(());
        }
        trace!("close consumer({})", self.uuid_tag);

        // Retiring closes the gate, ejects waiters and refuses late arrivals
        self.receive_gate.retire();
        self.receiver.close();

        let stopped = self.remove_listener_consumer();
        let aborted = self.abortables.abort();

        self.closed.store(true, Ordering::SeqCst);
        self.closing.store(false, Ordering::SeqCst);
        self.notify_closed_listeners();

        stopped.and(aborted)
    }

    /// Register a callback to run after close; runs at once if already closed
    pub fn add_closed_listener<F>(&self, listener: F)
    where
        F: Fn(&ConsumerEngine) -> ConsumerResult<()> + Send + Sync + 'static,
    {
        let listener: ClosedListener = Box::new(listener);
        {
            let mut listeners = self.closed_listeners.lock();
            if !self.is_closed() {
                listeners.push(listener);
                return;
            }
        }
        self.run_closed_listener(&listener);
    }

    fn notify_closed_listeners(&self) {
        let listeners = std::mem::take(&mut *self.closed_listeners.lock());
        for listener in &listeners {
            self.run_closed_listener(listener);
        }
    }

    fn run_closed_listener(&self, listener: &ClosedListener) {
        if let Err(e) = listener(self) {
            warn!("Closed listener for consumer {} failed: {}", self.uuid_tag, e);
        }
    }
}

impl Drop for ConsumerEngine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("error closing consumer {} on drop: {}", self.uuid_tag, e);
        }
    }
}

fn same_listener(a: Option<&Arc<dyn MessageListener>>, b: Option<&Arc<dyn MessageListener>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
        _ => false,
    }
}

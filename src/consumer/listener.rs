//! Push Delivery to Message Listeners
//!
//! A [`ListenerConsumer`] owns a delivery thread that fetches messages for
//! one consumer and hands them to the application's [`MessageListener`].
//! It is registered with the consumer's abortable registry so connection
//! stop/start pauses and resumes it, and consumer close tears it down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use crossbeam_channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use log::{debug, error, trace, warn};
use crate::broker::{Channel, Delivery};
use crate::consumer::abortable::Abortable;
use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::message::{Destination, Message};
use crate::consumer::statistics::ConsumerStatistics;
use crate::session::{record_delivery, SessionContext};

/// Outcome of a listener callback
pub type ListenerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Application callback for asynchronous delivery
pub trait MessageListener: Send + Sync {
    /// Handle one message. An error is logged and, depending on
    /// configuration, the message is requeued.
    fn on_message(&self, message: Message) -> ListenerResult;
}

impl<F> MessageListener for F
where
    F: Fn(Message) -> ListenerResult + Send + Sync,
{
    fn on_message(&self, message: Message) -> ListenerResult {
        self(message)
    }
}

/// Generate a unique consumer tag
pub fn new_consumer_tag() -> String {
    format!("jms-consumer-{}", uuid::Uuid::new_v4())
}

/// Per-subscription delivery settings
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    /// Broker queue to fetch from
    pub queue: String,
    /// Broker acknowledges on hand-out; no bookkeeping afterwards
    pub amqp_auto_ack: bool,
    /// Session acknowledges immediately on delivery
    pub auto_ack: bool,
    pub requeue_on_listener_exception: bool,
    pub requeue_on_timeout: bool,
    pub termination_timeout: Duration,
    /// Wait between fetches while the queue is empty
    pub idle_wait: Duration,
}

/// Commands for controlling the delivery thread
#[derive(Debug)]
enum DeliveryCommand {
    Stop,
}

struct Worker {
    control: Sender<DeliveryCommand>,
    handle: JoinHandle<()>,
}

/// State shared between the handle and its delivery thread
struct DeliveryLoop {
    consumer_tag: String,
    channel: Arc<dyn Channel>,
    session: Arc<dyn SessionContext>,
    destination: Destination,
    listener: Arc<dyn MessageListener>,
    settings: DeliverySettings,
    aborted: AtomicBool,
    stats: Arc<ConsumerStatistics>,
}

/// Resumable push-delivery subscription for one consumer
pub struct ListenerConsumer {
    shared: Arc<DeliveryLoop>,
    worker: Mutex<Option<Worker>>,
}

impl ListenerConsumer {
    pub fn new(
        session: Arc<dyn SessionContext>,
        destination: Destination,
        listener: Arc<dyn MessageListener>,
        settings: DeliverySettings,
        stats: Arc<ConsumerStatistics>,
    ) -> Self {
        let channel = session.channel();
        Self {
            shared: Arc::new(DeliveryLoop {
                consumer_tag: new_consumer_tag(),
                channel,
                session,
                destination,
                listener,
                settings,
                aborted: AtomicBool::new(false),
                stats,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn consumer_tag(&self) -> &str {
        &self.shared.consumer_tag
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::SeqCst)
    }

    /// Signal the delivery thread and, unless `wait` is false or we are the
    /// delivery thread itself, wait for it to finish its current callback.
    fn halt(&self, wait: bool) -> ConsumerResult<()> {
        let Some(worker) = self.worker.lock().take() else {
            return Ok(());
        };
        let _ = worker.control.send(DeliveryCommand::Stop);

        if !wait || worker.handle.thread().id() == thread::current().id() {
            return Ok(());
        }
        worker.handle.join().map_err(|_| {
            ConsumerError::activity(self.consumer_tag(), "delivery thread panicked")
        })
    }
}

impl Abortable for ListenerConsumer {
    fn activity_id(&self) -> String {
        self.shared.consumer_tag.clone()
    }

    fn start(&self) -> ConsumerResult<()> {
        if self.is_aborted() {
            return Err(ConsumerError::activity(self.consumer_tag(), "cannot start an aborted listener"));
        }
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let (control, commands) = crossbeam_channel::unbounded();
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("{}-delivery", self.consumer_tag()))
            .spawn(move || shared.run(commands))
            .map_err(|e| ConsumerError::activity(self.consumer_tag(), format!("failed to spawn delivery thread: {}", e)))?;

        debug!("consuming from queue '{}' with tag '{}'", self.shared.settings.queue, self.consumer_tag());
        *worker = Some(Worker { control, handle });
        Ok(())
    }

    fn stop(&self) -> ConsumerResult<()> {
        trace!("stopping listener consumer {}", self.consumer_tag());
        self.halt(true)
    }

    fn abort(&self) -> ConsumerResult<()> {
        trace!("aborting listener consumer {}", self.consumer_tag());
        self.shared.aborted.store(true, Ordering::SeqCst);
        self.halt(false)
    }
}

impl DeliveryLoop {
    fn run(&self, commands: Receiver<DeliveryCommand>) {
        loop {
            match commands.try_recv() {
                Ok(DeliveryCommand::Stop) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }
            if self.aborted.load(Ordering::SeqCst) {
                break;
            }

            match self.fetch() {
                Some(delivery) => self.dispatch(delivery),
                None => match commands.recv_timeout(self.settings.idle_wait) {
                    Ok(DeliveryCommand::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                },
            }
        }
        trace!("delivery thread for {} finished", self.consumer_tag);
    }

    fn fetch(&self) -> Option<Delivery> {
        let queue = &self.settings.queue;
        match self.channel.basic_get(queue, self.settings.amqp_auto_ack) {
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

    fn dispatch(&self, delivery: Delivery) {
        let tag = delivery.envelope.delivery_tag;
        if self.aborted.load(Ordering::SeqCst) {
            self.requeue(tag, "consumer aborted before delivery");
            return;
        }

        let message = Message::from_delivery(&self.destination, delivery);
        let started = Instant::now();
        let result = self.listener.on_message(message);
        let overran = started.elapsed() > self.settings.termination_timeout;
        self.stats.record_listener_delivery(result.is_err());

        if self.settings.amqp_auto_ack {
            if let Err(e) = result {
                warn!("Listener on {} failed for auto-acknowledged delivery {}: {}", self.consumer_tag, tag, e);
            }
            return;
        }

        match result {
            Err(e) if self.settings.requeue_on_listener_exception => {
                warn!("Listener on {} failed, requeueing delivery {}: {}", self.consumer_tag, tag, e);
                self.requeue(tag, "listener failure");
            }
            Ok(()) if overran && self.settings.requeue_on_timeout => {
                warn!("Listener on {} exceeded {:?}, requeueing delivery {}", self.consumer_tag, self.settings.termination_timeout, tag);
                self.requeue(tag, "listener timeout");
            }
            outcome => {
                if let Err(e) = outcome {
                    warn!("Listener on {} failed for delivery {}: {}", self.consumer_tag, tag, e);
                }
                record_delivery(self.session.as_ref(), self.settings.auto_ack, tag);
            }
        }
    }

    fn requeue(&self, tag: u64, reason: &str) {
        if self.settings.amqp_auto_ack {
            return;
        }
        if let Err(e) = self.channel.basic_nack(tag, false, true) {
            if !e.is_shutdown() {
                error!("Failed to requeue delivery {} ({}): {}", tag, reason, e);
            }
        }
    }
}

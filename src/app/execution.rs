//! Consumer run orchestration

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use crate::broker::InMemoryBroker;
use crate::cli;
use crate::connection::Connection;
use crate::consumer::{ConsumerConfig, ConsumerEngine, Destination, ListenerResult, Message, MessageListener, StatisticsSnapshot};
use crate::session::{AckMode, Session};

/// Outcome of one run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub published: usize,
    pub consumed: usize,
    /// Messages still on the queue after the connection closed
    pub remaining: usize,
    pub statistics: StatisticsSnapshot,
    pub elapsed: Duration,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Published: {} | Consumed: {} | Remaining: {}", self.published, self.consumed, self.remaining)?;
        writeln!(
            f,
            "Receives: {} | Timeouts: {} | Aborts: {} | Fetches: {} ({} failed)",
            self.statistics.receive_calls,
            self.statistics.timeouts,
            self.statistics.aborts,
            self.statistics.fetch_attempts,
            self.statistics.fetch_failures
        )?;
        writeln!(
            f,
            "Listener deliveries: {} ({} failed)",
            self.statistics.listener_deliveries, self.statistics.listener_failures
        )?;
        write!(f, "Elapsed: {:.3}s", self.elapsed.as_secs_f64())
    }
}

/// Settle whatever the session is still holding for the application
fn settle(session: &Session, ack_mode: AckMode) -> Result<()> {
    match ack_mode {
        AckMode::Client => session.acknowledge()?,
        AckMode::Transacted => session.commit()?,
        AckMode::Auto | AckMode::DupsOk => {}
    }
    Ok(())
}

fn spawn_receiver(
    index: usize,
    session: Arc<Session>,
    consumer: Arc<ConsumerEngine>,
    args: &cli::Args,
    consumed: Arc<AtomicUsize>,
) -> Result<thread::JoinHandle<Result<()>>> {
    let timeout = Duration::from_millis(args.timeout_ms);
    let ack_mode = args.ack_mode;
    thread::Builder::new()
        .name(format!("receiver-{}", index))
        .spawn(move || {
            while let Some(message) = consumer.receive_timeout(timeout)? {
                debug!("receiver-{} got delivery {}", index, message.delivery_tag);
                consumed.fetch_add(1, Ordering::SeqCst);
                settle(&session, ack_mode)?;
            }
            debug!("receiver-{} idle for {:?}, finishing", index, timeout);
            Ok(())
        })
        .context("Failed to spawn receiver thread")
}

fn counting_listener(consumed: &Arc<AtomicUsize>) -> Arc<dyn MessageListener> {
    let consumed = Arc::clone(consumed);
    Arc::new(move |_message: Message| -> ListenerResult {
        consumed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

/// Wait until `target` messages were consumed or nothing happened for `idle`
fn wait_for_listeners(consumed: &AtomicUsize, target: usize, idle: Duration) {
    let mut last = consumed.load(Ordering::SeqCst);
    let mut last_progress = Instant::now();
    while last < target && last_progress.elapsed() < idle {
        thread::sleep(Duration::from_millis(5));
        let now = consumed.load(Ordering::SeqCst);
        if now != last {
            last = now;
            last_progress = Instant::now();
        }
    }
}

/// Publish, consume and close, returning what happened
pub fn run_consumers(args: &cli::Args, config: ConsumerConfig) -> Result<RunReport> {
    cli::args::validate_args(args)?;
    let started = Instant::now();
    let broker = Arc::new(InMemoryBroker::new());
    let connection = Connection::new(broker.clone(), config)?;

    for i in 0..args.messages {
        broker.publish(&args.queue, format!("message {}", i))?;
    }
    info!("published {} messages to '{}'", args.messages, args.queue);

    let consumed = Arc::new(AtomicUsize::new(0));
    let mut consumers = Vec::with_capacity(args.consumers);
    for _ in 0..args.consumers {
        let session = connection.create_session(args.ack_mode)?;
        let consumer = session.create_consumer(Destination::queue(args.queue.clone()))?;
        if args.listener {
            consumer.set_message_listener(Some(counting_listener(&consumed)))?;
        }
        consumers.push((session, consumer));
    }

    connection.start()?;

    let receivers = if args.listener {
        Vec::new()
    } else {
        consumers
            .iter()
            .enumerate()
            .map(|(i, (session, consumer))| {
                spawn_receiver(i, Arc::clone(session), Arc::clone(consumer), args, Arc::clone(&consumed))
            })
            .collect::<Result<Vec<_>>>()?
    };

    if let Some(pause_ms) = args.pause_ms {
        thread::sleep(Duration::from_millis(pause_ms / 2));
        info!("stopping connection for {}ms", pause_ms);
        connection.stop()?;
        thread::sleep(Duration::from_millis(pause_ms));
        connection.start()?;
    }

    if args.listener {
        wait_for_listeners(&consumed, args.messages, Duration::from_millis(args.timeout_ms));
        // Quiesce delivery threads so every delivery is on the books
        connection.stop()?;
        for (session, _) in &consumers {
            settle(session, args.ack_mode)?;
        }
    }

    for receiver in receivers {
        match receiver.join() {
            Ok(result) => result?,
            Err(_) => warn!("receiver thread panicked"),
        }
    }

    let statistics = connection.statistics();
    connection.close()?;

    Ok(RunReport {
        published: args.messages,
        consumed: consumed.load(Ordering::SeqCst),
        remaining: broker.queue_depth(&args.queue),
        statistics,
        elapsed: started.elapsed(),
    })
}

//! Consumer Lifecycle Integration Tests
//!
//! Exercises the public API end to end: receives against a live broker,
//! listener delivery, pause/resume through the connection and close while
//! work is in flight.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use consumer_gate::broker::InMemoryBroker;
use consumer_gate::connection::Connection;
use consumer_gate::consumer::{
    ConsumerConfig, ConsumerEngine, ConsumerState, Destination, ListenerResult, Message, MessageListener,
};
use consumer_gate::session::{AckMode, Session};

fn fast_config() -> ConsumerConfig {
    ConsumerConfig {
        polling_interval_ms: 10,
        stop_timeout_ms: 200,
        ..ConsumerConfig::default()
    }
}

fn started_consumer(ack_mode: AckMode) -> (Arc<InMemoryBroker>, Connection, Arc<Session>, Arc<ConsumerEngine>) {
    let broker = Arc::new(InMemoryBroker::new());
    let connection = Connection::new(broker.clone(), fast_config()).unwrap();
    let session = connection.create_session(ack_mode).unwrap();
    let consumer = session.create_consumer(Destination::queue("jobs")).unwrap();
    connection.start().unwrap();
    (broker, connection, session, consumer)
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < Duration::from_secs(5), "condition not reached in time");
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_concurrent_receivers_share_queue_without_duplicates() {
    let (broker, connection, session, _consumer) = started_consumer(AckMode::Auto);
    for i in 0..200 {
        broker.publish("jobs", format!("job {}", i)).unwrap();
    }

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let consumer = session.create_consumer(Destination::queue("jobs")).unwrap();
            thread::spawn(move || {
                let mut seen = Vec::new();
                while let Some(message) = consumer.receive_timeout(Duration::from_millis(100)).unwrap() {
                    seen.push(message.text().unwrap().to_string());
                }
                seen
            })
        })
        .collect();

    let mut all: Vec<String> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 200);
    assert_eq!(broker.acked_count(), 200);
    connection.close().unwrap();
}

#[test]
fn test_receive_observes_close_from_another_thread() {
    let (_broker, connection, _session, consumer) = started_consumer(AckMode::Auto);
    let receiving = Arc::clone(&consumer);
    let receiver = thread::spawn(move || receiving.receive().unwrap());

    wait_until(|| consumer.number_of_receives() == 1);
    thread::sleep(Duration::from_millis(25));
    connection.close().unwrap();

    assert!(receiver.join().unwrap().is_none());
    assert_eq!(consumer.state(), ConsumerState::Closed);
    assert!(consumer.receive_no_wait().unwrap_err().is_illegal_state());
}

#[test]
fn test_listener_requeue_on_failure_redelivers() {
    let broker = Arc::new(InMemoryBroker::new());
    let config = ConsumerConfig {
        requeue_on_listener_exception: true,
        ..fast_config()
    };
    let connection = Connection::new(broker.clone(), config).unwrap();
    let session = connection.create_session(AckMode::Auto).unwrap();
    let consumer = session.create_consumer(Destination::queue("jobs")).unwrap();

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let listener: Arc<dyn MessageListener> = Arc::new(move |message: Message| -> ListenerResult {
        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
            return Err(format!("cannot handle {:?} yet", message.text()).into());
        }
        Ok(())
    });
    consumer.set_message_listener(Some(listener)).unwrap();

    broker.publish("jobs", "flaky").unwrap();
    connection.start().unwrap();

    wait_until(|| attempts.load(Ordering::SeqCst) == 3);
    wait_until(|| broker.acked_count() == 1);
    let stats = consumer.statistics();
    assert_eq!(stats.listener_deliveries, 3);
    assert_eq!(stats.listener_failures, 2);
    connection.close().unwrap();
}

#[test]
fn test_topic_subscriber_reads_its_own_queue() {
    let (broker, connection, session, _queue_consumer) = started_consumer(AckMode::Auto);
    let subscriber = session.create_consumer(Destination::topic("prices")).unwrap();

    broker.publish(subscriber.queue_name(), "tick").unwrap();
    let message = subscriber.receive_timeout(Duration::from_secs(1)).unwrap().unwrap();
    assert_eq!(message.text(), Some("tick"));
    assert_eq!(message.destination.name(), "prices");
    connection.close().unwrap();
}

#[test]
fn test_direct_reply_to_needs_no_acknowledgement() {
    let (broker, connection, session, _consumer) = started_consumer(AckMode::Client);
    let replies = session.create_consumer(Destination::direct_reply_to()).unwrap();

    broker
        .publish_with_reply_to(consumer_gate::consumer::DIRECT_REPLY_TO, "pong", Some("caller".to_string()))
        .unwrap();
    let reply = replies.receive_timeout(Duration::from_secs(1)).unwrap().unwrap();
    assert_eq!(reply.reply_to.as_deref(), Some("caller"));
    assert_eq!(session.pending_acknowledgements(), 0);
    assert_eq!(broker.unacked_count(), 0);
    connection.close().unwrap();
}

#[test]
fn test_dropping_connection_closes_consumers() {
    let (_broker, connection, _session, consumer) = started_consumer(AckMode::Auto);
    drop(connection);
    assert!(consumer.is_closed());
}

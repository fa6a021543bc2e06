//! Connection Control Integration Tests
//!
//! Start/stop of a connection fans out to every session and consumer:
//! stopped connections hold back both receives and listener delivery.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use consumer_gate::broker::InMemoryBroker;
use consumer_gate::connection::Connection;
use consumer_gate::consumer::{ConsumerConfig, ConsumerState, Destination, ListenerResult, Message, MessageListener};
use consumer_gate::session::AckMode;

fn fast_config() -> ConsumerConfig {
    ConsumerConfig {
        polling_interval_ms: 10,
        stop_timeout_ms: 200,
        ..ConsumerConfig::default()
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < Duration::from_secs(5), "condition not reached in time");
        thread::sleep(Duration::from_millis(2));
    }
}

fn counting_listener(count: &Arc<AtomicUsize>) -> Arc<dyn MessageListener> {
    let count = Arc::clone(count);
    Arc::new(move |_message: Message| -> ListenerResult {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

#[test]
fn test_listener_set_on_stopped_connection_waits_for_start() {
    let broker = Arc::new(InMemoryBroker::new());
    let connection = Connection::new(broker.clone(), fast_config()).unwrap();
    let session = connection.create_session(AckMode::Auto).unwrap();
    let consumer = session.create_consumer(Destination::queue("events")).unwrap();
    assert_eq!(consumer.state(), ConsumerState::Paused);

    let count = Arc::new(AtomicUsize::new(0));
    consumer.set_message_listener(Some(counting_listener(&count))).unwrap();
    broker.publish("events", "early").unwrap();

    thread::sleep(Duration::from_millis(50));
    assert_eq!(count.load(Ordering::SeqCst), 0);

    connection.start().unwrap();
    wait_until(|| count.load(Ordering::SeqCst) == 1);
    connection.close().unwrap();
}

#[test]
fn test_stop_and_start_cycle_across_sessions() {
    let broker = Arc::new(InMemoryBroker::new());
    let connection = Connection::new(broker.clone(), fast_config()).unwrap();

    let pushed = Arc::new(AtomicUsize::new(0));
    let push_session = connection.create_session(AckMode::Auto).unwrap();
    let push_consumer = push_session.create_consumer(Destination::queue("push")).unwrap();
    push_consumer.set_message_listener(Some(counting_listener(&pushed))).unwrap();

    let pull_session = connection.create_session(AckMode::Auto).unwrap();
    let pull_consumer = pull_session.create_consumer(Destination::queue("pull")).unwrap();

    connection.start().unwrap();
    connection.stop().unwrap();
    assert!(connection.is_stopped());
    assert_eq!(pull_consumer.state(), ConsumerState::Paused);

    broker.publish("push", "p").unwrap();
    broker.publish("pull", "q").unwrap();
    assert!(pull_consumer.receive_timeout(Duration::from_millis(40)).unwrap().is_none());
    assert_eq!(pushed.load(Ordering::SeqCst), 0);

    connection.start().unwrap();
    wait_until(|| pushed.load(Ordering::SeqCst) == 1);
    assert_eq!(pull_consumer.receive_timeout(Duration::from_secs(1)).unwrap().unwrap().text(), Some("q"));

    let stats = connection.statistics();
    assert_eq!(stats.listener_deliveries, 1);
    assert_eq!(stats.messages_received, 1);
    connection.close().unwrap();
}

#[test]
fn test_stop_releases_receive_blocked_at_gate_only_on_start() {
    let broker = Arc::new(InMemoryBroker::new());
    let connection = Connection::new(broker.clone(), fast_config()).unwrap();
    let session = connection.create_session(AckMode::Auto).unwrap();
    let consumer = session.create_consumer(Destination::queue("gated")).unwrap();
    broker.publish("gated", "waiting").unwrap();

    let receiving = Arc::clone(&consumer);
    let receiver = thread::spawn(move || receiving.receive_timeout(Duration::from_secs(5)).unwrap());
    wait_until(|| consumer.number_of_receives() == 1);
    thread::sleep(Duration::from_millis(30));
    assert_eq!(broker.fetch_attempts(), 0);

    connection.start().unwrap();
    assert_eq!(receiver.join().unwrap().unwrap().text(), Some("waiting"));
    connection.close().unwrap();
}

#[test]
fn test_operations_after_close_fail() {
    let broker = Arc::new(InMemoryBroker::new());
    let connection = Connection::new(broker, fast_config()).unwrap();
    let session = connection.create_session(AckMode::Transacted).unwrap();
    connection.close().unwrap();

    assert!(connection.start().is_err());
    assert!(connection.stop().is_err());
    assert!(session.create_consumer(Destination::queue("late")).is_err());
    assert!(session.commit().is_err());
    connection.close().unwrap();
}

#[test]
fn test_stop_racing_consumer_setup_leaves_everything_stopped() {
    for round in 0..20 {
        let broker = Arc::new(InMemoryBroker::new());
        let connection = Arc::new(Connection::new(broker.clone(), fast_config()).unwrap());
        let session = connection.create_session(AckMode::Auto).unwrap();
        connection.start().unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let stopper = {
            let connection = Arc::clone(&connection);
            thread::spawn(move || connection.stop().unwrap())
        };
        let pull = session.create_consumer(Destination::queue("pull")).unwrap();
        let push = session.create_consumer(Destination::queue("push")).unwrap();
        push.set_message_listener(Some(counting_listener(&count))).unwrap();
        stopper.join().unwrap();

        assert!(connection.is_stopped());
        assert_eq!(pull.state(), ConsumerState::Paused, "round {}", round);

        broker.publish("push", "held back").unwrap();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), 0, "round {}", round);
        assert_eq!(broker.queue_depth("push"), 1, "round {}", round);
        connection.close().unwrap();
    }
}

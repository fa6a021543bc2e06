//! Scenario tests for the consumer core


use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use crate::broker::InMemoryBroker;
use crate::consumer::{ConsumerConfig, ConsumerEngine, Destination};
use crate::session::{AckMode, Session};

pub(crate) struct Fixture {
    pub broker: Arc<InMemoryBroker>,
    pub session: Arc<Session>,
    pub consumer: Arc<ConsumerEngine>,
}

/// A running session with one queue consumer on "work"
pub(crate) fn fixture(polling_interval_ms: u64) -> Fixture {
    use crate::connection::ConnectionState;

    let broker = Arc::new(InMemoryBroker::new());
    let config = ConsumerConfig {
        polling_interval_ms,
        stop_timeout_ms: 200,
        ..ConsumerConfig::default()
    };
    let session = Session::new(AckMode::Auto, broker.clone(), Arc::new(ConnectionState::new(false)), config);
    let consumer = session.create_consumer(Destination::queue("work")).unwrap();
    Fixture { broker, session, consumer }
}

pub(crate) fn wait_until(mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < Duration::from_secs(5), "condition not reached in time");
        thread::sleep(Duration::from_millis(2));
    }
}

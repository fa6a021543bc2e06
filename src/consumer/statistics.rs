//! Consumer Statistics
//!
//! Outcome counters for one consumer. `receive` reports both a timeout and
//! an administrative abort as "no message"; the counters are where the two
//! can still be told apart.

use std::sync::atomic::{AtomicU64, Ordering};
use serde::Serialize;

/// Live counters, updated without locking
#[derive(Debug, Default)]
pub struct ConsumerStatistics {
    receive_calls: AtomicU64,
    messages_received: AtomicU64,
    timeouts: AtomicU64,
    aborts: AtomicU64,
    fetch_attempts: AtomicU64,
    fetch_failures: AtomicU64,
    listener_deliveries: AtomicU64,
    listener_failures: AtomicU64,
}

/// Point-in-time copy of [`ConsumerStatistics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub receive_calls: u64,
    pub messages_received: u64,
    pub timeouts: u64,
    pub aborts: u64,
    pub fetch_attempts: u64,
    pub fetch_failures: u64,
    pub listener_deliveries: u64,
    pub listener_failures: u64,
}

impl ConsumerStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_receive_call(&self) {
        self.receive_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abort(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch(&self, failed: bool) {
        self.fetch_attempts.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.fetch_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_listener_delivery(&self, failed: bool) {
        self.listener_deliveries.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.listener_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            receive_calls: self.receive_calls.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            fetch_attempts: self.fetch_attempts.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            listener_deliveries: self.listener_deliveries.load(Ordering::Relaxed),
            listener_failures: self.listener_failures.load(Ordering::Relaxed),
        }
    }
}

impl StatisticsSnapshot {
    /// Sum two snapshots, e.g. across every consumer of a connection
    pub fn merge(&self, other: &StatisticsSnapshot) -> StatisticsSnapshot {
        StatisticsSnapshot {
            receive_calls: self.receive_calls + other.receive_calls,
            messages_received: self.messages_received + other.messages_received,
            timeouts: self.timeouts + other.timeouts,
            aborts: self.aborts + other.aborts,
            fetch_attempts: self.fetch_attempts + other.fetch_attempts,
            fetch_failures: self.fetch_failures + other.fetch_failures,
            listener_deliveries: self.listener_deliveries + other.listener_deliveries,
            listener_failures: self.listener_failures + other.listener_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let stats = ConsumerStatistics::new();
        stats.record_receive_call();
        stats.record_fetch(false);
        stats.record_fetch(true);
        stats.record_timeout();
        stats.record_abort();
        stats.record_message();
        stats.record_listener_delivery(true);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.receive_calls, 1);
        assert_eq!(snapshot.fetch_attempts, 2);
        assert_eq!(snapshot.fetch_failures, 1);
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.aborts, 1);
        assert_eq!(snapshot.messages_received, 1);
        assert_eq!(snapshot.listener_failures, 1);
    }

    #[test]
    fn test_merge() {
        let a = StatisticsSnapshot { receive_calls: 2, timeouts: 1, ..Default::default() };
        let b = StatisticsSnapshot { receive_calls: 3, aborts: 4, ..Default::default() };
        let merged = a.merge(&b);
        assert_eq!(merged.receive_calls, 5);
        assert_eq!(merged.timeouts, 1);
        assert_eq!(merged.aborts, 4);
    }
}

//! Polling Receiver
//!
//! Turns a non-blocking "fetch one message now" primitive into a blocking
//! fetch bounded by a [`Deadline`]. The fetch is retried at a fixed polling
//! interval; waiting happens on a condition variable that `abort` signals,
//! so a blocked caller is released as soon as the receiver is aborted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use parking_lot::{Condvar, Mutex};
use log::{debug, warn};
use crate::consumer::deadline::Deadline;

/// Interval between fetch attempts unless configured otherwise
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(100);

/// Configured intervals must be strictly longer than this
pub const MIN_POLLING_INTERVAL: Duration = Duration::from_millis(1);

/// How a poll ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Polled<T> {
    Message(T),
    TimedOut,
    Aborted,
}

impl<T> Polled<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Polled::Message(message) => Some(message),
            Polled::TimedOut | Polled::Aborted => None,
        }
    }
}

/// Abortable blocking fetch over a non-blocking source
#[derive(Debug)]
pub struct PollingReceiver {
    aborted: Mutex<bool>,
    wakeup: Condvar,
    interval_nanos: AtomicU64,
}

impl Default for PollingReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl PollingReceiver {
    pub fn new() -> Self {
        Self {
            aborted: Mutex::new(false),
            wakeup: Condvar::new(),
            interval_nanos: AtomicU64::new(DEFAULT_POLLING_INTERVAL.as_nanos() as u64),
        }
    }

    /// Create a receiver with a polling interval; invalid values keep the default
    pub fn with_polling_interval(interval: Option<Duration>) -> Self {
        let receiver = Self::new();
        receiver.set_polling_interval(interval);
        receiver
    }

    /// Change the polling interval.
    ///
    /// Missing values and values not above [`MIN_POLLING_INTERVAL`] are
    /// rejected with a warning and the current interval is kept. Returns
    /// whether the interval was changed.
    pub fn set_polling_interval(&self, interval: Option<Duration>) -> bool {
        match interval {
            Some(interval) if interval > MIN_POLLING_INTERVAL => {
                self.interval_nanos
                    .store(interval.as_nanos().min(u64::MAX as u128) as u64, Ordering::Relaxed);
                true
            }
            other => {
                warn!("Invalid or missing polling interval: {:?}", other);
                false
            }
        }
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_nanos(self.interval_nanos.load(Ordering::Relaxed))
    }

    /// Fetch a message, retrying until one arrives, the deadline expires or
    /// the receiver is aborted.
    ///
    /// `try_get` is called at least once (even with an expired deadline) and
    /// always under the receiver's lock, so an abort cannot slip in between
    /// an empty fetch and the following wait.
    pub fn poll<T, F>(&self, deadline: &Deadline, mut try_get: F) -> Polled<T>
    where
        F: FnMut() -> Option<T>,
    {
        let mut aborted = self.aborted.lock();
        if *aborted {
            return Polled::Aborted;
        }
        if let Some(message) = try_get() {
            return Polled::Message(message);
        }

        loop {
            if deadline.expired() {
                return Polled::TimedOut;
            }
            let wait = deadline.bounded(self.polling_interval());
            self.wakeup.wait_for(&mut aborted, wait);
            if *aborted {
                return Polled::Aborted;
            }
            if let Some(message) = try_get() {
                return Polled::Message(message);
            }
        }
    }

    /// [`poll`](Self::poll), folding timeout and abort into `None`
    pub fn get<T, F>(&self, deadline: &Deadline, try_get: F) -> Option<T>
    where
        F: FnMut() -> Option<T>,
    {
        self.poll(deadline, try_get).into_option()
    }

    /// Abort all current and future polls. Idempotent.
    pub fn abort(&self) {
        let mut aborted = self.aborted.lock();
        if !*aborted {
            debug!("polling receiver aborted");
        }
        *aborted = true;
        self.wakeup.notify_all();
    }

    pub fn close(&self) {
        self.abort();
    }

    pub fn is_aborted(&self) -> bool {
        *self.aborted.lock()
    }
}

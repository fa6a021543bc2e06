//! Consumer Configuration
//!
//! Tunables for receive polling, pause draining and listener delivery.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use log::warn;
use crate::consumer::error::{ConsumerError, ConsumerResult};
use crate::consumer::polling::{DEFAULT_POLLING_INTERVAL, MIN_POLLING_INTERVAL};

/// Consumer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Interval between fetch attempts while a receive waits
    pub polling_interval_ms: u64,

    /// Upper bound on how long a pause waits for in-flight receives
    pub stop_timeout_ms: u64,

    /// Nack with requeue when a listener callback fails
    pub requeue_on_listener_exception: bool,

    /// Nack with requeue when a listener callback overruns the termination timeout
    pub requeue_on_timeout: bool,

    /// How long a listener callback may run before it counts as timed out
    pub listener_termination_timeout_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: DEFAULT_POLLING_INTERVAL.as_millis() as u64,
            stop_timeout_ms: 1000,
            requeue_on_listener_exception: false,
            requeue_on_timeout: false,
            listener_termination_timeout_ms: 15_000,
        }
    }
}

impl ConsumerConfig {
    /// Check flag combinations; the polling interval is handled by
    /// [`polling_interval`](Self::polling_interval) instead.
    pub fn validate(&self) -> ConsumerResult<()> {
        if self.requeue_on_timeout && !self.requeue_on_listener_exception {
            return Err(ConsumerError::invalid_configuration(
                "requeue_on_timeout can be true only if requeue_on_listener_exception is true as well",
            ));
        }
        if self.stop_timeout_ms == 0 {
            return Err(ConsumerError::invalid_configuration("stop_timeout_ms must be greater than 0"));
        }
        Ok(())
    }

    /// Configured polling interval, falling back to the default when invalid
    pub fn polling_interval(&self) -> Duration {
        let interval = Duration::from_millis(self.polling_interval_ms);
        if interval > MIN_POLLING_INTERVAL {
            interval
        } else {
            warn!("Invalid polling interval {}ms, using {:?}", self.polling_interval_ms, DEFAULT_POLLING_INTERVAL);
            DEFAULT_POLLING_INTERVAL
        }
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn listener_termination_timeout(&self) -> Duration {
        Duration::from_millis(self.listener_termination_timeout_ms)
    }
}

//! Deadline Tracking
//!
//! Elapsed-time budget for a blocking operation, measured against the
//! monotonic clock. A deadline is either unbounded ("wait forever") or a
//! fixed budget from the moment it was started; a zero budget means "check
//! once, do not wait".

use std::time::{Duration, Instant};

/// Time budget for one blocking call
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Option<Duration>,
}

impl Deadline {
    /// Start a deadline; `None` waits forever
    pub fn start(budget: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    /// A deadline that never expires
    pub fn forever() -> Self {
        Self::start(None)
    }

    /// A deadline that is already expired
    pub fn zero() -> Self {
        Self::start(Some(Duration::ZERO))
    }

    /// A deadline expiring `budget` from now
    pub fn after(budget: Duration) -> Self {
        Self::start(Some(budget))
    }

    /// Messaging-style timeout: a zero timeout means wait forever
    pub fn from_timeout(timeout: Duration) -> Self {
        if timeout.is_zero() {
            Self::forever()
        } else {
            Self::after(timeout)
        }
    }

    /// Whether this deadline waits forever
    pub fn is_forever(&self) -> bool {
        self.budget.is_none()
    }

    /// Time left, or `None` for a deadline that never expires
    pub fn remaining(&self) -> Option<Duration> {
        self.budget
            .map(|budget| budget.saturating_sub(self.started.elapsed()))
    }

    /// Whether the budget has been used up
    pub fn expired(&self) -> bool {
        matches!(self.remaining(), Some(left) if left.is_zero())
    }

    /// Time left, capped at `cap`
    pub fn bounded(&self, cap: Duration) -> Duration {
        match self.remaining() {
            Some(left) => left.min(cap),
            None => cap,
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::forever()
    }
}

//! Consumer Error Types
//!
//! Defines error types for consumer operations. Timeouts and administrative
//! aborts are not errors: a receive that ends either way yields `None`.

use thiserror::Error;
use crate::broker::TransportError;

/// Result type for consumer operations
pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// Errors that can occur during consumer operations
#[derive(Debug, Error, Clone)]
pub enum ConsumerError {
    /// Operation not permitted in the consumer's current mode or state
    #[error("Illegal state: {message}")]
    IllegalState { message: String },

    /// Consumer or session configuration was rejected
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    /// Failure reported by the underlying channel
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    /// A single background activity failed to start, stop or abort
    #[error("Activity '{activity_id}' failed: {message}")]
    Activity { activity_id: String, message: String },

    /// One or more members of a bulk lifecycle operation failed
    #[error("{operation} failed: {}", summarize(.failures))]
    ActivitiesFailed {
        operation: String,
        failures: Vec<ConsumerError>,
    },

    /// A message listener or closed listener reported a failure
    #[error("Listener failed: {message}")]
    Listener { message: String },
}

fn summarize(failures: &[ConsumerError]) -> String {
    failures
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ConsumerError {
    /// Create an illegal state error
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Create an activity failure error
    pub fn activity(activity_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Activity {
            activity_id: activity_id.into(),
            message: message.into(),
        }
    }

    /// Create a listener failure error
    pub fn listener(message: impl Into<String>) -> Self {
        Self::Listener {
            message: message.into(),
        }
    }

    /// Whether this error reports a mode conflict or use after close
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, Self::IllegalState { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_error_creation() {
        let error = ConsumerError::illegal_state("consumer is closed");
        assert_eq!(error.to_string(), "Illegal state: consumer is closed");
        assert!(error.is_illegal_state());

        let error = ConsumerError::activity("jms-consumer-1", "thread gone");
        assert_eq!(error.to_string(), "Activity 'jms-consumer-1' failed: thread gone");
        assert!(!error.is_illegal_state());
    }

    #[test]
    fn test_aggregate_error_message() {
        let error = ConsumerError::ActivitiesFailed {
            operation: "stop".to_string(),
            failures: vec![
                ConsumerError::activity("a", "first"),
                ConsumerError::activity("b", "second"),
            ],
        };
        let text = error.to_string();
        assert!(text.starts_with("stop failed: "));
        assert!(text.contains("Activity 'a' failed: first"));
        assert!(text.contains("Activity 'b' failed: second"));
    }

    #[test]
    fn test_transport_error_conversion() {
        let error: ConsumerError = TransportError::Shutdown.into();
        assert!(matches!(error, ConsumerError::Transport(TransportError::Shutdown)));
    }
}

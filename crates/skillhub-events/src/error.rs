//! Error types for the skillhub-events crate.

use thiserror::Error;

/// Error type returned by user handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur during event bus operations.
#[derive(Debug, Error)]
pub enum EventError {
    // Configuration errors (permanent, no retry)
    /// Required configuration variable is missing.
    #[error("Configuration missing: {var}")]
    ConfigMissing { var: String },

    /// Configuration value is invalid.
    #[error("Configuration invalid for {var}: {reason}")]
    ConfigInvalid { var: String, reason: String },

    // Connection errors (transient, retry with backoff)
    /// Failed to connect to a broker.
    #[error("Connection to broker {broker} failed: {cause}")]
    ConnectionFailed { broker: String, cause: String },

    /// Connection timed out.
    #[error("Connection timed out")]
    ConnectionTimeout,

    /// The channel or bus has no live connection.
    #[error("Not connected")]
    NotConnected,

    /// Reconnection gave up after the configured number of attempts.
    #[error("Reconnect to {broker} gave up after {attempts} attempts: {cause}")]
    RetryExhausted {
        broker: String,
        attempts: u32,
        cause: String,
    },

    /// The operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    // Publishing errors
    /// Event type is empty or whitespace.
    #[error("Invalid event type: {event_type:?}")]
    InvalidEventType { event_type: String },

    /// Failed to publish event to a destination (exchange or topic).
    #[error("Failed to publish to {destination}: {cause}")]
    PublishFailed { destination: String, cause: String },

    /// Publish did not complete within the configured timeout.
    #[error("Publish of {event_type} timed out after {timeout_ms}ms")]
    PublishTimeout { event_type: String, timeout_ms: u64 },

    /// Failed to serialize event.
    #[error("Failed to serialize event type {event_type}: {cause}")]
    SerializationFailed { event_type: String, cause: String },

    // Consuming errors
    /// Failed to consume from a queue or topic.
    #[error("Failed to consume from {source_name}: {cause}")]
    ConsumeFailed { source_name: String, cause: String },

    /// Failed to deserialize event.
    #[error("Failed to deserialize event: {cause}")]
    DeserializationFailed { cause: String },

    /// Event handler failed.
    #[error("Handler failed for event {event_id}: {cause}")]
    HandlerFailed { event_id: String, cause: String },

    /// Event handler panicked.
    #[error("Handler panicked for event {event_id}")]
    HandlerPanicked { event_id: String },

    /// The delivery was already acknowledged, nacked or rejected.
    #[error("Delivery for event {event_id} already settled")]
    AlreadySettled { event_id: String },

    /// No subscription with the given id.
    #[error("Unknown subscription {id}")]
    UnknownSubscription { id: u64 },

    // Internal broker client errors
    /// Internal AMQP client error.
    #[cfg(feature = "amqp")]
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Internal Kafka client error.
    #[cfg(feature = "kafka")]
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

impl EventError {
    /// Returns true if this error is transient and can be retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            EventError::ConnectionFailed { .. }
            | EventError::ConnectionTimeout
            | EventError::NotConnected
            | EventError::PublishFailed { .. }
            | EventError::PublishTimeout { .. }
            | EventError::ConsumeFailed { .. } => true,
            #[cfg(feature = "amqp")]
            EventError::Amqp(_) => true,
            #[cfg(feature = "kafka")]
            EventError::Kafka(_) => true,
            _ => false,
        }
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            EventError::ConfigMissing { .. } | EventError::ConfigInvalid { .. }
        )
    }

    /// Returns true if the bytes on the wire could not be decoded.
    ///
    /// Such messages are never redelivered on the reliable channel.
    #[must_use]
    pub fn is_poison(&self) -> bool {
        matches!(self, EventError::DeserializationFailed { .. })
    }
}

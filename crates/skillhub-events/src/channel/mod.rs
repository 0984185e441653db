//! Channel abstraction shared by the reliable and stream adapters.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 EventBus (facade)                            │
//! │   Publisher ──────────────┐        Dispatcher ─────────┐     │
//! └───────────────────────────┼────────────────────────────┼─────┘
//!                             ▼                            ▼
//!            ┌─────────────────────────┐   ┌─────────────────────────┐
//!            │ ReliableTransport       │   │ StreamTransport         │
//!            │ publish / subscribe     │   │ publish / subscribe_    │
//!            │ (ack, nack, reject)     │   │ stream (commit offsets) │
//!            └────────────┬────────────┘   └────────────┬────────────┘
//!                         ▼                             ▼
//!             ConnectionManager<C>          ConnectionManager<C>
//!             amqp | memory                 kafka | memory
//! ```

mod reliable;
mod stream;

pub use reliable::{OutboundMessage, QueueClient, ReliableChannel};
pub use stream::{LogClient, StreamChannel};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionEvent;
use crate::envelope::{EventEnvelope, Headers};
use crate::error::EventError;

/// Which transport a channel adapts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Reliable,
    Stream,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reliable => f.write_str("reliable"),
            Self::Stream => f.write_str("stream"),
        }
    }
}

/// Lifecycle shared by every channel adapter.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    fn kind(&self) -> ChannelKind;

    /// Connect once and prepare broker-side topology.
    async fn connect(&self, cancel: &CancellationToken) -> Result<(), EventError>;

    /// Re-establish a dropped connection with backoff.
    async fn reconnect(&self, cancel: &CancellationToken) -> Result<(), EventError>;

    /// Close the connection. Safe to call repeatedly.
    async fn close(&self) -> Result<(), EventError>;

    fn is_healthy(&self) -> bool;

    /// Lifecycle notifications of the underlying connection.
    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent>;
}

/// Queue declaration and consumption settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survive broker restarts.
    pub durable: bool,
    /// Unacknowledged deliveries held at once; 0 means unlimited.
    pub prefetch: u16,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            prefetch: 16,
        }
    }
}

/// Acknowledged, topic-routed queue broker.
#[async_trait]
pub trait ReliableTransport: Channel {
    /// Assert the durable topic exchange. Idempotent.
    async fn declare_topology(&self) -> Result<(), EventError>;

    /// Publish a persistent message; routing key defaults to the event type.
    async fn publish(
        &self,
        envelope: &EventEnvelope,
        routing_key: Option<&str>,
    ) -> Result<(), EventError>;

    /// Assert and bind `queue` to `pattern`, then start consuming it.
    async fn subscribe(
        &self,
        pattern: &str,
        queue: &str,
        options: &QueueOptions,
    ) -> Result<DeliveryStream, EventError>;
}

/// Partitioned, offset-addressed log broker.
#[async_trait]
pub trait StreamTransport: Channel {
    /// Append to the derived (or overridden) topic keyed by `envelope.id`.
    async fn publish(&self, envelope: &EventEnvelope, topic: Option<&str>)
        -> Result<(), EventError>;

    /// Join `group_id` on `topics`.
    async fn subscribe_stream(
        &self,
        topics: &[String],
        group_id: &str,
        start: StartPosition,
    ) -> Result<Box<dyn GroupConsumer>, EventError>;
}

/// Broker-side settlement of one reliable delivery.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), EventError>;
    async fn nack(&self, requeue: bool) -> Result<(), EventError>;
    async fn reject(&self) -> Result<(), EventError>;
}

/// One message received from a queue.
pub struct Delivery {
    pub body: Vec<u8>,
    pub headers: Headers,
    pub redelivered: bool,
    pub acker: Arc<dyn Acker>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("body_len", &self.body.len())
            .field("headers", &self.headers)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from one consumer. Ends when the consumer closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, EventError>>;

/// Acknowledgement handle given to reliable handlers.
///
/// Each delivery can be settled once; later calls fail with
/// [`EventError::AlreadySettled`].
#[derive(Clone)]
pub struct AckHandle {
    event_id: Arc<str>,
    acker: Arc<dyn Acker>,
    settled: Arc<AtomicBool>,
    redelivered: bool,
}

impl AckHandle {
    pub(crate) fn new(event_id: &str, acker: Arc<dyn Acker>, redelivered: bool) -> Self {
        Self {
            event_id: Arc::from(event_id),
            acker,
            settled: Arc::new(AtomicBool::new(false)),
            redelivered,
        }
    }

    /// Confirm processing.
    pub async fn ack(&self) -> Result<(), EventError> {
        self.claim()?;
        self.acker.ack().await
    }

    /// Signal failure; `requeue` asks the broker to redeliver.
    pub async fn nack(&self, requeue: bool) -> Result<(), EventError> {
        self.claim()?;
        self.acker.nack(requeue).await
    }

    /// Discard the message without redelivery.
    pub async fn reject(&self) -> Result<(), EventError> {
        self.claim()?;
        self.acker.reject().await
    }

    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    /// Whether the broker flagged this delivery as a redelivery.
    #[must_use]
    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    #[must_use]
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    fn claim(&self) -> Result<(), EventError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(EventError::AlreadySettled {
                event_id: self.event_id.to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("event_id", &self.event_id)
            .field("settled", &self.is_settled())
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Where a new consumer group member starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// Committed offset, or only new records when none is committed.
    #[default]
    Latest,
    /// Committed offset, or the beginning of the log when none is committed.
    Earliest,
    /// Replay every assigned partition from this offset.
    Offset(i64),
}

/// One record read from the log broker.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

/// Context passed to stream handlers alongside the envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordContext {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub headers: Headers,
}

impl From<&StreamRecord> for RecordContext {
    fn from(record: &StreamRecord) -> Self {
        Self {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            headers: record.headers.clone(),
        }
    }
}

/// A member of a consumer group.
#[async_trait]
pub trait GroupConsumer: Send {
    /// Next batch of records; may be empty when nothing arrived in time.
    async fn poll(&mut self, max_records: usize) -> Result<Vec<StreamRecord>, EventError>;

    /// Commit `next_offset` as the next record to read for the group.
    async fn commit(&mut self, topic: &str, partition: i32, next_offset: i64)
        -> Result<(), EventError>;

    /// Move the read position so `offset` is delivered again.
    async fn seek(&mut self, topic: &str, partition: i32, offset: i64) -> Result<(), EventError>;

    /// Leave the group.
    async fn close(&mut self) -> Result<(), EventError>;
}

//! Stream channel: adapter over a partitioned log broker.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::{Channel, ChannelKind, GroupConsumer, StartPosition, StreamTransport};
use crate::connection::{ConnectionEvent, ConnectionManager, Connector};
use crate::envelope::{EventEnvelope, Headers};
use crate::error::EventError;
use crate::retry::RetryPolicy;
use crate::topic::derive_topic;

/// Operations a connected log broker client must provide.
///
/// `produce` is called concurrently by every publisher. Clients whose
/// connection cannot take concurrent writes guard it themselves; the Kafka
/// client hands records to librdkafka's internal queue and keeps many in flight.
#[async_trait]
pub trait LogClient: Send + Sync + 'static {
    /// Append one record and wait for the broker acknowledgement.
    ///
    /// Returns the `(partition, offset)` the record landed at.
    async fn produce(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
        headers: Headers,
    ) -> Result<(i32, i64), EventError>;

    /// Join a consumer group with manual offset commits.
    async fn join_group(
        &self,
        topics: &[String],
        group_id: &str,
        start: StartPosition,
    ) -> Result<Box<dyn GroupConsumer>, EventError>;
}

/// High-throughput, partitioned, replayable delivery.
pub struct StreamChannel<C: Connector> {
    connection: ConnectionManager<C>,
}

impl<C> StreamChannel<C>
where
    C: Connector,
    C::Client: LogClient,
{
    pub fn new(connector: C, retry: RetryPolicy) -> Self {
        Self {
            connection: ConnectionManager::new(connector, retry),
        }
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionManager<C> {
        &self.connection
    }

    fn observe<T>(&self, result: Result<T, EventError>) -> Result<T, EventError> {
        if let Err(e) = &result {
            if e.is_transient() {
                self.connection.report_failure(e);
            }
        }
        result
    }
}

#[async_trait]
impl<C> Channel for StreamChannel<C>
where
    C: Connector,
    C::Client: LogClient,
{
    fn kind(&self) -> ChannelKind {
        ChannelKind::Stream
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<(), EventError> {
        self.connection.connect(cancel).await
    }

    async fn reconnect(&self, cancel: &CancellationToken) -> Result<(), EventError> {
        self.connection.reconnect(cancel).await
    }

    async fn close(&self) -> Result<(), EventError> {
        self.connection.close().await
    }

    fn is_healthy(&self) -> bool {
        self.connection.is_healthy()
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.subscribe_events()
    }
}

#[async_trait]
impl<C> StreamTransport for StreamChannel<C>
where
    C: Connector,
    C::Client: LogClient,
{
    #[instrument(skip(self, envelope), fields(
        event_id = %envelope.id(),
        event_type = %envelope.event_type()
    ))]
    async fn publish(
        &self,
        envelope: &EventEnvelope,
        topic: Option<&str>,
    ) -> Result<(), EventError> {
        let topic = topic.map_or_else(|| derive_topic(envelope.event_type()), str::to_string);
        let payload = envelope.to_json_bytes()?;
        let client = self.connection.client()?;

        debug!(topic = %topic, payload_size = payload.len(), "Producing event");

        let result = client
            .produce(&topic, envelope.id(), payload, envelope.headers())
            .await;
        let (partition, offset) = self.observe(result)?;

        debug!(topic = %topic, partition, offset, "Event appended to log");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn subscribe_stream(
        &self,
        topics: &[String],
        group_id: &str,
        start: StartPosition,
    ) -> Result<Box<dyn GroupConsumer>, EventError> {
        let client = self.connection.client()?;
        let result = client.join_group(topics, group_id, start).await;
        let consumer = self.observe(result)?;

        info!("Joined consumer group");
        Ok(consumer)
    }
}

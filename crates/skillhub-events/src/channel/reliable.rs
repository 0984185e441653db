//! Reliable channel: adapter over an acknowledged queue broker.

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{Channel, ChannelKind, DeliveryStream, QueueOptions, ReliableTransport};
use crate::connection::{ConnectionEvent, ConnectionManager, Connector};
use crate::envelope::{EventEnvelope, Headers};
use crate::error::EventError;
use crate::retry::RetryPolicy;

/// Message handed to the queue broker client.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub headers: Headers,
    pub message_id: String,
    /// Survive broker restarts (delivery mode 2).
    pub persistent: bool,
}

/// Operations a connected queue broker client must provide.
#[async_trait]
pub trait QueueClient: Send + Sync + 'static {
    /// Assert a durable topic exchange.
    async fn declare_exchange(&self, exchange: &str) -> Result<(), EventError>;

    /// Publish and wait for the broker to accept the message.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), EventError>;

    /// Assert a non-exclusive, non-auto-delete queue.
    async fn declare_queue(&self, queue: &str, durable: bool) -> Result<(), EventError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> Result<(), EventError>;

    /// Start a manual-ack consumer.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, EventError>;
}

/// Durable, acknowledged delivery with topic-style routing.
pub struct ReliableChannel<C: Connector> {
    connection: ConnectionManager<C>,
    exchange: String,
    /// One writer at a time on the shared connection.
    publish_lock: Mutex<()>,
}

impl<C> ReliableChannel<C>
where
    C: Connector,
    C::Client: QueueClient,
{
    pub fn new(connector: C, exchange: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            connection: ConnectionManager::new(connector, retry),
            exchange: exchange.into(),
            publish_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
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
impl<C> Channel for ReliableChannel<C>
where
    C: Connector,
    C::Client: QueueClient,
{
    fn kind(&self) -> ChannelKind {
        ChannelKind::Reliable
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<(), EventError> {
        self.connection.connect(cancel).await?;
        if let Err(e) = self.declare_topology().await {
            if let Err(close_err) = self.connection.close().await {
                warn!(error = %close_err, "Failed to close connection after topology failure");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn reconnect(&self, cancel: &CancellationToken) -> Result<(), EventError> {
        self.connection.reconnect(cancel).await?;
        self.declare_topology().await
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
impl<C> ReliableTransport for ReliableChannel<C>
where
    C: Connector,
    C::Client: QueueClient,
{
    #[instrument(skip(self), fields(exchange = %self.exchange))]
    async fn declare_topology(&self) -> Result<(), EventError> {
        let client = self.connection.client()?;
        let result = client.declare_exchange(&self.exchange).await;
        self.observe(result)?;
        debug!("Topic exchange asserted");
        Ok(())
    }

    #[instrument(skip(self, envelope), fields(
        event_id = %envelope.id(),
        event_type = %envelope.event_type(),
        exchange = %self.exchange
    ))]
    async fn publish(
        &self,
        envelope: &EventEnvelope,
        routing_key: Option<&str>,
    ) -> Result<(), EventError> {
        let routing_key = routing_key.unwrap_or(envelope.event_type());
        let message = OutboundMessage {
            body: envelope.to_json_bytes()?,
            headers: envelope.headers(),
            message_id: envelope.id().to_string(),
            persistent: true,
        };

        let client = self.connection.client()?;

        debug!(
            routing_key = %routing_key,
            payload_size = message.body.len(),
            "Publishing event"
        );

        let result = {
            let _writer = self.publish_lock.lock().await;
            client.publish(&self.exchange, routing_key, message).await
        };
        self.observe(result)?;

        debug!("Event published to exchange");
        Ok(())
    }

    #[instrument(skip(self, options), fields(exchange = %self.exchange))]
    async fn subscribe(
        &self,
        pattern: &str,
        queue: &str,
        options: &QueueOptions,
    ) -> Result<DeliveryStream, EventError> {
        let client = self.connection.client()?;

        let result = client.declare_queue(queue, options.durable).await;
        self.observe(result)?;
        let result = client.bind_queue(queue, &self.exchange, pattern).await;
        self.observe(result)?;
        let result = client.consume(queue, options.prefetch).await;
        let deliveries = self.observe(result)?;

        info!(queue = %queue, pattern = %pattern, "Subscribed to queue");
        Ok(deliveries)
    }
}

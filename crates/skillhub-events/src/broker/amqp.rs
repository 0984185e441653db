//! AMQP 0.9.1 queue broker client.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, info};
use uuid::Uuid;

use crate::channel::{Acker, Delivery, DeliveryStream, OutboundMessage, QueueClient};
use crate::connection::Connector;
use crate::envelope::Headers;
use crate::error::EventError;

const PERSISTENT: u8 = 2;

/// Opens AMQP connections to one broker URL.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    url: String,
}

impl AmqpConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// A live AMQP connection with a confirm-mode publishing channel.
pub struct AmqpClient {
    connection: Connection,
    publisher: lapin::Channel,
}

#[async_trait]
impl Connector for AmqpConnector {
    type Client = AmqpClient;

    fn broker(&self) -> String {
        "amqp".to_string()
    }

    async fn connect(&self) -> Result<AmqpClient, EventError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| EventError::ConnectionFailed {
                broker: "amqp".to_string(),
                cause: e.to_string(),
            })?;

        let publisher = connection.create_channel().await?;
        publisher
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        info!("AMQP connection established");
        Ok(AmqpClient {
            connection,
            publisher,
        })
    }

    async fn close(&self, client: &AmqpClient) -> Result<(), EventError> {
        if client.connection.status().connected() {
            client.connection.close(200, "OK").await?;
        }
        Ok(())
    }

    fn is_open(&self, client: &AmqpClient) -> bool {
        client.connection.status().connected()
    }
}

fn to_field_table(headers: Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            ShortString::from(key),
            AMQPValue::LongString(LongString::from(value)),
        );
    }
    table
}

fn from_field_table(table: Option<&FieldTable>) -> Headers {
    let mut headers = Headers::new();
    let Some(table) = table else {
        return headers;
    };
    for (key, value) in table.inner() {
        let value = match value {
            AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
            AMQPValue::ShortString(s) => s.as_str().to_string(),
            _ => continue,
        };
        headers.insert(key.as_str().to_string(), value);
    }
    headers
}

#[async_trait]
impl QueueClient for AmqpClient {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), EventError> {
        self.publisher
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), EventError> {
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from("application/json".to_string()))
            .with_message_id(ShortString::from(message.message_id))
            .with_headers(to_field_table(message.headers));
        if message.persistent {
            properties = properties.with_delivery_mode(PERSISTENT);
        }

        let confirmation = self
            .publisher
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(EventError::PublishFailed {
                destination: exchange.to_string(),
                cause: "broker nacked the message".to_string(),
            });
        }
        Ok(())
    }

    async fn declare_queue(&self, queue: &str, durable: bool) -> Result<(), EventError> {
        self.publisher
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable,
                    exclusive: false,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> Result<(), EventError> {
        self.publisher
            .queue_bind(
                queue,
                exchange,
                binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, EventError> {
        let channel = self.connection.create_channel().await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;

        let tag = format!("{queue}-{}", Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        debug!(queue = %queue, consumer_tag = %tag, "AMQP consumer started");

        // The consumer channel lives as long as the stream.
        let deliveries = stream::unfold((consumer, channel), |(mut consumer, channel)| async move {
            let item = consumer.next().await?;
            let item = item.map(into_delivery).map_err(EventError::from);
            Some((item, (consumer, channel)))
        });
        Ok(Box::pin(deliveries))
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        headers: from_field_table(delivery.properties.headers().as_ref()),
        redelivered: delivery.redelivered,
        body: delivery.data,
        acker: Arc::new(AmqpAcker(delivery.acker)),
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<(), EventError> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), EventError> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await?;
        Ok(())
    }

    async fn reject(&self) -> Result<(), EventError> {
        self.0
            .reject(BasicRejectOptions { requeue: false })
            .await?;
        Ok(())
    }
}

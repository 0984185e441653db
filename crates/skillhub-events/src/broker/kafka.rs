//! Kafka log broker client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers as KafkaHeaders, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info};

use crate::channel::{GroupConsumer, LogClient, StartPosition, StreamRecord};
use crate::config::StreamConfig;
use crate::connection::Connector;
use crate::envelope::Headers;
use crate::error::EventError;

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const FIRST_RECORD_WAIT: Duration = Duration::from_millis(100);
const NEXT_RECORD_WAIT: Duration = Duration::from_millis(5);

/// Creates Kafka producers and consumers from a [`StreamConfig`].
#[derive(Debug, Clone)]
pub struct KafkaConnector {
    config: StreamConfig,
}

impl KafkaConnector {
    pub fn new(config: StreamConfig) -> Self {
        Self { config }
    }

    fn base_config(config: &StreamConfig) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("client.id", &config.client_id)
            .set("security.protocol", config.security_protocol.as_str());

        if let Some(sasl) = &config.sasl {
            client_config
                .set("sasl.mechanism", sasl.mechanism.as_str())
                .set("sasl.username", &sasl.username)
                .set("sasl.password", &sasl.password);
        }
        client_config
    }

    fn connection_failed(&self, cause: impl ToString) -> EventError {
        EventError::ConnectionFailed {
            broker: self.config.bootstrap_servers.clone(),
            cause: cause.to_string(),
        }
    }
}

/// A Kafka producer plus the settings needed to spawn group consumers.
pub struct KafkaClient {
    producer: FutureProducer,
    config: StreamConfig,
    open: AtomicBool,
}

#[async_trait]
impl Connector for KafkaConnector {
    type Client = KafkaClient;

    fn broker(&self) -> String {
        self.config.bootstrap_servers.clone()
    }

    async fn connect(&self) -> Result<KafkaClient, EventError> {
        let producer: FutureProducer = Self::base_config(&self.config)
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .create()
            .map_err(|e| self.connection_failed(e))?;

        // Producer creation is lazy; a metadata round-trip proves reachability.
        let metadata_producer = producer.clone();
        let metadata = tokio::task::spawn_blocking(move || {
            metadata_producer
                .client()
                .fetch_metadata(None, METADATA_TIMEOUT)
                .map(|m| m.brokers().len())
        })
        .await
        .map_err(|e| self.connection_failed(e))?
        .map_err(|e| self.connection_failed(e))?;

        info!(
            bootstrap_servers = %self.config.bootstrap_servers,
            client_id = %self.config.client_id,
            brokers = metadata,
            "Kafka producer connected"
        );

        Ok(KafkaClient {
            producer,
            config: self.config.clone(),
            open: AtomicBool::new(true),
        })
    }

    async fn close(&self, client: &KafkaClient) -> Result<(), EventError> {
        client.open.store(false, Ordering::SeqCst);
        let producer = client.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(SEND_TIMEOUT))
            .await
            .map_err(|e| self.connection_failed(e))??;
        Ok(())
    }

    fn is_open(&self, client: &KafkaClient) -> bool {
        client.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogClient for KafkaClient {
    async fn produce(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
        headers: Headers,
    ) -> Result<(i32, i64), EventError> {
        let mut kafka_headers = OwnedHeaders::new();
        for (name, value) in &headers {
            kafka_headers = kafka_headers.insert(Header {
                key: name,
                value: Some(value.as_str()),
            });
        }

        let record = FutureRecord::to(topic)
            .key(key)
            .payload(&payload)
            .headers(kafka_headers);

        self.producer
            .send(record, SEND_TIMEOUT)
            .await
            .map_err(|(err, _)| EventError::PublishFailed {
                destination: topic.to_string(),
                cause: err.to_string(),
            })
    }

    async fn join_group(
        &self,
        topics: &[String],
        group_id: &str,
        start: StartPosition,
    ) -> Result<Box<dyn GroupConsumer>, EventError> {
        let reset = match start {
            StartPosition::Latest => "latest",
            StartPosition::Earliest | StartPosition::Offset(_) => "earliest",
        };

        let consumer: StreamConsumer = KafkaConnector::base_config(&self.config)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", reset)
            .set("session.timeout.ms", "30000")
            .create()
            .map_err(|e| EventError::ConsumeFailed {
                source_name: group_id.to_string(),
                cause: e.to_string(),
            })?;
        let consumer = Arc::new(consumer);

        match start {
            StartPosition::Offset(offset) => {
                let topics = topics.to_vec();
                let assigner = Arc::clone(&consumer);
                tokio::task::spawn_blocking(move || assign_from(&assigner, &topics, offset))
                    .await
                    .map_err(|e| EventError::ConsumeFailed {
                        source_name: group_id.to_string(),
                        cause: e.to_string(),
                    })??;
            }
            StartPosition::Latest | StartPosition::Earliest => {
                let names: Vec<&str> = topics.iter().map(String::as_str).collect();
                consumer.subscribe(&names)?;
            }
        }

        debug!(group_id = %group_id, topics = ?topics, "Kafka consumer created");
        Ok(Box::new(KafkaGroupConsumer { consumer }))
    }
}

/// Manually assign every partition of `topics`, starting at `offset`.
fn assign_from(consumer: &StreamConsumer, topics: &[String], offset: i64) -> Result<(), EventError> {
    let mut assignment = TopicPartitionList::new();
    for topic in topics {
        let metadata = consumer.fetch_metadata(Some(topic), METADATA_TIMEOUT)?;
        for partition in metadata.topics().iter().flat_map(|t| t.partitions()) {
            assignment.add_partition_offset(topic, partition.id(), Offset::Offset(offset))?;
        }
    }
    consumer.assign(&assignment)?;
    Ok(())
}

fn to_record(message: &BorrowedMessage<'_>) -> StreamRecord {
    let mut headers = Headers::new();
    if let Some(kafka_headers) = message.headers() {
        for header in kafka_headers.iter() {
            if let Some(value) = header.value {
                headers.insert(
                    header.key.to_string(),
                    String::from_utf8_lossy(value).into_owned(),
                );
            }
        }
    }

    StreamRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers,
    }
}

struct KafkaGroupConsumer {
    consumer: Arc<StreamConsumer>,
}

#[async_trait]
impl GroupConsumer for KafkaGroupConsumer {
    async fn poll(&mut self, max_records: usize) -> Result<Vec<StreamRecord>, EventError> {
        let mut batch = Vec::new();
        let mut wait = FIRST_RECORD_WAIT;

        while batch.len() < max_records.max(1) {
            match tokio::time::timeout(wait, self.consumer.recv()).await {
                Ok(Ok(message)) => batch.push(to_record(&message)),
                Ok(Err(e)) if batch.is_empty() => return Err(e.into()),
                Ok(Err(_)) | Err(_) => break,
            }
            wait = NEXT_RECORD_WAIT;
        }
        Ok(batch)
    }

    async fn commit(
        &mut self,
        topic: &str,
        partition: i32,
        next_offset: i64,
    ) -> Result<(), EventError> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(topic, partition, Offset::Offset(next_offset))?;
        self.consumer.commit(&offsets, CommitMode::Async)?;
        Ok(())
    }

    async fn seek(&mut self, topic: &str, partition: i32, offset: i64) -> Result<(), EventError> {
        self.consumer
            .seek(topic, partition, Offset::Offset(offset), METADATA_TIMEOUT)?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), EventError> {
        self.consumer.unsubscribe();
        Ok(())
    }
}

//! In-memory partitioned log broker.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::channel::{GroupConsumer, LogClient, StartPosition, StreamRecord};
use crate::connection::Connector;
use crate::envelope::Headers;
use crate::error::EventError;

const BROKER: &str = "memory-log";
const DEFAULT_PARTITIONS: i32 = 3;
const POLL_WAIT: Duration = Duration::from_millis(100);

type GroupOffsets = HashMap<(String, String, i32), i64>;

struct LogState {
    available: bool,
    partitions: i32,
    topics: HashMap<String, Vec<Vec<StreamRecord>>>,
    committed: GroupOffsets,
}

impl LogState {
    fn topic_mut(&mut self, topic: &str) -> &mut Vec<Vec<StreamRecord>> {
        let partitions = self.partitions;
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| (0..partitions).map(|_| Vec::new()).collect())
    }

    fn end_offset(&self, topic: &str, partition: i32) -> i64 {
        self.topics
            .get(topic)
            .and_then(|parts| parts.get(partition as usize))
            .map_or(0, |log| log.len() as i64)
    }
}

/// Thread-safe in-memory log with keyed partitioning and group offsets.
///
/// Topics are created on first use. Every member of a group reads all
/// partitions; there is no rebalancing.
#[derive(Clone)]
pub struct MemoryLogBroker {
    state: Arc<Mutex<LogState>>,
    notify: Arc<Notify>,
}

impl Default for MemoryLogBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLogBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    #[must_use]
    pub fn with_partitions(partitions: i32) -> Self {
        Self {
            state: Arc::new(Mutex::new(LogState {
                available: true,
                partitions: partitions.max(1),
                topics: HashMap::new(),
                committed: HashMap::new(),
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Simulate a broker outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.state.lock().available
    }

    #[must_use]
    pub fn partitions(&self) -> i32 {
        self.state.lock().partitions
    }

    /// All records of `topic`, partition by partition.
    #[must_use]
    pub fn records(&self, topic: &str) -> Vec<StreamRecord> {
        self.state
            .lock()
            .topics
            .get(topic)
            .map(|parts| parts.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Next offset `group` will read from `partition`, if it committed one.
    #[must_use]
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state
            .lock()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    fn partition_for(&self, key: &str, partitions: i32) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % partitions as u64) as i32
    }
}

/// Connects clients to a [`MemoryLogBroker`].
#[derive(Clone)]
pub struct MemoryLogConnector {
    broker: MemoryLogBroker,
}

impl MemoryLogConnector {
    #[must_use]
    pub fn new(broker: MemoryLogBroker) -> Self {
        Self { broker }
    }
}

/// A connection to a [`MemoryLogBroker`].
pub struct MemoryLogClient {
    broker: MemoryLogBroker,
    open: Arc<AtomicBool>,
}

fn unavailable(name: &str) -> EventError {
    EventError::ConsumeFailed {
        source_name: name.to_string(),
        cause: "broker unavailable".to_string(),
    }
}

#[async_trait]
impl Connector for MemoryLogConnector {
    type Client = MemoryLogClient;

    fn broker(&self) -> String {
        BROKER.to_string()
    }

    async fn connect(&self) -> Result<MemoryLogClient, EventError> {
        if !self.broker.is_available() {
            return Err(EventError::ConnectionFailed {
                broker: BROKER.to_string(),
                cause: "broker unavailable".to_string(),
            });
        }
        Ok(MemoryLogClient {
            broker: self.broker.clone(),
            open: Arc::new(AtomicBool::new(true)),
        })
    }

    async fn close(&self, client: &MemoryLogClient) -> Result<(), EventError> {
        client.open.store(false, Ordering::SeqCst);
        self.broker.notify.notify_waiters();
        Ok(())
    }

    fn is_open(&self, client: &MemoryLogClient) -> bool {
        client.open.load(Ordering::SeqCst) && self.broker.is_available()
    }
}

#[async_trait]
impl LogClient for MemoryLogClient {
    async fn produce(
        &self,
        topic: &str,
        key: &str,
        payload: Vec<u8>,
        headers: Headers,
    ) -> Result<(i32, i64), EventError> {
        let mut state = self.broker.state.lock();
        if !state.available || !self.open.load(Ordering::SeqCst) {
            return Err(EventError::PublishFailed {
                destination: topic.to_string(),
                cause: "broker unavailable".to_string(),
            });
        }

        let partition = self.broker.partition_for(key, state.partitions);
        let log = &mut state.topic_mut(topic)[partition as usize];
        let offset = log.len() as i64;
        log.push(StreamRecord {
            topic: topic.to_string(),
            partition,
            offset,
            key: Some(key.as_bytes().to_vec()),
            payload,
            headers,
        });
        drop(state);

        self.broker.notify.notify_waiters();
        Ok((partition, offset))
    }

    async fn join_group(
        &self,
        topics: &[String],
        group_id: &str,
        start: StartPosition,
    ) -> Result<Box<dyn GroupConsumer>, EventError> {
        let mut state = self.broker.state.lock();
        if !state.available {
            return Err(unavailable(group_id));
        }

        let mut positions = HashMap::new();
        for topic in topics {
            let partitions = state.topic_mut(topic).len() as i32;
            for partition in 0..partitions {
                let end = state.end_offset(topic, partition);
                let committed = state
                    .committed
                    .get(&(group_id.to_string(), topic.clone(), partition))
                    .copied();
                let position = match start {
                    StartPosition::Offset(offset) => offset.clamp(0, end),
                    StartPosition::Earliest => committed.unwrap_or(0),
                    StartPosition::Latest => committed.unwrap_or(end),
                };
                positions.insert((topic.clone(), partition), position);
            }
        }

        Ok(Box::new(MemoryGroupConsumer {
            broker: self.broker.clone(),
            group_id: group_id.to_string(),
            positions,
            open: Arc::clone(&self.open),
            closed: false,
        }))
    }
}

struct MemoryGroupConsumer {
    broker: MemoryLogBroker,
    group_id: String,
    positions: HashMap<(String, i32), i64>,
    open: Arc<AtomicBool>,
    closed: bool,
}

impl MemoryGroupConsumer {
    fn take_ready(&mut self, max_records: usize) -> Result<Vec<StreamRecord>, EventError> {
        let state = self.broker.state.lock();
        if !state.available || !self.open.load(Ordering::SeqCst) {
            return Err(unavailable(&self.group_id));
        }

        let mut assigned: Vec<_> = self.positions.keys().cloned().collect();
        assigned.sort();

        let mut batch = Vec::new();
        for (topic, partition) in assigned {
            let Some(log) = state
                .topics
                .get(&topic)
                .and_then(|parts| parts.get(partition as usize))
            else {
                continue;
            };
            let position = self
                .positions
                .entry((topic, partition))
                .or_insert(0);
            while batch.len() < max_records {
                let Some(record) = log.get(*position as usize) else {
                    break;
                };
                batch.push(record.clone());
                *position += 1;
            }
        }
        Ok(batch)
    }
}

#[async_trait]
impl GroupConsumer for MemoryGroupConsumer {
    async fn poll(&mut self, max_records: usize) -> Result<Vec<StreamRecord>, EventError> {
        if self.closed {
            return Ok(Vec::new());
        }

        let notify = Arc::clone(&self.broker.notify);
        let deadline = Instant::now() + POLL_WAIT;
        loop {
            let notified = notify.notified();
            let batch = self.take_ready(max_records.max(1))?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn commit(
        &mut self,
        topic: &str,
        partition: i32,
        next_offset: i64,
    ) -> Result<(), EventError> {
        let mut state = self.broker.state.lock();
        if !state.available {
            return Err(unavailable(&self.group_id));
        }
        state.committed.insert(
            (self.group_id.clone(), topic.to_string(), partition),
            next_offset,
        );
        Ok(())
    }

    async fn seek(&mut self, topic: &str, partition: i32, offset: i64) -> Result<(), EventError> {
        self.positions
            .insert((topic.to_string(), partition), offset.max(0));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), EventError> {
        self.closed = true;
        Ok(())
    }
}

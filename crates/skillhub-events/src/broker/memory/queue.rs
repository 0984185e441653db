//! In-memory topic-exchange queue broker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::channel::{Acker, Delivery, DeliveryStream, OutboundMessage, QueueClient};
use crate::connection::Connector;
use crate::envelope::Headers;
use crate::error::EventError;
use crate::topic::topic_matches;

const BROKER: &str = "memory-queue";
const IDLE_WAIT: Duration = Duration::from_millis(25);

/// A message sitting in a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub body: Vec<u8>,
    pub headers: Headers,
    pub message_id: String,
    pub redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    bindings: Vec<(String, String)>,
    ready: VecDeque<StoredMessage>,
    dead_letters: Vec<StoredMessage>,
    notify: Arc<Notify>,
}

struct BrokerState {
    available: bool,
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
}

/// Thread-safe in-memory queue broker with topic exchanges.
///
/// Mirrors the acknowledgement semantics of a real queue broker:
/// - competing consumers on one queue
/// - `nack(requeue = true)` puts the message back at the head, flagged redelivered
/// - `nack(requeue = false)` and `reject` dead-letter the message
/// - a consumer dropped with unacknowledged messages hands them back to the queue
///
/// Clones share the same broker.
#[derive(Clone)]
pub struct MemoryQueueBroker {
    state: Arc<Mutex<BrokerState>>,
    next_tag: Arc<AtomicU64>,
}

impl Default for MemoryQueueBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueueBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                available: true,
                exchanges: HashSet::new(),
                queues: HashMap::new(),
            })),
            next_tag: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Simulate a broker outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        let mut state = self.state.lock();
        state.available = available;
        for queue in state.queues.values() {
            queue.notify.notify_waiters();
        }
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.state.lock().available
    }

    #[must_use]
    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.state.lock().exchanges.contains(exchange)
    }

    #[must_use]
    pub fn has_queue(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    /// Messages ready for delivery (not counting unacknowledged ones).
    #[must_use]
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages nacked without requeue or rejected.
    #[must_use]
    pub fn dead_letters(&self, queue: &str) -> Vec<StoredMessage> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.dead_letters.clone())
            .unwrap_or_default()
    }

    /// Put raw bytes straight onto a queue, bypassing exchanges.
    pub fn inject(&self, queue: &str, body: Vec<u8>) {
        let mut state = self.state.lock();
        let queue = state.queues.entry(queue.to_string()).or_default();
        queue.ready.push_back(StoredMessage {
            body,
            headers: Headers::new(),
            message_id: String::new(),
            redelivered: false,
        });
        queue.notify.notify_waiters();
    }

    fn requeue(&self, queue: &str, messages: Vec<StoredMessage>) {
        if messages.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        if let Some(queue) = state.queues.get_mut(queue) {
            for mut message in messages.into_iter().rev() {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
            queue.notify.notify_waiters();
        }
    }

    fn dead_letter(&self, queue: &str, message: StoredMessage) {
        let mut state = self.state.lock();
        if let Some(queue) = state.queues.get_mut(queue) {
            queue.dead_letters.push(message);
        }
    }
}

/// Connects clients to a [`MemoryQueueBroker`].
#[derive(Clone)]
pub struct MemoryQueueConnector {
    broker: MemoryQueueBroker,
}

impl MemoryQueueConnector {
    #[must_use]
    pub fn new(broker: MemoryQueueBroker) -> Self {
        Self { broker }
    }
}

/// A connection to a [`MemoryQueueBroker`].
pub struct MemoryQueueClient {
    broker: MemoryQueueBroker,
    open: Arc<AtomicBool>,
}

impl MemoryQueueClient {
    fn ensure_open(&self) -> Result<(), EventError> {
        if self.open.load(Ordering::SeqCst) && self.broker.is_available() {
            Ok(())
        } else {
            Err(EventError::ConnectionFailed {
                broker: BROKER.to_string(),
                cause: "connection closed".to_string(),
            })
        }
    }
}

#[async_trait]
impl Connector for MemoryQueueConnector {
    type Client = MemoryQueueClient;

    fn broker(&self) -> String {
        BROKER.to_string()
    }

    async fn connect(&self) -> Result<MemoryQueueClient, EventError> {
        if !self.broker.is_available() {
            return Err(EventError::ConnectionFailed {
                broker: BROKER.to_string(),
                cause: "broker unavailable".to_string(),
            });
        }
        Ok(MemoryQueueClient {
            broker: self.broker.clone(),
            open: Arc::new(AtomicBool::new(true)),
        })
    }

    async fn close(&self, client: &MemoryQueueClient) -> Result<(), EventError> {
        client.open.store(false, Ordering::SeqCst);
        let state = self.broker.state.lock();
        for queue in state.queues.values() {
            queue.notify.notify_waiters();
        }
        Ok(())
    }

    fn is_open(&self, client: &MemoryQueueClient) -> bool {
        client.open.load(Ordering::SeqCst) && self.broker.is_available()
    }
}

#[async_trait]
impl QueueClient for MemoryQueueClient {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), EventError> {
        self.ensure_open()?;
        self.broker
            .state
            .lock()
            .exchanges
            .insert(exchange.to_string());
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), EventError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        if !state.exchanges.contains(exchange) {
            return Err(EventError::PublishFailed {
                destination: exchange.to_string(),
                cause: "no such exchange".to_string(),
            });
        }

        for queue in state.queues.values_mut() {
            let routed = queue
                .bindings
                .iter()
                .any(|(ex, key)| ex == exchange && topic_matches(key, routing_key));
            if routed {
                queue.ready.push_back(StoredMessage {
                    body: message.body.clone(),
                    headers: message.headers.clone(),
                    message_id: message.message_id.clone(),
                    redelivered: false,
                });
                queue.notify.notify_waiters();
            }
        }
        Ok(())
    }

    async fn declare_queue(&self, queue: &str, _durable: bool) -> Result<(), EventError> {
        self.ensure_open()?;
        self.broker
            .state
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> Result<(), EventError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        if !state.exchanges.contains(exchange) {
            return Err(EventError::ConsumeFailed {
                source_name: exchange.to_string(),
                cause: "no such exchange".to_string(),
            });
        }
        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Err(EventError::ConsumeFailed {
                source_name: queue.to_string(),
                cause: "no such queue".to_string(),
            });
        };

        let binding = (exchange.to_string(), binding_key.to_string());
        if !queue_state.bindings.contains(&binding) {
            queue_state.bindings.push(binding);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, EventError> {
        self.ensure_open()?;
        if !self.broker.has_queue(queue) {
            return Err(EventError::ConsumeFailed {
                source_name: queue.to_string(),
                cause: "no such queue".to_string(),
            });
        }

        let consumer = MemoryConsumer {
            broker: self.broker.clone(),
            queue: queue.to_string(),
            open: Arc::clone(&self.open),
            prefetch: usize::from(prefetch),
            unacked: Arc::new(Mutex::new(HashMap::new())),
            failed: false,
        };

        Ok(Box::pin(stream::unfold(consumer, |mut consumer| async move {
            let item = consumer.next_delivery().await?;
            Some((item, consumer))
        })))
    }
}

type Unacked = Arc<Mutex<HashMap<u64, StoredMessage>>>;

struct MemoryConsumer {
    broker: MemoryQueueBroker,
    queue: String,
    open: Arc<AtomicBool>,
    prefetch: usize,
    unacked: Unacked,
    failed: bool,
}

enum Step {
    Deliver(Delivery),
    Fail(EventError),
    Wait(Arc<Notify>),
}

impl MemoryConsumer {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, EventError>> {
        loop {
            if self.failed || !self.open.load(Ordering::SeqCst) {
                return None;
            }

            match self.step() {
                Step::Deliver(delivery) => return Some(Ok(delivery)),
                Step::Fail(error) => {
                    self.failed = true;
                    return Some(Err(error));
                }
                Step::Wait(notify) => {
                    let _ = tokio::time::timeout(IDLE_WAIT, notify.notified()).await;
                }
            }
        }
    }

    fn step(&self) -> Step {
        let mut state = self.broker.state.lock();
        if !state.available {
            return Step::Fail(EventError::ConsumeFailed {
                source_name: self.queue.clone(),
                cause: "broker unavailable".to_string(),
            });
        }
        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return Step::Fail(EventError::ConsumeFailed {
                source_name: self.queue.clone(),
                cause: "queue deleted".to_string(),
            });
        };

        let mut unacked = self.unacked.lock();
        let has_credit = self.prefetch == 0 || unacked.len() < self.prefetch;
        if has_credit {
            if let Some(message) = queue.ready.pop_front() {
                let tag = self.broker.next_tag.fetch_add(1, Ordering::SeqCst);
                unacked.insert(tag, message.clone());
                return Step::Deliver(Delivery {
                    body: message.body,
                    headers: message.headers,
                    redelivered: message.redelivered,
                    acker: Arc::new(MemoryAcker {
                        broker: self.broker.clone(),
                        queue: self.queue.clone(),
                        tag,
                        unacked: Arc::clone(&self.unacked),
                    }),
                });
            }
        }
        Step::Wait(Arc::clone(&queue.notify))
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        let mut pending: Vec<(u64, StoredMessage)> = self.unacked.lock().drain().collect();
        pending.sort_by_key(|(tag, _)| *tag);
        self.broker
            .requeue(&self.queue, pending.into_iter().map(|(_, m)| m).collect());
    }
}

struct MemoryAcker {
    broker: MemoryQueueBroker,
    queue: String,
    tag: u64,
    unacked: Unacked,
}

impl MemoryAcker {
    fn take(&self) -> Result<StoredMessage, EventError> {
        self.unacked
            .lock()
            .remove(&self.tag)
            .ok_or_else(|| EventError::ConsumeFailed {
                source_name: self.queue.clone(),
                cause: format!("unknown delivery tag {}", self.tag),
            })
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), EventError> {
        self.take().map(|_| ())
    }

    async fn nack(&self, requeue: bool) -> Result<(), EventError> {
        let message = self.take()?;
        if requeue {
            self.broker.requeue(&self.queue, vec![message]);
        } else {
            self.broker.dead_letter(&self.queue, message);
        }
        Ok(())
    }

    async fn reject(&self) -> Result<(), EventError> {
        let message = self.take()?;
        self.broker.dead_letter(&self.queue, message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    async fn connected(broker: &MemoryQueueBroker) -> MemoryQueueClient {
        let client = MemoryQueueConnector::new(broker.clone())
            .connect()
            .await
            .unwrap();
        client.declare_exchange("ex").await.unwrap();
        client
    }

    fn message(body: &str) -> OutboundMessage {
        OutboundMessage {
            body: body.as_bytes().to_vec(),
            headers: Headers::new(),
            message_id: body.to_string(),
            persistent: true,
        }
    }

    async fn bound(client: &MemoryQueueClient, queue: &str, key: &str) {
        client.declare_queue(queue, true).await.unwrap();
        client.bind_queue(queue, "ex", key).await.unwrap();
    }

    #[tokio::test]
    async fn test_routing_fans_out_to_matching_queues() {
        let broker = MemoryQueueBroker::new();
        let client = connected(&broker).await;
        bound(&client, "all", "#").await;
        bound(&client, "bookings", "booking.*").await;
        bound(&client, "skills", "skill.*").await;

        client
            .publish("ex", "booking.created", message("b1"))
            .await
            .unwrap();

        assert_eq!(broker.queue_depth("all"), 1);
        assert_eq!(broker.queue_depth("bookings"), 1);
        assert_eq!(broker.queue_depth("skills"), 0);
    }

    #[tokio::test]
    async fn test_publish_to_unknown_exchange_fails() {
        let broker = MemoryQueueBroker::new();
        let client = connected(&broker).await;
        let result = client.publish("missing", "a.b", message("x")).await;
        assert!(matches!(result, Err(EventError::PublishFailed { .. })));
    }

    #[tokio::test]
    async fn test_nack_requeue_and_dead_letter() {
        let broker = MemoryQueueBroker::new();
        let client = connected(&broker).await;
        bound(&client, "q", "#").await;
        client.publish("ex", "a.b", message("m1")).await.unwrap();

        let mut deliveries = client.consume("q", 0).await.unwrap();

        let first = deliveries.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        first.acker.nack(true).await.unwrap();

        let second = deliveries.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_eq!(second.body, b"m1");
        second.acker.reject().await.unwrap();

        assert_eq!(broker.queue_depth("q"), 0);
        assert_eq!(broker.dead_letters("q").len(), 1);

        // Settling twice is a broker-side error
        assert!(second.acker.ack().await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_consumer_requeues_unacked() {
        let broker = MemoryQueueBroker::new();
        let client = connected(&broker).await;
        bound(&client, "q", "#").await;
        client.publish("ex", "a.b", message("m1")).await.unwrap();

        {
            let mut deliveries = client.consume("q", 0).await.unwrap();
            let delivery = deliveries.next().await.unwrap().unwrap();
            assert_eq!(delivery.body, b"m1");
            assert_eq!(broker.queue_depth("q"), 0);
        }

        assert_eq!(broker.queue_depth("q"), 1);
        let mut deliveries = client.consume("q", 0).await.unwrap();
        let again = deliveries.next().await.unwrap().unwrap();
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_prefetch_limits_unacked() {
        let broker = MemoryQueueBroker::new();
        let client = connected(&broker).await;
        bound(&client, "q", "#").await;
        client.publish("ex", "a", message("1")).await.unwrap();
        client.publish("ex", "a", message("2")).await.unwrap();

        let mut deliveries = client.consume("q", 1).await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(100), deliveries.next()).await;
        assert!(blocked.is_err());

        first.acker.ack().await.unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.body, b"2");
    }

    #[tokio::test]
    async fn test_outage_fails_consumers() {
        let broker = MemoryQueueBroker::new();
        let client = connected(&broker).await;
        bound(&client, "q", "#").await;
        let mut deliveries = client.consume("q", 0).await.unwrap();

        broker.set_available(false);
        let item = deliveries.next().await.unwrap();
        assert!(item.is_err());
        assert!(deliveries.next().await.is_none());

        let connector = MemoryQueueConnector::new(broker.clone());
        assert!(!connector.is_open(&client));
        assert!(connector.connect().await.is_err());
    }
}

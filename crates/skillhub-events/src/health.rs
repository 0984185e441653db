//! Health check types.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::channel::{ReliableTransport, StreamTransport};
use crate::error::EventError;

/// Point-in-time health of both channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Reliable channel connected and open.
    pub reliable: bool,
    /// Stream channel connected and open, with every stream consumer joined.
    pub stream: bool,
    /// Both channels healthy.
    pub overall: bool,
    /// Stream writes that failed under the `require-reliable` policy.
    pub stream_publish_failures: u64,
    pub handler_failures: u64,
    pub handler_panics: u64,
    pub last_stream_error: Option<String>,
    /// Stream subscriptions currently rejoining their consumer group.
    pub stream_consumers_down: u64,
}

impl HealthStatus {
    /// Check if the bus is healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.overall
    }
}

/// Aggregates channel health and failure counters.
pub struct HealthMonitor {
    reliable: Arc<dyn ReliableTransport>,
    stream: Arc<dyn StreamTransport>,
    stream_publish_failures: AtomicU64,
    handler_failures: AtomicU64,
    handler_panics: AtomicU64,
    last_stream_error: Mutex<Option<String>>,
    stream_consumers_down: AtomicU64,
}

impl HealthMonitor {
    pub fn new(reliable: Arc<dyn ReliableTransport>, stream: Arc<dyn StreamTransport>) -> Self {
        Self {
            reliable,
            stream,
            stream_publish_failures: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            handler_panics: AtomicU64::new(0),
            last_stream_error: Mutex::new(None),
            stream_consumers_down: AtomicU64::new(0),
        }
    }

    /// Recompute channel health now.
    #[must_use]
    pub fn check(&self) -> HealthStatus {
        let reliable = self.reliable.is_healthy();
        let stream_consumers_down = self.stream_consumers_down.load(Ordering::SeqCst);
        let stream = self.stream.is_healthy() && stream_consumers_down == 0;
        HealthStatus {
            reliable,
            stream,
            overall: reliable && stream,
            stream_publish_failures: self.stream_publish_failures.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
            last_stream_error: self.last_stream_error.lock().clone(),
            stream_consumers_down,
        }
    }

    pub fn record_stream_failure(&self, error: &EventError) {
        self.stream_publish_failures.fetch_add(1, Ordering::Relaxed);
        *self.last_stream_error.lock() = Some(error.to_string());
    }

    pub fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_panic(&self) {
        self.handler_panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark one stream consumer as out of its group until the guard drops.
    #[must_use]
    pub fn stream_consumer_outage(&self) -> ConsumerOutage<'_> {
        self.stream_consumers_down.fetch_add(1, Ordering::SeqCst);
        ConsumerOutage { monitor: self }
    }
}

/// Held by a stream subscription while it has no live consumer.
pub struct ConsumerOutage<'a> {
    monitor: &'a HealthMonitor,
}

impl Drop for ConsumerOutage<'_> {
    fn drop(&mut self) {
        self.monitor
            .stream_consumers_down
            .fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{
        MemoryLogBroker, MemoryLogConnector, MemoryQueueBroker, MemoryQueueConnector,
    };
    use crate::channel::{Channel, ReliableChannel, StreamChannel};
    use crate::retry::RetryPolicy;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        reliable: Arc<ReliableChannel<MemoryQueueConnector>>,
        stream: Arc<StreamChannel<MemoryLogConnector>>,
        monitor: HealthMonitor,
    }

    fn fixture() -> Fixture {
        let reliable = Arc::new(ReliableChannel::new(
            MemoryQueueConnector::new(MemoryQueueBroker::new()),
            "health.events",
            RetryPolicy::disabled(),
        ));
        let stream = Arc::new(StreamChannel::new(
            MemoryLogConnector::new(MemoryLogBroker::new()),
            RetryPolicy::disabled(),
        ));
        let monitor = HealthMonitor::new(reliable.clone(), stream.clone());
        Fixture {
            reliable,
            stream,
            monitor,
        }
    }

    #[tokio::test]
    async fn test_overall_requires_both_channels() {
        let f = fixture();
        let cancel = CancellationToken::new();

        let status = f.monitor.check();
        assert!(!status.reliable && !status.stream && !status.overall);

        f.reliable.connect(&cancel).await.unwrap();
        let status = f.monitor.check();
        assert!(status.reliable);
        assert!(!status.stream);
        assert!(!status.overall);
        assert!(!status.is_healthy());

        f.stream.connect(&cancel).await.unwrap();
        assert!(f.monitor.check().is_healthy());

        f.stream.close().await.unwrap();
        assert!(!f.monitor.check().overall);
    }

    #[test]
    fn test_counters() {
        let f = fixture();
        f.monitor.record_handler_failure();
        f.monitor.record_handler_failure();
        f.monitor.record_handler_panic();
        f.monitor.record_stream_failure(&EventError::NotConnected);

        let status = f.monitor.check();
        assert_eq!(status.handler_failures, 2);
        assert_eq!(status.handler_panics, 1);
        assert_eq!(status.stream_publish_failures, 1);
        assert_eq!(status.last_stream_error.as_deref(), Some("Not connected"));
    }

    #[tokio::test]
    async fn test_stream_needs_every_consumer_joined() {
        let f = fixture();
        let cancel = CancellationToken::new();
        f.reliable.connect(&cancel).await.unwrap();
        f.stream.connect(&cancel).await.unwrap();

        let outage = f.monitor.stream_consumer_outage();
        let status = f.monitor.check();
        assert!(status.reliable);
        assert!(!status.stream);
        assert!(!status.overall);
        assert_eq!(status.stream_consumers_down, 1);

        drop(outage);
        let status = f.monitor.check();
        assert!(status.is_healthy());
        assert_eq!(status.stream_consumers_down, 0);
    }
}
